use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use oracolo::config::{ServiceConfig, default_config_path};
use oracolo::metrics::ServiceMetrics;
use oracolo::server::{OracoloServer, classifier_from_config};
use oracolo::telemetry::init_tracing;
use oracolo::tracker::DomainTracker;
use serde_json::json;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "oracolo", version, about = "CNAME-routed multi-tenant page host", long_about = None)]
struct Args {
    /// Override path to oracolo.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the page server (default).
    Serve,
    /// Print domain access statistics as JSON.
    Stats {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Decode a subdomain label and print its parameters.
    Decode { label: String },
    /// Resolve a domain's CNAME and report whether a certificate would be allowed.
    Check { domain: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut config = ServiceConfig::load_or_default(&config_path)?;
    config.apply_env_overrides()?;
    init_tracing(args.verbose, &config.logging)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            config.validate()?;
            info!(config = %config_path.display(), "Loaded configuration");
            OracoloServer::new(config)?.run().await
        }
        Command::Stats { limit } => {
            let path = config.tracker.resolve_path()?;
            let tracker = DomainTracker::open(&path)?;
            let report = tracker.report(limit).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Decode { label } => {
            let params = oracolo::params::decode(&label)?;
            println!("{}", serde_json::to_string_pretty(&params)?);
            Ok(())
        }
        Command::Check { domain } => {
            config.validate()?;
            let metrics =
                Arc::new(ServiceMetrics::new().context("Failed to initialise metrics")?);
            let classifier = classifier_from_config(&config, metrics);
            let cname = classifier.resolver().resolve(&domain).await;
            let allowed = classifier.ask_permission(&domain).await;
            let report = json!({
                "domain": domain,
                "base_domain": classifier.base_domain(),
                "cname": cname,
                "allowed": allowed,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
