use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tracing::Subscriber;
use tracing::subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::LoggingSection;

const LOG_FILE_PREFIX: &str = "oracolo.log";

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

fn install_subscriber<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    subscriber::set_global_default(subscriber)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "oracolo=debug"
    } else {
        "oracolo=info"
    }
}

/// Install the global subscriber: console output (plain or JSON) plus an
/// optional daily-rotated JSON file.
pub fn init_tracing(verbose: bool, logging: &LoggingSection) -> Result<()> {
    let default_level = default_directive(verbose);
    let make_env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match &logging.directory {
        Some(directory) => Some(build_file_writer(directory)?),
        None => None,
    };

    match (logging.json, file_layer) {
        (false, None) => {
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().with_target(false));
            install_subscriber(subscriber)?;
        }
        (true, None) => {
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().json().with_current_span(true));
            install_subscriber(subscriber)?;
        }
        (json, Some((writer, guard))) => {
            let file = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_writer(writer)
                .with_filter(LevelFilter::DEBUG);
            let console = if json {
                fmt::layer().json().with_current_span(true).boxed()
            } else {
                fmt::layer().with_target(false).boxed()
            };
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(console)
                .with(file);
            let _ = LOG_GUARD.set(guard);
            install_subscriber(subscriber)?;
        }
    }

    Ok(())
}

fn build_file_writer(directory: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;
    let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    Ok((writer, guard))
}
