use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

const DEFAULT_LISTEN: &str = "0.0.0.0:45070";
const DEFAULT_CACHE_CAPACITY: u64 = 1024;
const DEFAULT_POSITIVE_TTL: u64 = 2 * 60 * 60;
const DEFAULT_NEGATIVE_TTL: u64 = 5 * 60;
const DEFAULT_DNS_TIMEOUT_MS: u64 = 5_000;
const MAX_CACHE_TTL: u64 = 365 * 24 * 60 * 60;
const TRACKER_FILENAME: &str = "domains.sqlite";

/// Runtime configuration parsed from `oracolo.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default)]
    pub page: PageSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Root domain this service answers for. Reserved subdomains and CNAME
    /// targets must terminate here.
    #[serde(default)]
    pub base_domain: String,
    #[serde(default)]
    pub admin_listen: Option<String>,
    /// Re-read page templates from disk on every render.
    #[serde(default)]
    pub development: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            base_domain: String::new(),
            admin_listen: None,
            development: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_capacity")]
    pub capacity: u64,
    #[serde(default = "default_positive_ttl")]
    pub positive_ttl_seconds: u64,
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl_seconds: u64,
    #[serde(default = "default_dns_timeout_ms")]
    pub dns_timeout_ms: u64,
}

impl CacheSection {
    pub fn positive_ttl(&self) -> Duration {
        Duration::from_secs(self.positive_ttl_seconds)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_seconds)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            positive_ttl_seconds: default_positive_ttl(),
            negative_ttl_seconds: default_negative_ttl(),
            dns_timeout_ms: default_dns_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSection {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl TrackerSection {
    /// Location of the domain access database, falling back to the platform data directory.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join(TRACKER_FILENAME)),
        }
    }
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSection {
    /// HTML template containing the parameter marker. Built-in shell when unset.
    #[serde(default)]
    pub template: Option<PathBuf>,
    /// Page served on the bare base domain.
    #[serde(default)]
    pub home: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json: bool,
    /// Directory receiving daily-rotated JSON logs.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl ServiceConfig {
    /// Load configuration from disk, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read config at {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Malformed config at {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let parsed: Self = toml::from_str(raw)?;
        Ok(parsed)
    }

    /// Apply `BASE_DOMAIN`, `PORT` and `ORACOLO_DEVELOPMENT` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base) = lookup("BASE_DOMAIN") {
            self.server.base_domain = base.trim().to_string();
        }
        if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid PORT value: {port}"))?;
            let mut addr: SocketAddr = self
                .server
                .listen
                .parse()
                .with_context(|| format!("Invalid listen address: {}", self.server.listen))?;
            addr.set_port(port);
            self.server.listen = addr.to_string();
        }
        if let Some(flag) = lookup("ORACOLO_DEVELOPMENT") {
            self.server.development = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        Ok(())
    }

    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> Result<()> {
        let base = self.server.base_domain.as_str();
        if base.is_empty() {
            bail!("server.base_domain is required (set it in the config file or BASE_DOMAIN)");
        }
        if base.contains("://") || base.contains('/') {
            bail!("server.base_domain must be a bare domain name, got {base}");
        }
        if base.starts_with('.') || base.ends_with('.') {
            bail!("server.base_domain must not start or end with a dot, got {base}");
        }
        self.server
            .listen
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen))?;
        if let Some(admin) = &self.server.admin_listen {
            admin
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid admin listen address: {admin}"))?;
        }
        if self.cache.capacity == 0 {
            bail!("cache.capacity must be greater than zero");
        }
        if self.cache.positive_ttl_seconds == 0 || self.cache.negative_ttl_seconds == 0 {
            bail!("cache TTLs must be greater than zero");
        }
        if self.cache.positive_ttl_seconds > MAX_CACHE_TTL
            || self.cache.negative_ttl_seconds > MAX_CACHE_TTL
        {
            bail!("cache TTLs must not exceed {MAX_CACHE_TTL} seconds");
        }
        Ok(())
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("me", "oracolo", "Oracolo")
        .context("Unable to resolve platform config directory")
}

/// Default location of `oracolo.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("oracolo.toml"))
}

fn default_listen() -> String {
    DEFAULT_LISTEN.into()
}

fn default_cache_capacity() -> u64 {
    DEFAULT_CACHE_CAPACITY
}

fn default_positive_ttl() -> u64 {
    DEFAULT_POSITIVE_TTL
}

fn default_negative_ttl() -> u64 {
    DEFAULT_NEGATIVE_TTL
}

fn default_dns_timeout_ms() -> u64 {
    DEFAULT_DNS_TIMEOUT_MS
}

fn bool_true() -> bool {
    true
}
