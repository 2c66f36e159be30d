//! CNAME resolution behind a bounded, TTL-differentiated cache.
//!
//! Successful lookups are cached for the positive TTL and failures (no
//! record, timeout, any resolver error) are cached as an empty target for the
//! much shorter negative TTL. Callers only ever see a target string; an empty
//! string means the domain is unusable.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use futures_util::future::BoxFuture;
use hickory_proto::rr::{RData, RecordType};
use hickory_resolver::TokioResolver;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use moka::Expiry;
use moka::future::Cache;
use tracing::{debug, warn};

use crate::config::CacheSection;
use crate::metrics::ServiceMetrics;

/// Source of CNAME answers. Returns the fully-qualified target (trailing dot).
pub trait CnameLookup: Send + Sync {
    fn lookup_cname<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// CNAME lookups against the system resolver configuration.
pub struct DnsCnameLookup {
    resolver: TokioResolver,
}

impl DnsCnameLookup {
    pub fn from_system(timeout: Duration) -> Self {
        let mut builder = match TokioResolver::builder_tokio() {
            Ok(builder) => builder,
            Err(err) => {
                warn!(
                    error = %err,
                    "System resolver configuration unavailable; falling back to Cloudflare"
                );
                TokioResolver::builder_with_config(
                    ResolverConfig::cloudflare(),
                    TokioConnectionProvider::default(),
                )
            }
        };
        let options = builder.options_mut();
        options.timeout = timeout;
        options.attempts = 1;
        Self {
            resolver: builder.build(),
        }
    }
}

impl CnameLookup for DnsCnameLookup {
    fn lookup_cname<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let name = fully_qualified(domain);
            let answer = self
                .resolver
                .lookup(name.as_str(), RecordType::CNAME)
                .await
                .with_context(|| format!("CNAME query for {domain} failed"))?;
            answer
                .iter()
                .find_map(|rdata| match rdata {
                    RData::CNAME(cname) => Some(fully_qualified(&cname.0.to_ascii())),
                    _ => None,
                })
                .ok_or_else(|| anyhow!("no CNAME record for {domain}"))
        })
    }
}

fn fully_qualified(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// Capacity and TTL policy for [`CnameResolver`].
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub capacity: u64,
    pub positive_ttl: Duration,
    pub negative_ttl: Duration,
    pub lookup_timeout: Duration,
}

impl CachePolicy {
    pub fn from_section(section: &CacheSection) -> Self {
        Self {
            capacity: section.capacity,
            positive_ttl: section.positive_ttl(),
            negative_ttl: section.negative_ttl(),
            lookup_timeout: section.dns_timeout(),
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_section(&CacheSection::default())
    }
}

struct TargetExpiry {
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl TargetExpiry {
    fn ttl_for(&self, target: &str) -> Duration {
        if target.is_empty() {
            self.negative_ttl
        } else {
            self.positive_ttl
        }
    }
}

impl Expiry<String, String> for TargetExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &String,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.ttl_for(value))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &String,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        // Every write restarts the clock with the TTL of the new outcome.
        Some(self.ttl_for(value))
    }
}

/// Cached CNAME resolver shared by every request handler.
pub struct CnameResolver {
    lookup: Arc<dyn CnameLookup>,
    cache: Cache<String, String>,
    policy: CachePolicy,
    metrics: Arc<ServiceMetrics>,
}

impl CnameResolver {
    pub fn new(
        lookup: Arc<dyn CnameLookup>,
        policy: CachePolicy,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(policy.capacity)
            .expire_after(TargetExpiry {
                positive_ttl: policy.positive_ttl,
                negative_ttl: policy.negative_ttl,
            })
            .build();
        Self {
            lookup,
            cache,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Resolve `domain` to its CNAME target, or `""` when it has none.
    pub async fn resolve(&self, domain: &str) -> String {
        if let Some(target) = self.cache.get(domain).await {
            self.metrics.inc_cache_hit();
            return target;
        }
        self.metrics.inc_cache_miss();

        let target = match tokio::time::timeout(
            self.policy.lookup_timeout,
            self.lookup.lookup_cname(domain),
        )
        .await
        {
            Ok(Ok(target)) => target,
            Ok(Err(err)) => {
                self.metrics.inc_lookup_failure();
                debug!(domain, error = %err, "CNAME lookup failed");
                String::new()
            }
            Err(_) => {
                self.metrics.inc_lookup_failure();
                debug!(
                    domain,
                    timeout_ms = self.policy.lookup_timeout.as_millis() as u64,
                    "CNAME lookup timed out"
                );
                String::new()
            }
        };

        self.cache.insert(domain.to_string(), target.clone()).await;
        target
    }
}
