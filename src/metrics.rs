use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Process-wide counters for routing, CNAME verification and access tracking.
pub struct ServiceMetrics {
    registry: Registry,
    requests_total: IntCounter,
    external_routes_total: IntCounter,
    route_failures_total: IntCounter,
    cname_cache_hits_total: IntCounter,
    cname_cache_misses_total: IntCounter,
    cname_lookup_failures_total: IntCounter,
    ask_allowed_total: IntCounter,
    ask_denied_total: IntCounter,
    tracker_failures_total: IntCounter,
}

impl ServiceMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let requests_total = counter(
            "oracolo_requests_total",
            "Total number of page requests dispatched by host",
        )?;
        let external_routes_total = counter(
            "oracolo_external_routes_total",
            "Number of requests routed through a verified external CNAME",
        )?;
        let route_failures_total = counter(
            "oracolo_route_failures_total",
            "Number of requests rejected during host classification or label decoding",
        )?;
        let cname_cache_hits_total = counter(
            "oracolo_cname_cache_hits_total",
            "Number of CNAME resolutions served from cache",
        )?;
        let cname_cache_misses_total = counter(
            "oracolo_cname_cache_misses_total",
            "Number of CNAME resolutions that required a DNS query",
        )?;
        let cname_lookup_failures_total = counter(
            "oracolo_cname_lookup_failures_total",
            "Number of CNAME DNS queries that failed or timed out",
        )?;
        let ask_allowed_total = counter(
            "oracolo_ask_allowed_total",
            "Number of certificate permission checks that were allowed",
        )?;
        let ask_denied_total = counter(
            "oracolo_ask_denied_total",
            "Number of certificate permission checks that were denied",
        )?;
        let tracker_failures_total = counter(
            "oracolo_tracker_failures_total",
            "Number of domain access records that failed to persist",
        )?;

        Ok(Self {
            registry,
            requests_total,
            external_routes_total,
            route_failures_total,
            cname_cache_hits_total,
            cname_cache_misses_total,
            cname_lookup_failures_total,
            ask_allowed_total,
            ask_denied_total,
            tracker_failures_total,
        })
    }

    pub fn inc_request(&self) {
        self.requests_total.inc();
    }

    pub fn inc_external_route(&self) {
        self.external_routes_total.inc();
    }

    pub fn inc_route_failure(&self) {
        self.route_failures_total.inc();
    }

    pub fn inc_cache_hit(&self) {
        self.cname_cache_hits_total.inc();
    }

    pub fn inc_cache_miss(&self) {
        self.cname_cache_misses_total.inc();
    }

    pub fn inc_lookup_failure(&self) {
        self.cname_lookup_failures_total.inc();
    }

    pub fn inc_ask(&self, allowed: bool) {
        if allowed {
            self.ask_allowed_total.inc();
        } else {
            self.ask_denied_total.inc();
        }
    }

    pub fn inc_tracker_failure(&self) {
        self.tracker_failures_total.inc();
    }

    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}
