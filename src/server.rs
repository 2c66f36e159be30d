use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{TimeDelta, Utc};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::cname::{CachePolicy, CnameResolver, DnsCnameLookup};
use crate::config::ServiceConfig;
use crate::metrics::{PROMETHEUS_CONTENT_TYPE, ServiceMetrics};
use crate::params;
use crate::render::{HomePage, PageTemplate};
use crate::route::{HostClassifier, Route, RouteError};
use crate::tracker::DomainTracker;

const HOME_BANNER: &str = "oracolo\n";
const DEFAULT_STATS_LIMIT: usize = 20;
const MAX_STATS_LIMIT: usize = 500;

/// Shared state handed to every request handler.
pub struct AppState {
    pub classifier: HostClassifier,
    pub tracker: Option<DomainTracker>,
    pub page: Arc<PageTemplate>,
    pub home: Option<Arc<HomePage>>,
    pub metrics: Arc<ServiceMetrics>,
    /// Seconds shared caches may keep a page served for an external domain.
    pub cache_max_age: u64,
}

/// Build the CNAME-backed classifier described by `config`.
pub fn classifier_from_config(
    config: &ServiceConfig,
    metrics: Arc<ServiceMetrics>,
) -> HostClassifier {
    let policy = CachePolicy::from_section(&config.cache);
    let lookup = Arc::new(DnsCnameLookup::from_system(policy.lookup_timeout));
    let resolver = Arc::new(CnameResolver::new(lookup, policy, metrics));
    HostClassifier::new(config.server.base_domain.clone(), resolver)
}

/// Public page listener plus the optional admin listener.
pub struct OracoloServer {
    config: Arc<ServiceConfig>,
    state: Arc<AppState>,
}

impl OracoloServer {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let metrics = Arc::new(ServiceMetrics::new().context("Failed to initialise metrics")?);
        let classifier = classifier_from_config(&config, metrics.clone());

        let tracker = if config.tracker.enabled {
            Some(DomainTracker::open(config.tracker.resolve_path()?)?)
        } else {
            info!("Domain access tracking disabled");
            None
        };

        let reload = config.server.development;
        let page = match &config.page.template {
            Some(path) => PageTemplate::from_file(path, reload)?,
            None => PageTemplate::builtin(),
        };
        let home = config
            .page
            .home
            .as_deref()
            .map(|path| HomePage::from_file(path, reload))
            .transpose()?;

        let state = Arc::new(AppState {
            cache_max_age: classifier.resolver().policy().positive_ttl.as_secs(),
            classifier,
            tracker,
            page: Arc::new(page),
            home: home.map(Arc::new),
            metrics,
        });

        Ok(Self {
            config: Arc::new(config),
            state,
        })
    }

    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .server
            .listen
            .parse()
            .context("Invalid listener address")?;

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind listener at {addr}"))?;

        info!(
            listener = %addr,
            base_domain = %self.state.classifier.base_domain(),
            development = self.config.server.development,
            "Starting oracolo"
        );

        let page_server = axum::serve(listener, router(self.state.clone()).into_make_service())
            .with_graceful_shutdown(shutdown_signal());

        if let Some(admin_addr) = self.config.server.admin_listen.clone() {
            tokio::try_join!(
                async {
                    page_server
                        .await
                        .context("Page server terminated unexpectedly")
                },
                async { run_admin_server(&admin_addr, self.state.clone()).await },
            )?;
        } else {
            page_server
                .await
                .context("Page server terminated unexpectedly")?;
        }

        Ok(())
    }
}

/// Routes for the public listener: `/ask` plus host-dispatched pages.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ask", get(ask_handler))
        .fallback(page_handler)
        .with_state(state)
}

/// Routes for the admin listener.
pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate_signal() => {}
    }
    info!("Shutdown signal received; stopping oracolo");
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(err) => {
            warn!(error = %err, "Failed to register SIGTERM handler; relying on ctrl-c");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await
}

async fn run_admin_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid admin listener address: {addr}"))?;

    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind admin listener at {socket_addr}"))?;

    info!(listener = %socket_addr, "Starting admin server");

    axum::serve(listener, admin_router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Admin server terminated unexpectedly")
}

#[derive(Debug, Deserialize)]
struct AskQuery {
    #[serde(default)]
    domain: String,
}

async fn ask_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AskQuery>,
) -> StatusCode {
    let allowed = state.classifier.ask_permission(&query.domain).await;
    state.metrics.inc_ask(allowed);
    if allowed {
        StatusCode::OK
    } else {
        debug!(domain = %query.domain, "refusing certificate request");
        StatusCode::BAD_REQUEST
    }
}

fn request_host<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> &'a str {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.host())
        .unwrap_or_default()
}

async fn page_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    state.metrics.inc_request();
    let host = request_host(&headers, &uri);

    let route = match state.classifier.classify(host).await {
        Ok(route) => route,
        Err(err) => {
            state.metrics.inc_route_failure();
            debug!(host, error = %err, "unable to route request");
            return err.into_response();
        }
    };

    let label = match &route {
        Route::Home => return home_response(&state, uri.path()),
        Route::Subdomain { label } | Route::External { label, .. } => label,
    };

    let params = match params::decode(label) {
        Ok(params) => params,
        Err(err) => {
            state.metrics.inc_route_failure();
            return RouteError::from(err).into_response();
        }
    };

    let page = match state.page.render(&params) {
        Ok(page) => page,
        Err(err) => {
            error!(host, error = %err, "Failed to render page");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to render page").into_response();
        }
    };

    let mut response = html_response(page);
    if let Route::External { domain, label } = route {
        state.metrics.inc_external_route();
        record_access(&state, domain, label);
        insert_cache_headers(response.headers_mut(), state.cache_max_age);
    }
    response
}

fn home_response(state: &AppState, path: &str) -> Response {
    if path != "/" {
        return StatusCode::NOT_FOUND.into_response();
    }
    match &state.home {
        Some(home) => match home.render() {
            Ok(body) => html_response(body),
            Err(err) => {
                error!(error = %err, "Failed to load home page");
                (StatusCode::INTERNAL_SERVER_ERROR, "failed to load home page").into_response()
            }
        },
        None => HOME_BANNER.into_response(),
    }
}

fn html_response(body: String) -> Response {
    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

// Detached so a client hanging up mid-response cannot cancel the write.
fn record_access(state: &Arc<AppState>, domain: String, label: String) {
    let Some(tracker) = state.tracker.clone() else {
        return;
    };
    let metrics = state.metrics.clone();
    tokio::spawn(async move {
        if let Err(err) = tracker.record(&domain, &label).await {
            metrics.inc_tracker_failure();
            warn!(domain = %domain, error = %err, "Failed to record domain access");
        }
    });
}

fn insert_cache_headers(headers: &mut HeaderMap, max_age: u64) {
    let cache_control = format!("public, max-age={max_age}");
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    // Out-of-range expiries leave Cache-Control alone in charge.
    let expires = i64::try_from(max_age)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl));
    if let Some(expires) = expires {
        let formatted = expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&formatted) {
            headers.insert(header::EXPIRES, value);
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => {
            error!(error = %err, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    limit: Option<usize>,
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let Some(tracker) = &state.tracker else {
        return (StatusCode::NOT_FOUND, "domain tracking is disabled").into_response();
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_STATS_LIMIT)
        .min(MAX_STATS_LIMIT);
    match tracker.report(limit).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            error!(error = %err, "Failed to query domain statistics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to query statistics").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cname::testing::StubLookup;
    use crate::identity::testing::npub_for;
    use crate::render::PARAMS_MARKER;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    struct Harness {
        state: Arc<AppState>,
        stub: Arc<StubLookup>,
        _dir: TempDir,
    }

    fn harness(answers: &[(&str, &str)]) -> Harness {
        let dir = tempdir().expect("tempdir");
        let stub = Arc::new(StubLookup::with_answers(answers));
        let metrics = Arc::new(ServiceMetrics::new().expect("metrics"));
        let resolver = Arc::new(CnameResolver::new(
            stub.clone(),
            CachePolicy::default(),
            metrics.clone(),
        ));
        let tracker =
            DomainTracker::open(dir.path().join("domains.sqlite")).expect("open tracker");
        let page = PageTemplate::parse(&format!("<head>\n{PARAMS_MARKER}{PARAMS_MARKER}</head>"))
            .expect("template");
        let state = Arc::new(AppState {
            classifier: HostClassifier::new("base.tld", resolver),
            tracker: Some(tracker),
            page: Arc::new(page),
            home: Some(Arc::new(HomePage::from_string("<h1>home</h1>"))),
            metrics,
            cache_max_age: 7200,
        });
        Harness {
            state,
            stub,
            _dir: dir,
        }
    }

    async fn send(router: Router, host: &str, uri: &str) -> (StatusCode, HeaderMap, String) {
        let request = Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .body(Body::empty())
            .expect("request");
        let response = router.oneshot(request).await.expect("response");
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, headers, String::from_utf8_lossy(&body).into_owned())
    }

    async fn wait_for_count(tracker: &DomainTracker, expected: u64) -> u64 {
        for _ in 0..50 {
            let total = tracker.stats().await.expect("stats").total_requests;
            if total >= expected {
                return total;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        tracker.stats().await.expect("stats").total_requests
    }

    #[tokio::test]
    async fn base_domain_serves_home_page_without_dns() {
        let h = harness(&[]);
        let (status, headers, body) = send(router(h.state.clone()), "base.tld", "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<h1>home</h1>");
        assert!(headers.get(header::CACHE_CONTROL).is_none());
        assert_eq!(h.stub.calls(), 0);

        let (status, _, _) = send(router(h.state.clone()), "base.tld", "/elsewhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reserved_subdomain_renders_parameters() {
        let h = harness(&[]);
        let npub = npub_for(1);
        let host = format!("{npub}.t-foo-bar.base.tld");
        let (status, headers, body) = send(router(h.state.clone()), &host, "/").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(&format!(r#"<meta name="author" content="{npub}">"#)));
        assert!(body.contains(r#"<meta name="topics" content="foo,bar">"#));
        assert!(headers.get(header::CACHE_CONTROL).is_none());
        assert_eq!(h.stub.calls(), 0);
        let tracker = h.state.tracker.as_ref().expect("tracker");
        assert_eq!(tracker.stats().await.expect("stats").total_requests, 0);
    }

    #[tokio::test]
    async fn external_domain_is_rendered_cached_and_tracked() {
        let h = harness(&[("customer.com", "t-nostr.base.tld.")]);
        let (status, headers, body) = send(router(h.state.clone()), "customer.com", "/").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#"<meta name="topics" content="nostr">"#));
        assert_eq!(
            headers.get(header::CACHE_CONTROL).and_then(|v| v.to_str().ok()),
            Some("public, max-age=7200")
        );
        let expires = headers
            .get(header::EXPIRES)
            .and_then(|v| v.to_str().ok())
            .expect("expires header");
        assert!(expires.ends_with(" GMT"));

        let tracker = h.state.tracker.as_ref().expect("tracker");
        assert_eq!(wait_for_count(tracker, 1).await, 1);
        let record = tracker.top_domains(1).await.expect("top").remove(0);
        assert_eq!(record.domain, "customer.com");
        assert_eq!(record.target_subdomain, "t-nostr");
    }

    #[tokio::test]
    async fn external_domain_without_cname_is_bad_request() {
        let h = harness(&[]);
        let (status, _, body) = send(router(h.state.clone()), "nocname.com", "/").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "missing CNAME record for nocname.com");
    }

    #[tokio::test]
    async fn external_domain_with_foreign_cname_is_not_found() {
        let h = harness(&[("evil.com", "unrelated.org.")]);
        let (status, _, body) = send(router(h.state.clone()), "evil.com", "/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "invalid CNAME 'unrelated.org.' doesn't end with 'base.tld.'");
        let tracker = h.state.tracker.as_ref().expect("tracker");
        assert_eq!(tracker.stats().await.expect("stats").total_domains, 0);
    }

    #[tokio::test]
    async fn invalid_npub_is_bad_request_and_not_tracked() {
        let h = harness(&[("customer.com", "npub1invalid.base.tld.")]);
        let (status, headers, body) = send(router(h.state.clone()), "customer.com", "/").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "invalid npub 'npub1invalid'");
        assert!(headers.get(header::CACHE_CONTROL).is_none());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let tracker = h.state.tracker.as_ref().expect("tracker");
        assert_eq!(tracker.stats().await.expect("stats").total_domains, 0);
    }

    #[tokio::test]
    async fn ask_endpoint_reflects_permission() {
        let h = harness(&[("customer.com", "sub.base.tld."), ("evil.com", "other.org.")]);

        let (status, _, body) =
            send(router(h.state.clone()), "base.tld", "/ask?domain=customer.com").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());

        let (status, _, body) =
            send(router(h.state.clone()), "base.tld", "/ask?domain=evil.com").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.is_empty());

        let (status, _, _) = send(router(h.state.clone()), "base.tld", "/ask").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_stats_and_metrics_are_served() {
        let h = harness(&[("customer.com", "sub.base.tld.")]);
        send(router(h.state.clone()), "customer.com", "/").await;
        wait_for_count(h.state.tracker.as_ref().expect("tracker"), 1).await;

        let (status, _, body) =
            send(admin_router(h.state.clone()), "localhost", "/stats?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(json["stats"]["total_domains"], 1);
        assert_eq!(json["top_domains"][0]["domain"], "customer.com");

        let (status, headers, body) =
            send(admin_router(h.state.clone()), "localhost", "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some(PROMETHEUS_CONTENT_TYPE)
        );
        assert!(body.contains("oracolo_external_routes_total 1"));
    }

    #[test]
    fn cache_headers_follow_max_age() {
        let mut headers = HeaderMap::new();
        insert_cache_headers(&mut headers, 7200);
        assert_eq!(
            headers.get(header::CACHE_CONTROL).and_then(|v| v.to_str().ok()),
            Some("public, max-age=7200")
        );
        let expires = headers
            .get(header::EXPIRES)
            .and_then(|v| v.to_str().ok())
            .expect("expires header");
        let parsed = chrono::NaiveDateTime::parse_from_str(expires, "%a, %d %b %Y %H:%M:%S GMT")
            .expect("IMF-fixdate");
        let delta = parsed.and_utc() - Utc::now();
        assert!(delta.num_seconds() > 7100 && delta.num_seconds() <= 7200);
    }

    #[test]
    fn huge_max_age_skips_expires_instead_of_panicking() {
        for max_age in [u64::MAX, i64::MAX as u64, 400_000_000_000_000] {
            let mut headers = HeaderMap::new();
            insert_cache_headers(&mut headers, max_age);
            assert!(headers.get(header::CACHE_CONTROL).is_some());
            assert!(headers.get(header::EXPIRES).is_none());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_triggers_shutdown() {
        let mut shutdown = Box::pin(shutdown_signal());
        // First poll registers the handlers.
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), &mut shutdown).await;
        assert!(pending.is_err());

        let status = std::process::Command::new("kill")
            .arg("-TERM")
            .arg(std::process::id().to_string())
            .status()
            .expect("run kill");
        assert!(status.success());

        tokio::time::timeout(std::time::Duration::from_secs(5), shutdown)
            .await
            .expect("shutdown after SIGTERM");
    }

    #[test]
    fn host_header_wins_over_uri_authority() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("customer.com"));
        let uri: Uri = "http://other.com/".parse().expect("uri");
        assert_eq!(request_host(&headers, &uri), "customer.com");
        assert_eq!(request_host(&HeaderMap::new(), &uri), "other.com");
    }
}
