use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::info;

use crate::cname::CnameResolver;
use crate::params::DecodeError;

/// How a request host maps onto a tenant label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The bare base domain.
    Home,
    /// `<label>.<base>`; wildcard DNS delegation already proves entitlement.
    Subdomain { label: String },
    /// A foreign domain whose CNAME points at `<label>.<base>.`. Callers record
    /// the access and may let shared caches keep the page for the positive TTL.
    External { domain: String, label: String },
}

impl Route {
    pub fn label(&self) -> Option<&str> {
        match self {
            Route::Home => None,
            Route::Subdomain { label } | Route::External { label, .. } => Some(label),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("missing CNAME record for {domain}")]
    MissingCname { domain: String },
    #[error("invalid CNAME '{target}' doesn't end with '{base}.'")]
    InvalidCnameTarget { target: String, base: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::MissingCname { .. } | RouteError::Decode(_) => StatusCode::BAD_REQUEST,
            RouteError::InvalidCnameTarget { .. } => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Classifies request hosts against the configured base domain.
#[derive(Clone)]
pub struct HostClassifier {
    base_domain: String,
    subdomain_suffix: String,
    cname_suffix: String,
    folded_base: String,
    folded_suffix: String,
    resolver: Arc<CnameResolver>,
}

impl HostClassifier {
    pub fn new(base_domain: impl Into<String>, resolver: Arc<CnameResolver>) -> Self {
        let base_domain = base_domain.into();
        let folded_base = base_domain.to_ascii_lowercase();
        Self {
            subdomain_suffix: format!(".{base_domain}"),
            cname_suffix: format!(".{base_domain}."),
            folded_suffix: format!(".{folded_base}"),
            folded_base,
            base_domain,
            resolver,
        }
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    pub fn resolver(&self) -> &Arc<CnameResolver> {
        &self.resolver
    }

    pub async fn classify(&self, host: &str) -> Result<Route, RouteError> {
        if host.is_empty() {
            return Err(RouteError::MissingCname {
                domain: String::new(),
            });
        }
        if host == self.base_domain {
            return Ok(Route::Home);
        }
        if let Some(label) = host.strip_suffix(self.subdomain_suffix.as_str()) {
            return Ok(Route::Subdomain {
                label: label.to_string(),
            });
        }

        let target = self.resolver.resolve(host).await;
        if target.is_empty() {
            return Err(RouteError::MissingCname {
                domain: host.to_string(),
            });
        }
        match target.strip_suffix(self.cname_suffix.as_str()) {
            Some(label) => Ok(Route::External {
                domain: host.to_string(),
                label: label.to_string(),
            }),
            None => Err(RouteError::InvalidCnameTarget {
                target,
                base: self.base_domain.clone(),
            }),
        }
    }

    /// Decide whether an on-demand TLS proxy may obtain a certificate for `domain`.
    ///
    /// Only foreign domains whose CNAME terminates under the base domain are
    /// allowed; the base domain and its own subdomains are always refused.
    pub async fn ask_permission(&self, domain: &str) -> bool {
        if domain.is_empty() || self.is_own_domain(domain) {
            return false;
        }

        let target = self.resolver.resolve(domain).await;
        if target.is_empty() || !target.ends_with(self.cname_suffix.as_str()) {
            return false;
        }

        info!(domain, cname = %target, "allowing external domain");
        true
    }

    /// Base domain or one of its subdomains, ignoring case and a trailing root dot.
    fn is_own_domain(&self, domain: &str) -> bool {
        let folded = domain.strip_suffix('.').unwrap_or(domain).to_ascii_lowercase();
        folded == self.folded_base || folded.ends_with(self.folded_suffix.as_str())
    }
}
