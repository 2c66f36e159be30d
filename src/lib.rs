//! Multi-tenant page host routing requests by subdomain or CNAME.
//!
//! Requests for `<label>.<base>` and for foreign domains whose CNAME points at
//! `<label>.<base>.` are served the same page shell, with the label decoded
//! into `<meta>` parameters. A `/ask` endpoint lets an on-demand TLS proxy
//! check which foreign domains may receive certificates.

pub mod cname;
pub mod config;
pub mod identity;
pub mod metrics;
pub mod params;
pub mod render;
pub mod route;
pub mod server;
pub mod telemetry;
pub mod tracker;

pub use cname::{CachePolicy, CnameLookup, CnameResolver, DnsCnameLookup};
pub use config::ServiceConfig;
pub use params::{DecodeError, ParameterSet, decode};
pub use route::{HostClassifier, Route, RouteError};
pub use server::OracoloServer;
pub use tracker::{DomainAccessRecord, DomainTracker, TrackerStats};
