//! Licita Client - resilient HTTP fetching and portal source adapters.
//!
//! [`http`] wraps `reqwest` with the behaviors flaky government portals
//! demand: per-host spacing, a per-host circuit breaker, bounded retries
//! with jitter, User-Agent rotation, and sticky cookie sessions for
//! postback-driven sites.
//!
//! [`adapters`] holds the [`adapters::SourceAdapter`] trait, the registry,
//! and one adapter per portal family. Adapters emit raw records only; all
//! date and estado resolution happens downstream in `licita-core`.

pub mod adapters;
pub mod detail;
pub mod http;

pub use adapters::{AdapterContext, AdapterOutput, AdapterRegistry, SourceAdapter};
pub use http::{FetchClient, FetchRequest, FetchResponse, HttpSettings, Session};
