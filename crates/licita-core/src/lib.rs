//! Licita Core - Domain types, resolution logic, and configuration.
//!
//! Everything in this crate is pure: date parsing, estado computation,
//! deduplication scoring, and health scoring take their inputs (including
//! "today") as arguments and perform no I/O, so the whole pipeline is
//! testable without a database or network.

pub mod config;
pub mod dates;
pub mod dedup;
pub mod error;
pub mod health;
pub mod models;
pub mod query;
pub mod resolver;

pub use config::{
    default_config_path, load_sources_config, EnvSettings, QuietWindow, SourceEntry, SourcesConfig,
};
pub use error::AppError;
pub use models::{
    AdapterCategory, AttachedFile, Estado, Favorite, Licitacion, NewLicitacion, PaginationState,
    RawRecord, RunStatus, ScraperConfig, ScraperRun, UrlQuality, WorkflowState,
};
pub use query::{FacetCount, FechaCampo, ListFilter, Page, Pagination, Sort, SortField, SortOrder};
pub use resolver::{compute_estado, resolve, Resolution, SkipReason};
