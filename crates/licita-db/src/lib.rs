//! Licita DB - PostgreSQL persistence and the query engine.
//!
//! Repositories convert database rows to domain types explicitly and keep
//! all SQL runtime-built; migrations live under `migrations/` and are
//! embedded at compile time.

mod cache;
pub mod favorites;
pub mod query;
pub mod repository;
pub mod runs;

pub use favorites::FavoriteRepository;
pub use query::{CorpusStats, EstadoDistribution, QueryEngine};
pub use repository::{LicitacionRepository, UpsertStats};
pub use runs::RunRepository;

use licita_core::error::AppError;
use sqlx::PgPool;

/// Applies pending migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| AppError::Generic(format!("migration failed: {}", e)))
}
