//! User favorites over the corpus.

use sqlx::PgPool;
use uuid::Uuid;

use licita_core::error::AppError;
use licita_core::models::Licitacion;

use crate::repository::{rows_to_domain, LicitacionRow, LICITACION_COLUMNS};

#[derive(Clone)]
pub struct FavoriteRepository {
    pool: PgPool,
}

impl FavoriteRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Adds a favorite; idempotent.
    pub async fn add(&self, user_id: &str, licitacion_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT INTO favorites (user_id, licitacion_id) VALUES ($1, $2) \
             ON CONFLICT (user_id, licitacion_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(licitacion_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove(&self, user_id: &str, licitacion_id: Uuid) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM favorites WHERE user_id = $1 AND licitacion_id = $2")
                .bind(user_id)
                .bind(licitacion_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_ids(&self, user_id: &str) -> Result<Vec<Uuid>, AppError> {
        Ok(sqlx::query_scalar(
            "SELECT licitacion_id FROM favorites WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// The user's favorited records, newest bookmark first.
    pub async fn list_records(&self, user_id: &str) -> Result<Vec<Licitacion>, AppError> {
        let query = format!(
            "SELECT {} FROM licitaciones l \
             JOIN favorites f ON f.licitacion_id = l.id \
             WHERE f.user_id = $1 ORDER BY f.created_at DESC",
            qualified_columns()
        );
        let rows = sqlx::query_as::<_, LicitacionRow>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows_to_domain(rows)
    }
}

fn qualified_columns() -> String {
    LICITACION_COLUMNS
        .split(", ")
        .map(|c| format!("l.{}", c))
        .collect::<Vec<_>>()
        .join(", ")
}
