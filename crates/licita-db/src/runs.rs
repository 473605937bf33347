//! Scraper configs and run history.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use uuid::Uuid;

use licita_core::error::AppError;
use licita_core::health::RunSample;
use licita_core::models::{
    AdapterCategory, PaginationState, RunStatus, ScraperConfig, ScraperRun,
};
use licita_core::SourceEntry;

const RUN_COLUMNS: &str = "id, scraper_name, started_at, ended_at, status, items_found, items_saved, items_updated, items_duplicated, duration_seconds, errors, warnings, logs";

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    scraper_name: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    status: String,
    items_found: i64,
    items_saved: i64,
    items_updated: i64,
    items_duplicated: i64,
    duration_seconds: Option<f64>,
    errors: Json<Vec<String>>,
    warnings: Json<Vec<String>>,
    logs: Json<Vec<String>>,
}

impl TryFrom<RunRow> for ScraperRun {
    type Error = AppError;

    fn try_from(row: RunRow) -> Result<Self, AppError> {
        let status = RunStatus::parse(&row.status)
            .ok_or_else(|| AppError::Decoding(format!("unknown run status '{}'", row.status)))?;
        Ok(ScraperRun {
            id: row.id,
            scraper_name: row.scraper_name,
            started_at: row.started_at,
            ended_at: row.ended_at,
            status,
            items_found: row.items_found,
            items_saved: row.items_saved,
            items_updated: row.items_updated,
            items_duplicated: row.items_duplicated,
            duration_seconds: row.duration_seconds,
            errors: row.errors.0,
            warnings: row.warnings.0,
            logs: row.logs.0,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    name: String,
    url: String,
    adapter: String,
    jurisdiccion: String,
    category: String,
    active: bool,
    schedule: String,
    selectors: Json<BTreeMap<String, String>>,
    pagination: Json<PaginationState>,
    last_run: Option<DateTime<Utc>>,
    runs_count: i64,
    min_interval_hours: Option<f64>,
    adaptive_schedule: bool,
    paused_reason: Option<String>,
}

impl TryFrom<ConfigRow> for ScraperConfig {
    type Error = AppError;

    fn try_from(row: ConfigRow) -> Result<Self, AppError> {
        let category = AdapterCategory::parse(&row.category)
            .ok_or_else(|| AppError::Decoding(format!("unknown category '{}'", row.category)))?;
        Ok(ScraperConfig {
            name: row.name,
            url: row.url,
            adapter: row.adapter,
            jurisdiccion: row.jurisdiccion,
            category,
            active: row.active,
            schedule: row.schedule,
            selectors: row.selectors.0,
            pagination: row.pagination.0,
            last_run: row.last_run,
            runs_count: row.runs_count,
            min_interval_hours: row.min_interval_hours,
            adaptive_schedule: row.adaptive_schedule,
            paused_reason: row.paused_reason,
        })
    }
}

const CONFIG_COLUMNS: &str = "name, url, adapter, jurisdiccion, category, active, schedule, selectors, pagination, last_run, runs_count, min_interval_hours, adaptive_schedule, paused_reason";

/// Repository for scraper configs and their run history.
#[derive(Clone)]
pub struct RunRepository {
    pool: PgPool,
}

impl RunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ---- configs ------------------------------------------------------

    /// Syncs sources.toml entries into `scraper_configs`. Declarative
    /// fields follow the file; runtime state (`active`, `last_run`,
    /// `runs_count`, `paused_reason`) is preserved on existing rows so an
    /// auto-pause survives a restart.
    pub async fn sync_sources(&self, sources: &[SourceEntry]) -> Result<(), AppError> {
        for source in sources {
            let config = source.to_scraper_config();
            sqlx::query(
                r#"
                INSERT INTO scraper_configs (
                    name, url, adapter, jurisdiccion, category, active,
                    schedule, selectors, pagination, min_interval_hours,
                    adaptive_schedule
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (name) DO UPDATE SET
                    url = EXCLUDED.url,
                    adapter = EXCLUDED.adapter,
                    jurisdiccion = EXCLUDED.jurisdiccion,
                    category = EXCLUDED.category,
                    schedule = EXCLUDED.schedule,
                    selectors = EXCLUDED.selectors,
                    pagination = EXCLUDED.pagination,
                    min_interval_hours = EXCLUDED.min_interval_hours,
                    adaptive_schedule = EXCLUDED.adaptive_schedule
                "#,
            )
            .bind(&config.name)
            .bind(&config.url)
            .bind(&config.adapter)
            .bind(&config.jurisdiccion)
            .bind(config.category.as_str())
            .bind(config.active)
            .bind(&config.schedule)
            .bind(Json(&config.selectors))
            .bind(Json(&config.pagination))
            .bind(config.min_interval_hours)
            .bind(config.adaptive_schedule)
            .execute(&self.pool)
            .await?;

            // A source disabled in the file stops scheduling regardless of
            // its runtime state.
            if !source.enabled {
                sqlx::query(
                    "UPDATE scraper_configs SET active = FALSE, paused_reason = 'disabled in sources.toml' WHERE name = $1",
                )
                .bind(&source.name)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn list_configs(&self, only_active: bool) -> Result<Vec<ScraperConfig>, AppError> {
        let query = if only_active {
            format!(
                "SELECT {} FROM scraper_configs WHERE active ORDER BY name",
                CONFIG_COLUMNS
            )
        } else {
            format!("SELECT {} FROM scraper_configs ORDER BY name", CONFIG_COLUMNS)
        };
        let rows = sqlx::query_as::<_, ConfigRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ScraperConfig::try_from).collect()
    }

    pub async fn get_config(&self, name: &str) -> Result<ScraperConfig, AppError> {
        let query = format!(
            "SELECT {} FROM scraper_configs WHERE name = $1",
            CONFIG_COLUMNS
        );
        let row = sqlx::query_as::<_, ConfigRow>(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ScraperConfig::try_from)
            .transpose()?
            .ok_or_else(|| AppError::ConfigNotFound(name.to_string()))
    }

    /// Flips a source's active flag, recording why.
    pub async fn set_active(
        &self,
        name: &str,
        active: bool,
        reason: Option<&str>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE scraper_configs SET active = $2, paused_reason = $3 WHERE name = $1",
        )
        .bind(name)
        .bind(active)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::ConfigNotFound(name.to_string()));
        }
        Ok(())
    }

    pub async fn touch_last_run(&self, name: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE scraper_configs SET last_run = $2, runs_count = runs_count + 1 WHERE name = $1",
        )
        .bind(name)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- runs ---------------------------------------------------------

    /// Writes the run row (in-progress runs are durable by design: the row
    /// exists before the adapter makes its first request).
    pub async fn record_run(&self, run: &ScraperRun) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO scraper_runs (
                id, scraper_name, started_at, ended_at, status, items_found,
                items_saved, items_updated, items_duplicated,
                duration_seconds, errors, warnings, logs
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run.id)
        .bind(&run.scraper_name)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.status.as_str())
        .bind(run.items_found)
        .bind(run.items_saved)
        .bind(run.items_updated)
        .bind(run.items_duplicated)
        .bind(run.duration_seconds)
        .bind(Json(&run.errors))
        .bind(Json(&run.warnings))
        .bind(Json(&run.logs))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_run(&self, run: &ScraperRun) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE scraper_runs SET
                ended_at = $2,
                status = $3,
                items_found = $4,
                items_saved = $5,
                items_updated = $6,
                items_duplicated = $7,
                duration_seconds = $8,
                errors = $9,
                warnings = $10,
                logs = $11
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.ended_at)
        .bind(run.status.as_str())
        .bind(run.items_found)
        .bind(run.items_saved)
        .bind(run.items_updated)
        .bind(run.items_duplicated)
        .bind(run.duration_seconds)
        .bind(Json(&run.errors))
        .bind(Json(&run.warnings))
        .bind(Json(&run.logs))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Option<ScraperRun>, AppError> {
        let query = format!("SELECT {} FROM scraper_runs WHERE id = $1", RUN_COLUMNS);
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ScraperRun::try_from).transpose()
    }

    pub async fn list_runs(
        &self,
        scraper: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ScraperRun>, AppError> {
        let rows = match scraper {
            Some(name) => {
                let query = format!(
                    "SELECT {} FROM scraper_runs WHERE scraper_name = $1 ORDER BY started_at DESC LIMIT $2",
                    RUN_COLUMNS
                );
                sqlx::query_as::<_, RunRow>(&query)
                    .bind(name)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {} FROM scraper_runs ORDER BY started_at DESC LIMIT $1",
                    RUN_COLUMNS
                );
                sqlx::query_as::<_, RunRow>(&query)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(ScraperRun::try_from).collect()
    }

    /// Health-scoring window for one source, newest first.
    pub async fn recent_samples(
        &self,
        scraper: &str,
        limit: i64,
    ) -> Result<Vec<RunSample>, AppError> {
        let rows: Vec<(String, DateTime<Utc>, Option<f64>, i64, i64)> = sqlx::query_as(
            "SELECT status, started_at, duration_seconds, items_saved, items_updated \
             FROM scraper_runs WHERE scraper_name = $1 AND status <> 'running' \
             ORDER BY started_at DESC LIMIT $2",
        )
        .bind(scraper)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(status, started_at, duration_seconds, items_saved, items_updated)| {
                let status = RunStatus::parse(&status).ok_or_else(|| {
                    AppError::Decoding(format!("unknown run status '{}'", status))
                })?;
                Ok(RunSample {
                    status,
                    started_at,
                    duration_seconds,
                    items_saved,
                    items_updated,
                })
            })
            .collect()
    }

    /// Marks runs left `running` by a dead process as aborted. Called once
    /// at boot.
    pub async fn fail_stale_runs(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE scraper_runs SET
                status = 'failed',
                ended_at = NOW(),
                errors = errors || '["aborted"]'::jsonb
            WHERE status = 'running'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_run_row_maps_to_domain() {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let row = RunRow {
            id: Uuid::new_v4(),
            scraper_name: "comprar-mza".into(),
            started_at: t,
            ended_at: Some(t + chrono::Duration::seconds(30)),
            status: "partial".into(),
            items_found: 10,
            items_saved: 8,
            items_updated: 1,
            items_duplicated: 1,
            duration_seconds: Some(30.0),
            errors: Json(vec![]),
            warnings: Json(vec!["year 2019 outside accepted window".into()]),
            logs: Json(vec![]),
        };
        let run = ScraperRun::try_from(row).unwrap();
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.warnings.len(), 1);
    }

    #[test]
    fn test_run_row_rejects_unknown_status() {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let row = RunRow {
            id: Uuid::new_v4(),
            scraper_name: "x".into(),
            started_at: t,
            ended_at: None,
            status: "exploded".into(),
            items_found: 0,
            items_saved: 0,
            items_updated: 0,
            items_duplicated: 0,
            duration_seconds: None,
            errors: Json(vec![]),
            warnings: Json(vec![]),
            logs: Json(vec![]),
        };
        assert!(matches!(
            ScraperRun::try_from(row),
            Err(AppError::Decoding(_))
        ));
    }

    #[test]
    fn test_config_row_maps_category() {
        let row = ConfigRow {
            name: "comprar-mza".into(),
            url: "https://comprar.mendoza.gov.ar".into(),
            adapter: "viewstate".into(),
            jurisdiccion: "Mendoza".into(),
            category: "medium".into(),
            active: true,
            schedule: "0 */6 * * *".into(),
            selectors: Json(BTreeMap::new()),
            pagination: Json(PaginationState::default()),
            last_run: None,
            runs_count: 4,
            min_interval_hours: Some(6.0),
            adaptive_schedule: true,
            paused_reason: None,
        };
        let config = ScraperConfig::try_from(row).unwrap();
        assert_eq!(config.category, AdapterCategory::Medium);
        assert_eq!(config.runs_count, 4);
    }
}
