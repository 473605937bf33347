//! Licitación repository: dedup-aware upserts and record maintenance.
//!
//! All SQL here is runtime-checked (`query_as` over a const column list);
//! the unique `(fuente, content_hash)` index makes a lost insert race a
//! merge signal rather than an error.
//!
//! Integration coverage (upsert paths, sweep behavior) needs a live
//! Postgres; unit tests stay on row mapping and bookkeeping.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use licita_core::dedup::{self, IdentityKey};
use licita_core::error::AppError;
use licita_core::models::{
    AttachedFile, Estado, Licitacion, NewLicitacion, UrlQuality, WorkflowState,
};

/// Column list for SELECT queries. Kept a const literal so format!-built
/// queries cannot drift from the row struct.
pub(crate) const LICITACION_COLUMNS: &str = "id, title, organization, fuente, jurisdiccion, category, tipo_procedimiento, nodo, description, publication_date, opening_date, fecha_prorroga, estado, budget, currency, expedient_number, licitacion_number, canonical_url, url_quality, source_urls, content_hash, attached_files, workflow_state, first_seen_at, created_at, updated_at, merged_from, is_merged, enrichment_level, metadata";

/// Database shape of a licitación; converted to the domain type explicitly
/// so enum parsing failures surface as decode errors instead of panics.
#[derive(sqlx::FromRow)]
pub(crate) struct LicitacionRow {
    pub id: Uuid,
    pub title: String,
    pub organization: String,
    pub fuente: String,
    pub jurisdiccion: String,
    pub category: Option<String>,
    pub tipo_procedimiento: Option<String>,
    pub nodo: Option<String>,
    pub description: Option<String>,
    pub publication_date: Option<NaiveDate>,
    pub opening_date: Option<NaiveDate>,
    pub fecha_prorroga: Option<NaiveDate>,
    pub estado: String,
    pub budget: Option<Decimal>,
    pub currency: Option<String>,
    pub expedient_number: Option<String>,
    pub licitacion_number: Option<String>,
    pub canonical_url: Option<String>,
    pub url_quality: String,
    pub source_urls: Json<BTreeMap<String, String>>,
    pub content_hash: String,
    pub attached_files: Json<Vec<AttachedFile>>,
    pub workflow_state: String,
    pub first_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub merged_from: Json<Vec<Uuid>>,
    pub is_merged: bool,
    pub enrichment_level: i16,
    pub metadata: Json<serde_json::Value>,
}

impl TryFrom<LicitacionRow> for Licitacion {
    type Error = AppError;

    fn try_from(row: LicitacionRow) -> Result<Self, AppError> {
        let estado = Estado::parse(&row.estado)
            .ok_or_else(|| AppError::Decoding(format!("unknown estado '{}'", row.estado)))?;
        let url_quality = UrlQuality::parse(&row.url_quality).ok_or_else(|| {
            AppError::Decoding(format!("unknown url_quality '{}'", row.url_quality))
        })?;
        let workflow_state = WorkflowState::parse(&row.workflow_state).ok_or_else(|| {
            AppError::Decoding(format!("unknown workflow_state '{}'", row.workflow_state))
        })?;
        Ok(Licitacion {
            id: row.id,
            title: row.title,
            organization: row.organization,
            fuente: row.fuente,
            jurisdiccion: row.jurisdiccion,
            category: row.category,
            tipo_procedimiento: row.tipo_procedimiento,
            nodo: row.nodo,
            description: row.description,
            publication_date: row.publication_date,
            opening_date: row.opening_date,
            fecha_prorroga: row.fecha_prorroga,
            estado,
            budget: row.budget,
            currency: row.currency,
            expedient_number: row.expedient_number,
            licitacion_number: row.licitacion_number,
            canonical_url: row.canonical_url,
            url_quality,
            source_urls: row.source_urls.0,
            content_hash: row.content_hash,
            attached_files: row.attached_files.0,
            workflow_state,
            first_seen_at: row.first_seen_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            merged_from: row.merged_from.0,
            is_merged: row.is_merged,
            enrichment_level: row.enrichment_level,
            metadata: row.metadata.0,
        })
    }
}

pub(crate) fn rows_to_domain(rows: Vec<LicitacionRow>) -> Result<Vec<Licitacion>, AppError> {
    rows.into_iter().map(Licitacion::try_from).collect()
}

/// Outcome counters for one `upsert_batch` call.
#[derive(Debug, Default, Clone)]
pub struct UpsertStats {
    pub inserted: i64,
    pub updated: i64,
    pub duplicated: i64,
    pub errors: Vec<String>,
}

enum UpsertOutcome {
    Inserted(Uuid),
    Merged(Uuid),
}

/// Bulk writes are grouped in chunks of this many records.
const CHUNK_SIZE: usize = 500;

/// Candidate query cap; fuzzy matching never needs more than this.
const CANDIDATE_LIMIT: i64 = 200;

/// Repository for the canonical tender corpus.
#[derive(Clone)]
pub struct LicitacionRepository {
    pool: PgPool,
}

impl LicitacionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Retrieves a record by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Licitacion>, AppError> {
        let query = format!(
            "SELECT {} FROM licitaciones WHERE id = $1",
            LICITACION_COLUMNS
        );
        let row = sqlx::query_as::<_, LicitacionRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Licitacion::try_from).transpose()
    }

    /// Inserts or merges a batch of resolved records.
    ///
    /// Chunked to bound memory; each record is written at most once per
    /// `(fuente, content_hash)` within the batch; a failed write is retried
    /// once and then surfaced in `errors`.
    pub async fn upsert_batch(
        &self,
        records: &[NewLicitacion],
        today: NaiveDate,
    ) -> Result<UpsertStats, AppError> {
        let mut stats = UpsertStats::default();
        let mut seen: HashSet<(String, String)> = HashSet::new();

        for chunk in records.chunks(CHUNK_SIZE) {
            for record in chunk {
                let key = (record.fuente.clone(), record.content_hash.clone());
                if !seen.insert(key) {
                    stats.duplicated += 1;
                    continue;
                }

                let mut outcome = self.upsert_one(record, today).await;
                if outcome.is_err() {
                    outcome = self.upsert_one(record, today).await;
                }
                match outcome {
                    Ok(UpsertOutcome::Inserted(_)) => stats.inserted += 1,
                    Ok(UpsertOutcome::Merged(_)) => stats.updated += 1,
                    Err(e) => stats
                        .errors
                        .push(format!("'{}': {}", record.title, e)),
                }
            }
        }
        Ok(stats)
    }

    async fn upsert_one(
        &self,
        record: &NewLicitacion,
        today: NaiveDate,
    ) -> Result<UpsertOutcome, AppError> {
        let candidates = self.find_candidates(record).await?;
        if let Some(m) = dedup::find_match(IdentityKey::from(record), &candidates) {
            let merged = dedup::merge_incoming(m.existing, record, today);
            tracing::debug!(
                id = %merged.id,
                key = ?m.key,
                fuente = %record.fuente,
                "merging into existing record"
            );
            self.update_full(&merged).await?;
            return Ok(UpsertOutcome::Merged(merged.id));
        }

        match self.try_insert(record).await? {
            Some(id) => Ok(UpsertOutcome::Inserted(id)),
            None => {
                // Unique (fuente, content_hash) tripped: a concurrent run
                // inserted the same identity first. Treat as merge.
                let existing = self
                    .get_by_hash(&record.fuente, &record.content_hash)
                    .await?
                    .ok_or_else(|| {
                        AppError::WriteFailure(format!(
                            "insert conflicted but no live row for hash {}",
                            record.content_hash
                        ))
                    })?;
                let merged = dedup::merge_incoming(&existing, record, today);
                self.update_full(&merged).await?;
                Ok(UpsertOutcome::Merged(existing.id))
            }
        }
    }

    /// Same-jurisdiction candidates for the dedup key chain: identity key
    /// hits plus anything inside the fuzzy publication window.
    pub(crate) async fn find_candidates(
        &self,
        record: &NewLicitacion,
    ) -> Result<Vec<Licitacion>, AppError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM licitaciones WHERE absorbed_into IS NULL AND jurisdiccion = ",
            LICITACION_COLUMNS
        ));
        qb.push_bind(record.jurisdiccion.clone());
        qb.push(" AND (content_hash = ");
        qb.push_bind(record.content_hash.clone());

        if let Some(expedient) = &record.expedient_number {
            let normalized = dedup::normalize_identifier(expedient);
            if !normalized.is_empty() {
                qb.push(" OR replace(upper(expedient_number), ' ', '') = ");
                qb.push_bind(normalized);
            }
        }
        if let Some(numero) = &record.licitacion_number {
            let normalized = dedup::normalize_identifier(numero);
            if !normalized.is_empty() {
                qb.push(" OR replace(upper(licitacion_number), ' ', '') = ");
                qb.push_bind(normalized);
            }
        }
        if let Some(publication) = record.publication_date {
            qb.push(" OR (publication_date BETWEEN ");
            qb.push_bind(publication - chrono::Duration::days(dedup::PUBLICATION_WINDOW_DAYS));
            qb.push(" AND ");
            qb.push_bind(publication + chrono::Duration::days(dedup::PUBLICATION_WINDOW_DAYS));
            qb.push(")");
        }
        qb.push(") LIMIT ");
        qb.push_bind(CANDIDATE_LIMIT);

        let rows = qb
            .build_query_as::<LicitacionRow>()
            .fetch_all(&self.pool)
            .await?;
        rows_to_domain(rows)
    }

    async fn try_insert(&self, record: &NewLicitacion) -> Result<Option<Uuid>, AppError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO licitaciones (
                id, title, organization, fuente, jurisdiccion, category,
                tipo_procedimiento, nodo, description, publication_date,
                opening_date, fecha_prorroga, estado, budget, currency,
                expedient_number, licitacion_number, canonical_url,
                url_quality, source_urls, content_hash, attached_files,
                enrichment_level, metadata
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24
            )
            ON CONFLICT (fuente, content_hash) WHERE absorbed_into IS NULL
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(record.id)
        .bind(&record.title)
        .bind(&record.organization)
        .bind(&record.fuente)
        .bind(&record.jurisdiccion)
        .bind(&record.category)
        .bind(&record.tipo_procedimiento)
        .bind(&record.nodo)
        .bind(&record.description)
        .bind(record.publication_date)
        .bind(record.opening_date)
        .bind(record.fecha_prorroga)
        .bind(record.estado.as_str())
        .bind(record.budget)
        .bind(&record.currency)
        .bind(&record.expedient_number)
        .bind(&record.licitacion_number)
        .bind(&record.canonical_url)
        .bind(record.url_quality.as_str())
        .bind(Json(&record.source_urls))
        .bind(&record.content_hash)
        .bind(Json(&record.attached_files))
        .bind(record.enrichment_level)
        .bind(Json(&record.metadata))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn get_by_hash(
        &self,
        fuente: &str,
        content_hash: &str,
    ) -> Result<Option<Licitacion>, AppError> {
        let query = format!(
            "SELECT {} FROM licitaciones WHERE absorbed_into IS NULL AND fuente = $1 AND content_hash = $2",
            LICITACION_COLUMNS
        );
        let row = sqlx::query_as::<_, LicitacionRow>(&query)
            .bind(fuente)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Licitacion::try_from).transpose()
    }

    /// Writes back a merged record. `first_seen_at` and `created_at` are
    /// deliberately absent from the SET list.
    pub(crate) async fn update_full(&self, record: &Licitacion) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE licitaciones SET
                title = $2,
                organization = $3,
                category = $4,
                tipo_procedimiento = $5,
                nodo = $6,
                description = $7,
                publication_date = $8,
                opening_date = $9,
                fecha_prorroga = $10,
                estado = $11,
                budget = $12,
                currency = $13,
                expedient_number = $14,
                licitacion_number = $15,
                canonical_url = $16,
                url_quality = $17,
                source_urls = $18,
                attached_files = $19,
                merged_from = $20,
                is_merged = $21,
                enrichment_level = $22,
                metadata = $23,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(&record.title)
        .bind(&record.organization)
        .bind(&record.category)
        .bind(&record.tipo_procedimiento)
        .bind(&record.nodo)
        .bind(&record.description)
        .bind(record.publication_date)
        .bind(record.opening_date)
        .bind(record.fecha_prorroga)
        .bind(record.estado.as_str())
        .bind(record.budget)
        .bind(&record.currency)
        .bind(&record.expedient_number)
        .bind(&record.licitacion_number)
        .bind(&record.canonical_url)
        .bind(record.url_quality.as_str())
        .bind(Json(&record.source_urls))
        .bind(Json(&record.attached_files))
        .bind(Json(&record.merged_from))
        .bind(record.is_merged)
        .bind(record.enrichment_level)
        .bind(Json(&record.metadata))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recomputes estado for the whole live corpus in one statement.
    /// Returns how many rows actually changed.
    pub async fn recompute_estados(&self, today: NaiveDate) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE licitaciones SET
                estado = computed.estado,
                updated_at = NOW()
            FROM (
                SELECT id,
                    CASE
                        WHEN publication_date IS NOT NULL AND publication_date < '2025-01-01' THEN 'archivada'
                        WHEN opening_date IS NOT NULL AND opening_date < $1
                             AND fecha_prorroga IS NOT NULL AND fecha_prorroga > $1 THEN 'prorrogada'
                        WHEN opening_date IS NOT NULL AND opening_date < $1 THEN 'vencida'
                        ELSE 'vigente'
                    END AS estado
                FROM licitaciones
                WHERE absorbed_into IS NULL
            ) AS computed
            WHERE licitaciones.id = computed.id
              AND licitaciones.estado <> computed.estado
            "#,
        )
        .bind(today)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Records due for enrichment: below level 3 with a direct URL.
    pub async fn enrichment_batch(&self, limit: i64) -> Result<Vec<Licitacion>, AppError> {
        let query = format!(
            "SELECT {} FROM licitaciones \
             WHERE absorbed_into IS NULL AND enrichment_level < 3 \
               AND url_quality = 'direct' AND canonical_url IS NOT NULL \
             ORDER BY updated_at ASC LIMIT $1",
            LICITACION_COLUMNS
        );
        let rows = sqlx::query_as::<_, LicitacionRow>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows_to_domain(rows)
    }

    /// Field-additive enrichment write: COALESCE keeps every non-null
    /// stored scalar; estado and workflow_state are untouched; the level
    /// only ratchets up.
    pub async fn apply_enrichment(
        &self,
        id: Uuid,
        description: Option<&str>,
        budget: Option<Decimal>,
        currency: Option<&str>,
        expedient_number: Option<&str>,
        attached_files: &[AttachedFile],
        level: i16,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE licitaciones SET
                description = COALESCE(description, $2),
                budget = COALESCE(budget, $3),
                currency = COALESCE(currency, $4),
                expedient_number = COALESCE(expedient_number, $5),
                attached_files = $6,
                enrichment_level = GREATEST(enrichment_level, $7),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(description)
        .bind(budget)
        .bind(currency)
        .bind(expedient_number)
        .bind(Json(attached_files))
        .bind(level)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sets the user-assigned workflow state.
    pub async fn set_workflow_state(
        &self,
        id: Uuid,
        state: WorkflowState,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE licitaciones SET workflow_state = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Runs a dedup sweep over one jurisdiction. Returns the number of
    /// absorbed records.
    pub async fn dedup_sweep(
        &self,
        jurisdiccion: &str,
        today: NaiveDate,
    ) -> Result<usize, AppError> {
        let query = format!(
            "SELECT {} FROM licitaciones WHERE absorbed_into IS NULL AND jurisdiccion = $1",
            LICITACION_COLUMNS
        );
        let rows = sqlx::query_as::<_, LicitacionRow>(&query)
            .bind(jurisdiccion)
            .fetch_all(&self.pool)
            .await?;
        let records = rows_to_domain(rows)?;

        let merges = dedup::plan_sweep(records, today);
        let absorbed = merges.len();
        for merge in merges {
            self.update_full(&merge.winner).await?;
            sqlx::query(
                "UPDATE licitaciones SET absorbed_into = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(merge.absorbed)
            .bind(merge.winner.id)
            .execute(&self.pool)
            .await?;
        }
        if absorbed > 0 {
            tracing::info!(jurisdiccion, absorbed, "dedup sweep absorbed records");
        }
        Ok(absorbed)
    }
}
