//! Asynchronous detail enrichment.
//!
//! An independent periodic job that takes a bounded batch of records below
//! enrichment level 3 with a direct canonical URL, fetches the detail
//! page, and applies field-additive updates. Attachments are downloaded to
//! capture mime and size, which promotes a record to level 3. Estado and
//! workflow_state are never touched from here.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use licita_client::detail::parse_detail;
use licita_client::http::FetchRequest;
use licita_core::error::AppError;
use licita_core::models::{AttachedFile, Licitacion};

use crate::context::CoreContext;

/// How often the enrichment job wakes up.
pub const ENRICHMENT_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Records handled per cycle.
const BATCH_SIZE: i64 = 25;

/// Attachments downloaded per record per cycle.
const MAX_ATTACHMENT_FETCHES: usize = 3;

#[derive(Debug, Default, Clone)]
pub struct EnrichmentStats {
    pub processed: usize,
    pub enriched: usize,
    pub documents_fetched: usize,
    pub failures: usize,
}

pub struct EnrichmentJob {
    ctx: Arc<CoreContext>,
}

impl EnrichmentJob {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self { ctx }
    }

    pub async fn run_loop(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(ENRICHMENT_INTERVAL) => {}
                _ = shutdown.cancelled() => return,
            }
            match self.run_once(&shutdown).await {
                Ok(stats) => {
                    if stats.processed > 0 {
                        tracing::info!(
                            processed = stats.processed,
                            enriched = stats.enriched,
                            documents = stats.documents_fetched,
                            failures = stats.failures,
                            "enrichment cycle complete"
                        );
                    }
                }
                Err(e) => tracing::error!("enrichment cycle failed: {}", e),
            }
        }
    }

    /// One bounded cycle.
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<EnrichmentStats, AppError> {
        let batch = self.ctx.licitaciones.enrichment_batch(BATCH_SIZE).await?;
        let mut stats = EnrichmentStats::default();

        for record in batch {
            if cancel.is_cancelled() {
                break;
            }
            stats.processed += 1;
            match self.enrich_one(&record, cancel).await {
                Ok(Some(documents)) => {
                    stats.enriched += 1;
                    stats.documents_fetched += documents;
                }
                Ok(None) => {}
                Err(e) => {
                    stats.failures += 1;
                    tracing::debug!(id = %record.id, "enrichment failed: {}", e);
                }
            }
        }
        if stats.enriched > 0 {
            self.ctx.query.invalidate_caches();
        }
        Ok(stats)
    }

    /// Returns how many documents were fetched, or `None` when the page
    /// offered nothing new.
    async fn enrich_one(
        &self,
        record: &Licitacion,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>, AppError> {
        let url = record
            .canonical_url
            .as_deref()
            .ok_or(AppError::MissingField("canonical_url"))?;
        let base = Url::parse(url).map_err(|_| AppError::InvalidUrl(url.to_string()))?;

        let response = self
            .ctx
            .http
            .fetch(FetchRequest::get(url), cancel)
            .await?;
        let fields = parse_detail(&response.text(), &base);
        if fields.is_empty() {
            return Ok(None);
        }

        // Union with what the record already carries; fetch a bounded
        // number of the new documents to learn their size.
        let mut attached = record.attached_files.clone();
        let mut fetched = 0usize;
        for mut file in fields.attached_files {
            if attached.iter().any(|f| f.url == file.url) {
                continue;
            }
            if fetched < MAX_ATTACHMENT_FETCHES {
                if let Some(size) = self.fetch_size(&file, cancel).await {
                    file.size = Some(size);
                    fetched += 1;
                }
            }
            attached.push(file);
        }

        let level = if fetched > 0 { 3 } else { 2 };
        self.ctx
            .licitaciones
            .apply_enrichment(
                record.id,
                fields.description.as_deref(),
                fields
                    .budget_text
                    .as_deref()
                    .and_then(licita_core::dates::parse_budget),
                fields.currency.as_deref(),
                fields.expedient_number.as_deref(),
                &attached,
                level,
            )
            .await?;
        Ok(Some(fetched))
    }

    async fn fetch_size(&self, file: &AttachedFile, cancel: &CancellationToken) -> Option<i64> {
        match self
            .ctx
            .http
            .fetch(FetchRequest::get(&file.url), cancel)
            .await
        {
            Ok(response) => Some(response.bytes.len() as i64),
            Err(e) => {
                tracing::debug!(url = %file.url, "attachment fetch failed: {}", e);
                None
            }
        }
    }
}
