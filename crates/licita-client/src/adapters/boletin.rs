//! Official-gazette (boletín) adapter.
//!
//! Boletines publish many tenders under one URL, often without per-item
//! anchors. Rows without their own link share the listing URL at
//! `partial` quality; the item's full text is kept as the description so
//! the resolver can mine dates and expedientes out of it.

use async_trait::async_trait;
use url::Url;

use licita_core::error::AppError;
use licita_core::models::{AdapterCategory, ScraperConfig};

use crate::http::{FetchClient, FetchRequest};

use super::rows;
use super::{AdapterContext, AdapterOutput, SourceAdapter};

pub struct BoletinAdapter;

#[async_trait]
impl SourceAdapter for BoletinAdapter {
    fn name(&self) -> &'static str {
        "boletin"
    }

    fn category(&self) -> AdapterCategory {
        AdapterCategory::Light
    }

    fn handles_url(&self, url: &Url) -> bool {
        url.host_str()
            .map(|h| h.contains("boletin"))
            .unwrap_or(false)
            || url.path().to_lowercase().contains("boletin")
    }

    async fn run(
        &self,
        config: &ScraperConfig,
        client: &FetchClient,
        ctx: &AdapterContext,
    ) -> Result<AdapterOutput, AppError> {
        let base = Url::parse(&config.url).map_err(|_| AppError::InvalidUrl(config.url.clone()))?;
        let request = FetchRequest::get(base.as_str()).with_timeout(self.category().timeout());
        let response = client.fetch(request, &ctx.cancel).await?;

        let body = response.text();
        let page = rows::parse_listing(&body, config, &base)?;

        let mut output = AdapterOutput {
            records: page.records,
            warnings: page.warnings,
        };
        for record in &mut output.records {
            // Gazette entries are prose; keep the full text for the
            // resolver's date and expediente mining.
            if record.description.is_none() && record.title.len() > 80 {
                record.description = Some(record.title.clone());
            }
        }
        tracing::debug!(source = %config.name, items = output.records.len(), "boletin parsed");
        Ok(output)
    }
}
