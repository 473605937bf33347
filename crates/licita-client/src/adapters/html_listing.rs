//! Generic selector-driven HTML listing adapter.
//!
//! Covers the long tail of plain server-rendered portals: a table or list
//! of tenders, optionally paged by a query parameter or a "next" link.

use async_trait::async_trait;
use scraper::Selector;
use url::Url;

use licita_core::error::AppError;
use licita_core::models::{AdapterCategory, ScraperConfig};

use crate::http::{FetchClient, FetchRequest};

use super::rows;
use super::{AdapterContext, AdapterOutput, SourceAdapter};

pub struct HtmlListingAdapter;

#[async_trait]
impl SourceAdapter for HtmlListingAdapter {
    fn name(&self) -> &'static str {
        "html_listing"
    }

    fn category(&self) -> AdapterCategory {
        AdapterCategory::Light
    }

    async fn run(
        &self,
        config: &ScraperConfig,
        client: &FetchClient,
        ctx: &AdapterContext,
    ) -> Result<AdapterOutput, AppError> {
        let base = Url::parse(&config.url).map_err(|_| AppError::InvalidUrl(config.url.clone()))?;
        let max_pages = config.pagination.max_pages.unwrap_or(10).max(1);
        let mut output = AdapterOutput::default();

        match config.pagination.style.as_deref() {
            Some("page_param") => {
                let param = config.pagination.param.as_deref().unwrap_or("page");
                let start = config.pagination.start.unwrap_or(1);
                for page in start..start + max_pages {
                    let mut url = base.clone();
                    url.query_pairs_mut().append_pair(param, &page.to_string());
                    let count = self
                        .fetch_page(url.as_str(), config, client, ctx, &base, &mut output)
                        .await?;
                    if count == 0 {
                        break;
                    }
                }
            }
            Some("next_link") => {
                let next_sel = config
                    .selectors
                    .get("next")
                    .ok_or_else(|| {
                        AppError::Config(format!(
                            "source '{}': next_link pagination needs a 'next' selector",
                            config.name
                        ))
                    })
                    .and_then(|raw| {
                        Selector::parse(raw).map_err(|e| {
                            AppError::Config(format!(
                                "source '{}': bad selector next='{}': {}",
                                config.name, raw, e
                            ))
                        })
                    })?;

                let mut current = base.to_string();
                for _ in 0..max_pages {
                    let request =
                        FetchRequest::get(&current).with_timeout(self.category().timeout());
                    let response = client.fetch(request, &ctx.cancel).await?;
                    let body = response.text();
                    let page = rows::parse_listing(&body, config, &base)?;
                    let count = page.records.len();
                    output.records.extend(page.records);
                    output.warnings.extend(page.warnings);
                    if count == 0 {
                        break;
                    }
                    match rows::next_page_url(&body, &next_sel, &base) {
                        Some(next) if next != current => current = next,
                        _ => break,
                    }
                }
            }
            _ => {
                self.fetch_page(base.as_str(), config, client, ctx, &base, &mut output)
                    .await?;
            }
        }

        Ok(output)
    }
}

impl HtmlListingAdapter {
    async fn fetch_page(
        &self,
        url: &str,
        config: &ScraperConfig,
        client: &FetchClient,
        ctx: &AdapterContext,
        base: &Url,
        output: &mut AdapterOutput,
    ) -> Result<usize, AppError> {
        let request = FetchRequest::get(url).with_timeout(self.category().timeout());
        let response = client.fetch(request, &ctx.cancel).await?;
        let page = rows::parse_listing(&response.text(), config, base)?;
        let count = page.records.len();
        tracing::debug!(source = %config.name, url, items = count, "listing page parsed");
        output.records.extend(page.records);
        output.warnings.extend(page.warnings);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str, pagination: licita_core::models::PaginationState) -> ScraperConfig {
        let selectors: BTreeMap<String, String> = [
            ("row", "table tr"),
            ("title", "td.obj"),
            ("published", "td.fecha"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        ScraperConfig {
            name: "portal-html".into(),
            url: url.into(),
            adapter: "html_listing".into(),
            jurisdiccion: "Mendoza".into(),
            category: AdapterCategory::Light,
            active: true,
            schedule: "0 */6 * * *".into(),
            selectors,
            pagination,
            last_run: None,
            runs_count: 0,
            min_interval_hours: None,
            adaptive_schedule: false,
            paused_reason: None,
        }
    }

    fn page_body(title: &str) -> String {
        format!(
            "<table><tr><td class='obj'>{}</td><td class='fecha'>01/07/2025</td></tr></table>",
            title
        )
    }

    #[tokio::test]
    async fn test_single_page_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page_body("Obra vial")))
            .mount(&server)
            .await;

        let client = FetchClient::new(crate::http::HttpSettings {
            rate_limit_per_host: std::time::Duration::from_millis(1),
            ..Default::default()
        })
        .unwrap();
        let ctx = AdapterContext {
            cancel: CancellationToken::new(),
            today: chrono::NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        };
        let config = config(&server.uri(), Default::default());

        let output = HtmlListingAdapter.run(&config, &client, &ctx).await.unwrap();
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].title, "Obra vial");
        assert_eq!(
            output.records[0].publication_date,
            chrono::NaiveDate::from_ymd_opt(2025, 7, 1)
        );
    }

    #[tokio::test]
    async fn test_page_param_pagination_stops_on_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("pagina", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page_body("Proceso uno")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("pagina", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<table></table>"))
            .mount(&server)
            .await;

        let client = FetchClient::new(crate::http::HttpSettings {
            rate_limit_per_host: std::time::Duration::from_millis(1),
            ..Default::default()
        })
        .unwrap();
        let ctx = AdapterContext {
            cancel: CancellationToken::new(),
            today: chrono::NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        };
        let config = config(
            &server.uri(),
            licita_core::models::PaginationState {
                style: Some("page_param".into()),
                param: Some("pagina".into()),
                start: Some(1),
                max_pages: Some(10),
                page_size: None,
            },
        );

        let output = HtmlListingAdapter.run(&config, &client, &ctx).await.unwrap();
        assert_eq!(output.records.len(), 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }
}
