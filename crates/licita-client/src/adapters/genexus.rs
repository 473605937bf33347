//! GeneXus grid adapter.
//!
//! GeneXus-generated portals keep the whole grid state in a `GXState`
//! hidden field and page through event POSTs against the same servlet.
//! Like WebForms, the state must be echoed back and cookies must persist,
//! so paging runs inside a sticky session.

use async_trait::async_trait;
use url::Url;

use licita_core::error::AppError;
use licita_core::models::{AdapterCategory, ScraperConfig};

use crate::http::{FetchClient, FetchRequest};

use super::rows;
use super::{AdapterContext, AdapterOutput, SourceAdapter};

const DEFAULT_EVENT: &str = "EGRID_PAGING";

pub struct GenexusAdapter;

#[async_trait]
impl SourceAdapter for GenexusAdapter {
    fn name(&self) -> &'static str {
        "genexus"
    }

    fn category(&self) -> AdapterCategory {
        AdapterCategory::Medium
    }

    fn handles_url(&self, url: &Url) -> bool {
        url.path().to_lowercase().contains("servlet")
    }

    async fn run(
        &self,
        config: &ScraperConfig,
        client: &FetchClient,
        ctx: &AdapterContext,
    ) -> Result<AdapterOutput, AppError> {
        let base = Url::parse(&config.url).map_err(|_| AppError::InvalidUrl(config.url.clone()))?;
        let session = client.session()?;
        let timeout = self.category().timeout();

        let response = session
            .fetch(FetchRequest::get(base.as_str()).with_timeout(timeout), &ctx.cancel)
            .await?;
        let body = response.text();

        let mut output = AdapterOutput::default();
        let page = rows::parse_listing(&body, config, &base)?;
        output.records.extend(page.records);
        output.warnings.extend(page.warnings);

        let mut state = match rows::extract_hidden_fields(&body).remove("GXState") {
            Some(state) => state,
            None => {
                output.push_warning("no GXState on first page, not paging".to_string());
                return Ok(output);
            }
        };

        let event = config
            .selectors
            .get("event")
            .cloned()
            .unwrap_or_else(|| DEFAULT_EVENT.to_string());
        let max_pages = config.pagination.max_pages.unwrap_or(10).max(1);

        for page_number in 2..=max_pages {
            let form = vec![
                ("GXState".to_string(), state.clone()),
                ("_EventName".to_string(), event.clone()),
                ("_EventGridPage".to_string(), page_number.to_string()),
            ];
            let response = session
                .fetch(
                    FetchRequest::post_form(base.as_str(), form).with_timeout(timeout),
                    &ctx.cancel,
                )
                .await?;
            let body = response.text();

            let page = rows::parse_listing(&body, config, &base)?;
            let count = page.records.len();
            tracing::debug!(source = %config.name, page = page_number, items = count, "grid page parsed");
            output.records.extend(page.records);
            output.warnings.extend(page.warnings);
            if count == 0 {
                break;
            }

            match rows::extract_hidden_fields(&body).remove("GXState") {
                Some(next) => state = next,
                None => {
                    output.push_warning(format!(
                        "page {}: response lost GXState, stopping",
                        page_number
                    ));
                    break;
                }
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> ScraperConfig {
        let selectors: BTreeMap<String, String> = [("row", "table tr"), ("title", "td.obj")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ScraperConfig {
            name: "compras-gx".into(),
            url: url.into(),
            adapter: "genexus".into(),
            jurisdiccion: "Mendoza".into(),
            category: AdapterCategory::Medium,
            active: true,
            schedule: "0 */6 * * *".into(),
            selectors,
            pagination: licita_core::models::PaginationState {
                max_pages: Some(2),
                ..Default::default()
            },
            last_run: None,
            runs_count: 0,
            min_interval_hours: None,
            adaptive_schedule: false,
            paused_reason: None,
        }
    }

    fn grid(title: &str, state: &str) -> String {
        format!(
            r#"<form>
<input type="hidden" name="GXState" value="{}" />
<table><tr><td class="obj">{}</td></tr></table>
</form>"#,
            state, title
        )
    }

    #[tokio::test]
    async fn test_grid_paging_carries_gxstate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(grid("Proceso uno", "gx-1")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("GXState=gx-1"))
            .and(body_string_contains("_EventGridPage=2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(grid("Proceso dos", "gx-2")))
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
        let config = config(&format!("{}/servlet/com.compras.listado", server.uri()));

        let output = GenexusAdapter.run(&config, &client, &ctx).await.unwrap();
        let titles: Vec<&str> = output.records.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Proceso uno", "Proceso dos"]);
    }

    #[tokio::test]
    async fn test_missing_gxstate_single_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<table><tr><td class='obj'>Sin estado</td></tr></table>",
            ))
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
        let config = config(&format!("{}/servlet/com.compras.listado", server.uri()));

        let output = GenexusAdapter.run(&config, &client, &ctx).await.unwrap();
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.warnings.len(), 1);
    }
}
