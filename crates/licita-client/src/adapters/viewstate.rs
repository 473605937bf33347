//! ASP.NET WebForms adapter.
//!
//! These portals page through a grid by POSTing the whole form back to the
//! same URL: `__VIEWSTATE`, `__EVENTVALIDATION` and friends must be echoed
//! verbatim, and the pager is an `__EVENTTARGET`/`__EVENTARGUMENT` pair.
//! State also rides in cookies, so everything goes through one sticky
//! session.

use async_trait::async_trait;
use url::Url;

use licita_core::error::AppError;
use licita_core::models::{AdapterCategory, ScraperConfig};

use crate::http::{FetchClient, FetchRequest};

use super::rows;
use super::{AdapterContext, AdapterOutput, SourceAdapter};

pub struct ViewstateAdapter;

#[async_trait]
impl SourceAdapter for ViewstateAdapter {
    fn name(&self) -> &'static str {
        "viewstate"
    }

    fn category(&self) -> AdapterCategory {
        AdapterCategory::Medium
    }

    fn handles_url(&self, url: &Url) -> bool {
        url.path().to_lowercase().ends_with(".aspx")
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
        let mut hidden = rows::extract_hidden_fields(&body);

        // Without a pager target the grid is single-page.
        let Some(event_target) = config.selectors.get("event_target").cloned() else {
            return Ok(output);
        };
        if !hidden.contains_key("__VIEWSTATE") {
            output.push_warning("no __VIEWSTATE on first page, not paging".to_string());
            return Ok(output);
        }

        let max_pages = config.pagination.max_pages.unwrap_or(10).max(1);
        for page_number in 2..=max_pages {
            let mut form: Vec<(String, String)> = hidden
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            form.push(("__EVENTTARGET".to_string(), event_target.clone()));
            form.push((
                "__EVENTARGUMENT".to_string(),
                format!("Page${}", page_number),
            ));

            let response = session
                .fetch(
                    FetchRequest::post_form(base.as_str(), form).with_timeout(timeout),
                    &ctx.cancel,
                )
                .await?;
            let body = response.text();

            let page = rows::parse_listing(&body, config, &base)?;
            let count = page.records.len();
            tracing::debug!(source = %config.name, page = page_number, items = count, "postback page parsed");
            output.records.extend(page.records);
            output.warnings.extend(page.warnings);
            if count == 0 {
                break;
            }

            let next_hidden = rows::extract_hidden_fields(&body);
            if !next_hidden.contains_key("__VIEWSTATE") {
                output.push_warning(format!(
                    "page {}: postback response lost __VIEWSTATE, stopping",
                    page_number
                ));
                break;
            }
            hidden = next_hidden;
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
        let selectors: BTreeMap<String, String> = [
            ("row", "table tr"),
            ("title", "td.obj"),
            ("event_target", "ctl00$cph$dgResultado"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        ScraperConfig {
            name: "comprar-mza".into(),
            url: url.into(),
            adapter: "viewstate".into(),
            jurisdiccion: "Mendoza".into(),
            category: AdapterCategory::Medium,
            active: true,
            schedule: "0 */6 * * *".into(),
            selectors,
            pagination: licita_core::models::PaginationState {
                max_pages: Some(3),
                ..Default::default()
            },
            last_run: None,
            runs_count: 0,
            min_interval_hours: None,
            adaptive_schedule: false,
            paused_reason: None,
        }
    }

    fn grid_page(title: &str, viewstate: &str) -> String {
        format!(
            r#"<form>
<input type="hidden" name="__VIEWSTATE" value="{}" />
<input type="hidden" name="__EVENTVALIDATION" value="ev" />
<table><tr><td class="obj">{}</td></tr></table>
</form>"#,
            viewstate, title
        )
    }

    #[tokio::test]
    async fn test_postback_paging_carries_viewstate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(grid_page("Proceso uno", "vs-1")),
            )
            .mount(&server)
            .await;
        // Page 2 must carry the first page's VIEWSTATE and the pager event.
        Mock::given(method("POST"))
            .and(body_string_contains("__VIEWSTATE=vs-1"))
            .and(body_string_contains("__EVENTARGUMENT=Page%242"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(grid_page("Proceso dos", "vs-2")),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("__VIEWSTATE=vs-2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<form><input type=\"hidden\" name=\"__VIEWSTATE\" value=\"vs-3\" /><table></table></form>",
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
        let config = config(&format!("{}/Compras.aspx", server.uri()));

        let output = ViewstateAdapter.run(&config, &client, &ctx).await.unwrap();
        let titles: Vec<&str> = output.records.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Proceso uno", "Proceso dos"]);
    }

    #[tokio::test]
    async fn test_missing_viewstate_stops_paging() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<table><tr><td class='obj'>Único proceso</td></tr></table>",
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
        let config = config(&format!("{}/Compras.aspx", server.uri()));

        let output = ViewstateAdapter.run(&config, &client, &ctx).await.unwrap();
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.warnings.len(), 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
