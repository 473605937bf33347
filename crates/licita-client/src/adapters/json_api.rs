//! Adapter for portals exposing a JSON listing API (COMPR.AR-style).
//!
//! Field locations are configured as dot paths in the source's selectors
//! map; pagination is a page-number query parameter.

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use licita_core::error::AppError;
use licita_core::models::{AdapterCategory, RawRecord, ScraperConfig, UrlQuality};

use crate::http::{FetchClient, FetchRequest};

use super::{AdapterContext, AdapterOutput, SourceAdapter};

pub struct JsonApiAdapter;

#[async_trait]
impl SourceAdapter for JsonApiAdapter {
    fn name(&self) -> &'static str {
        "json_api"
    }

    fn category(&self) -> AdapterCategory {
        AdapterCategory::Light
    }

    fn handles_url(&self, url: &Url) -> bool {
        url.path().contains("/api/") || url.path().ends_with(".json")
    }

    async fn run(
        &self,
        config: &ScraperConfig,
        client: &FetchClient,
        ctx: &AdapterContext,
    ) -> Result<AdapterOutput, AppError> {
        let base = Url::parse(&config.url).map_err(|_| AppError::InvalidUrl(config.url.clone()))?;
        let param = config.pagination.param.as_deref().unwrap_or("page");
        let start = config.pagination.start.unwrap_or(1);
        let max_pages = config.pagination.max_pages.unwrap_or(10);
        let paged = config.pagination.style.as_deref() == Some("page_param");

        let mut output = AdapterOutput::default();
        let pages = if paged { max_pages.max(1) } else { 1 };
        for page in start..start + pages {
            let mut url = base.clone();
            if paged {
                url.query_pairs_mut().append_pair(param, &page.to_string());
            }

            let request = FetchRequest::get(url.to_string()).with_timeout(self.category().timeout());
            let response = client.fetch(request, &ctx.cancel).await?;
            let body: Value = response.json()?;

            let count = parse_page(&body, config, &base, &mut output)?;
            tracing::debug!(source = %config.name, page, items = count, "json page parsed");
            if count == 0 {
                break;
            }
        }
        Ok(output)
    }
}

/// Extracts records from one JSON payload; returns how many items the page
/// carried (found, not necessarily parsed).
fn parse_page(
    body: &Value,
    config: &ScraperConfig,
    base: &Url,
    output: &mut AdapterOutput,
) -> Result<usize, AppError> {
    let items = match config.selectors.get("items") {
        Some(path) => pluck(body, path),
        None => Some(body),
    }
    .and_then(Value::as_array)
    .ok_or_else(|| {
        AppError::UnexpectedSchema(format!(
            "source '{}': items path did not resolve to an array",
            config.name
        ))
    })?;

    for (index, item) in items.iter().enumerate() {
        let Some(title) = field(item, config, "title").filter(|t| !t.is_empty()) else {
            output.push_warning(format!("item {} skipped: no title", index + 1));
            continue;
        };

        let mut record = RawRecord::new(&config.name, &config.jurisdiccion, &title);
        record.organization = field(item, config, "organization").unwrap_or_default();
        record.description = field(item, config, "description");
        record.expedient_number = field(item, config, "expediente");
        record.licitacion_number = field(item, config, "numero");
        record.category = field(item, config, "category");
        record.tipo_procedimiento = field(item, config, "tipo");
        record.budget_text = field(item, config, "budget");
        record.currency = field(item, config, "currency");
        record.publication_date = field(item, config, "published")
            .as_deref()
            .and_then(licita_core::dates::parse_date);
        record.opening_date = field(item, config, "opening")
            .as_deref()
            .and_then(licita_core::dates::parse_date);

        match field(item, config, "url").and_then(|u| base.join(&u).ok()) {
            Some(absolute) => {
                record.source_url = Some(absolute.to_string());
                record.url_quality = Some(UrlQuality::Direct);
            }
            None => {
                record.source_url = Some(base.to_string());
                record.url_quality = Some(UrlQuality::Partial);
            }
        }
        record.extra = item.clone();

        output.records.push(record);
    }
    Ok(items.len())
}

/// Walks a dot path into a JSON value.
fn pluck<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |acc, key| acc.get(key))
}

/// String-ish field at the configured path for `key`.
fn field(item: &Value, config: &ScraperConfig, key: &str) -> Option<String> {
    let path = config.selectors.get(key)?;
    let value = pluck(item, path)?;
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> ScraperConfig {
        let selectors: BTreeMap<String, String> = [
            ("items", "data"),
            ("title", "nombre"),
            ("organization", "unidad"),
            ("expediente", "expediente"),
            ("published", "fecha_publicacion"),
            ("opening", "fecha_apertura"),
            ("budget", "monto"),
            ("url", "enlace"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        ScraperConfig {
            name: "comprar-nacion".into(),
            url: url.into(),
            adapter: "json_api".into(),
            jurisdiccion: "Nacional".into(),
            category: AdapterCategory::Light,
            active: true,
            schedule: "0 */6 * * *".into(),
            selectors,
            pagination: licita_core::models::PaginationState {
                style: Some("page_param".into()),
                param: Some("page".into()),
                start: Some(1),
                max_pages: Some(5),
                page_size: None,
            },
            last_run: None,
            runs_count: 0,
            min_interval_hours: None,
            adaptive_schedule: false,
            paused_reason: None,
        }
    }

    #[test]
    fn test_parse_page_extracts_fields() {
        let body = serde_json::json!({
            "data": [{
                "nombre": "Adquisición de tomógrafos",
                "unidad": "Ministerio de Salud",
                "expediente": "EX-2025-00123",
                "fecha_publicacion": "2025-07-01",
                "fecha_apertura": "15/08/2025",
                "monto": 98700000.5,
                "enlace": "/procesos/123"
            }]
        });
        let config = config("https://comprar.gob.ar/api/procesos");
        let base = Url::parse(&config.url).unwrap();
        let mut output = AdapterOutput::default();

        let count = parse_page(&body, &config, &base, &mut output).unwrap();
        assert_eq!(count, 1);
        let r = &output.records[0];
        assert_eq!(r.title, "Adquisición de tomógrafos");
        assert_eq!(r.organization, "Ministerio de Salud");
        assert_eq!(
            r.publication_date,
            chrono::NaiveDate::from_ymd_opt(2025, 7, 1)
        );
        assert_eq!(r.opening_date, chrono::NaiveDate::from_ymd_opt(2025, 8, 15));
        assert_eq!(r.budget_text.as_deref(), Some("98700000.5"));
        assert_eq!(
            r.source_url.as_deref(),
            Some("https://comprar.gob.ar/procesos/123")
        );
        assert_eq!(r.url_quality, Some(UrlQuality::Direct));
    }

    #[test]
    fn test_parse_page_item_without_title_warns() {
        let body = serde_json::json!({ "data": [{ "unidad": "X" }] });
        let config = config("https://comprar.gob.ar/api/procesos");
        let base = Url::parse(&config.url).unwrap();
        let mut output = AdapterOutput::default();

        let count = parse_page(&body, &config, &base, &mut output).unwrap();
        assert_eq!(count, 1);
        assert!(output.records.is_empty());
        assert_eq!(output.warnings.len(), 1);
    }

    #[test]
    fn test_parse_page_wrong_shape() {
        let body = serde_json::json!({ "data": "not an array" });
        let config = config("https://comprar.gob.ar/api/procesos");
        let base = Url::parse(&config.url).unwrap();
        let mut output = AdapterOutput::default();
        assert!(matches!(
            parse_page(&body, &config, &base, &mut output),
            Err(AppError::UnexpectedSchema(_))
        ));
    }

    #[test]
    fn test_pluck_nested_path() {
        let v = serde_json::json!({ "a": { "b": { "c": 7 } } });
        assert_eq!(pluck(&v, "a.b.c"), Some(&serde_json::json!(7)));
        assert_eq!(pluck(&v, "a.x"), None);
    }

    #[tokio::test]
    async fn test_run_paginates_until_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "nombre": "Proceso uno" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "nombre": "Proceso dos" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page", "3"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": [] })),
            )
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
        let config = config(&format!("{}/api/procesos", server.uri()));

        let output = JsonApiAdapter.run(&config, &client, &ctx).await.unwrap();
        assert_eq!(output.records.len(), 2);
        assert_eq!(output.records[0].title, "Proceso uno");
        assert_eq!(output.records[1].title, "Proceso dos");
    }
}
