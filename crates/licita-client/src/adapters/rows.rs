//! Selector-driven extraction shared by the HTML-based adapters.
//!
//! These helpers are synchronous on purpose: `scraper::Html` is not `Send`,
//! so parsing happens in a plain function between fetches and never lives
//! across an await point.

use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;
use url::Url;

use licita_core::dates;
use licita_core::error::AppError;
use licita_core::models::{AttachedFile, RawRecord, ScraperConfig, UrlQuality};

/// Result of parsing one listing page.
pub(crate) struct ParsedPage {
    pub records: Vec<RawRecord>,
    pub warnings: Vec<String>,
}

/// Compiles the selector under `key`, if configured.
pub(crate) fn selector(config: &ScraperConfig, key: &str) -> Result<Option<Selector>, AppError> {
    match config.selectors.get(key) {
        None => Ok(None),
        Some(raw) => Selector::parse(raw).map(Some).map_err(|e| {
            AppError::Config(format!(
                "source '{}': bad selector {}='{}': {}",
                config.name, key, raw, e
            ))
        }),
    }
}

fn required_selector(config: &ScraperConfig, key: &str) -> Result<Selector, AppError> {
    selector(config, key)?.ok_or_else(|| {
        AppError::Config(format!(
            "source '{}' needs a '{}' selector",
            config.name, key
        ))
    })
}

/// Text content of the first match under `sel`, whitespace-collapsed.
fn select_text(row: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    row.select(sel).next().map(|el| collapse(&el.text().collect::<String>()))
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parses one listing page into raw records using the config's selectors.
///
/// Recognized selector keys: `row` (required), `title` (defaults to the
/// whole row text), `organization`, `expediente`, `numero`, `published`,
/// `opening`, `budget`, `category`, `tipo`, `description`, `link`
/// (defaults to `a[href]`). Rows without a title are skipped with a
/// warning; nothing here aborts the page.
pub(crate) fn parse_listing(
    body: &str,
    config: &ScraperConfig,
    base: &Url,
) -> Result<ParsedPage, AppError> {
    let row_sel = required_selector(config, "row")?;
    let title_sel = selector(config, "title")?;
    let org_sel = selector(config, "organization")?;
    let expediente_sel = selector(config, "expediente")?;
    let numero_sel = selector(config, "numero")?;
    let published_sel = selector(config, "published")?;
    let opening_sel = selector(config, "opening")?;
    let budget_sel = selector(config, "budget")?;
    let category_sel = selector(config, "category")?;
    let tipo_sel = selector(config, "tipo")?;
    let description_sel = selector(config, "description")?;
    let link_sel = match selector(config, "link")? {
        Some(s) => s,
        None => Selector::parse("a[href]").expect("static selector"),
    };
    let pdf_sel = Selector::parse("a[href$='.pdf'], a[href$='.PDF']").expect("static selector");

    let document = Html::parse_document(body);
    let mut page = ParsedPage {
        records: Vec::new(),
        warnings: Vec::new(),
    };

    for (index, row) in document.select(&row_sel).enumerate() {
        let title = match &title_sel {
            Some(sel) => select_text(&row, sel),
            None => Some(collapse(&row.text().collect::<String>())),
        }
        .unwrap_or_default();
        if title.is_empty() {
            // Header rows and separators land here; only warn when the row
            // had cells worth parsing.
            if row.children().count() > 1 && index > 0 {
                page.warnings
                    .push(format!("row {} skipped: no title", index + 1));
            }
            continue;
        }

        let mut record = RawRecord::new(&config.name, &config.jurisdiccion, &title);
        record.organization = org_sel
            .as_ref()
            .and_then(|s| select_text(&row, s))
            .unwrap_or_default();
        record.expedient_number = expediente_sel.as_ref().and_then(|s| select_text(&row, s));
        record.licitacion_number = numero_sel.as_ref().and_then(|s| select_text(&row, s));
        record.category = category_sel.as_ref().and_then(|s| select_text(&row, s));
        record.tipo_procedimiento = tipo_sel.as_ref().and_then(|s| select_text(&row, s));
        record.description = description_sel.as_ref().and_then(|s| select_text(&row, s));
        record.budget_text = budget_sel.as_ref().and_then(|s| select_text(&row, s));

        record.publication_date = published_sel
            .as_ref()
            .and_then(|s| select_text(&row, s))
            .as_deref()
            .and_then(dates::parse_date);
        record.opening_date = opening_sel
            .as_ref()
            .and_then(|s| select_text(&row, s))
            .as_deref()
            .and_then(dates::parse_date);

        if let Some(href) = row
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
        {
            if let Ok(absolute) = base.join(href) {
                record.source_url = Some(absolute.to_string());
                record.url_quality = Some(UrlQuality::Direct);
            }
        }
        if record.source_url.is_none() {
            record.source_url = Some(base.to_string());
            record.url_quality = Some(UrlQuality::Partial);
        }

        for pdf in row.select(&pdf_sel) {
            if let Some(href) = pdf.value().attr("href") {
                if let Ok(absolute) = base.join(href) {
                    record.attached_files.push(AttachedFile {
                        filename: filename_of(&absolute),
                        url: absolute.to_string(),
                        mime: Some("application/pdf".to_string()),
                        size: None,
                    });
                }
            }
        }

        page.records.push(record);
    }

    Ok(page)
}

fn filename_of(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut s| s.next_back().map(str::to_string))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "documento.pdf".to_string())
}

/// All `<input type="hidden">` name/value pairs. WebForms and GeneXus
/// postbacks must echo these back on every request.
pub(crate) fn extract_hidden_fields(body: &str) -> BTreeMap<String, String> {
    let document = Html::parse_document(body);
    let sel = Selector::parse("input[type='hidden']").expect("static selector");
    document
        .select(&sel)
        .filter_map(|input| {
            let name = input.value().attr("name")?.to_string();
            let value = input.value().attr("value").unwrap_or("").to_string();
            Some((name, value))
        })
        .collect()
}

/// Resolves the "next page" link, if the page has one under the selector.
pub(crate) fn next_page_url(body: &str, selector: &Selector, base: &Url) -> Option<String> {
    let document = Html::parse_document(body);
    document
        .select(selector)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| base.join(href).ok())
        .map(|u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use licita_core::models::AdapterCategory;

    fn config_with(selectors: &[(&str, &str)]) -> ScraperConfig {
        ScraperConfig {
            name: "prueba".into(),
            url: "https://portal.gov.ar/listado".into(),
            adapter: "html_listing".into(),
            jurisdiccion: "Mendoza".into(),
            category: AdapterCategory::Light,
            active: true,
            schedule: "0 */6 * * *".into(),
            selectors: selectors
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            pagination: Default::default(),
            last_run: None,
            runs_count: 0,
            min_interval_hours: None,
            adaptive_schedule: false,
            paused_reason: None,
        }
    }

    const LISTING: &str = r#"
<table class="grid">
  <tr><th>Expediente</th><th>Objeto</th><th>Apertura</th></tr>
  <tr>
    <td class="exp">EX-2025-00123</td>
    <td class="obj"><a href="/proceso/123">Adquisición de ambulancias</a></td>
    <td class="fecha">15/08/2025</td>
    <td><a href="/docs/pliego-123.pdf">Pliego</a></td>
  </tr>
  <tr>
    <td class="exp">EX-2025-00456</td>
    <td class="obj"><a href="/proceso/456">Obra de red cloacal</a></td>
    <td class="fecha">20/09/2025</td>
  </tr>
</table>
"#;

    #[test]
    fn test_parse_listing_extracts_rows() {
        let config = config_with(&[
            ("row", "table.grid tr"),
            ("title", "td.obj"),
            ("expediente", "td.exp"),
            ("opening", "td.fecha"),
        ]);
        let base = Url::parse("https://portal.gov.ar/listado").unwrap();
        let page = parse_listing(LISTING, &config, &base).unwrap();

        assert_eq!(page.records.len(), 2);
        let first = &page.records[0];
        assert_eq!(first.title, "Adquisición de ambulancias");
        assert_eq!(first.expedient_number.as_deref(), Some("EX-2025-00123"));
        assert_eq!(
            first.opening_date,
            chrono::NaiveDate::from_ymd_opt(2025, 8, 15)
        );
        assert_eq!(
            first.source_url.as_deref(),
            Some("https://portal.gov.ar/proceso/123")
        );
        assert_eq!(first.url_quality, Some(UrlQuality::Direct));
        assert_eq!(first.attached_files.len(), 1);
        assert_eq!(first.attached_files[0].filename, "pliego-123.pdf");
    }

    #[test]
    fn test_parse_listing_row_without_link_is_partial() {
        let config = config_with(&[("row", "li"), ("title", "span")]);
        let base = Url::parse("https://portal.gov.ar/boletin").unwrap();
        let body = "<ul><li><span>Licitación sin enlace</span></li></ul>";
        let page = parse_listing(body, &config, &base).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(
            page.records[0].source_url.as_deref(),
            Some("https://portal.gov.ar/boletin")
        );
        assert_eq!(page.records[0].url_quality, Some(UrlQuality::Partial));
    }

    #[test]
    fn test_parse_listing_requires_row_selector() {
        let config = config_with(&[]);
        let base = Url::parse("https://portal.gov.ar").unwrap();
        assert!(matches!(
            parse_listing("<html></html>", &config, &base),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_parse_listing_bad_selector() {
        let config = config_with(&[("row", "tr"), ("title", ":::nope")]);
        let base = Url::parse("https://portal.gov.ar").unwrap();
        assert!(matches!(
            parse_listing("<table><tr></tr></table>", &config, &base),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_extract_hidden_fields() {
        let body = r#"
<form>
  <input type="hidden" name="__VIEWSTATE" value="dDwtMTA..." />
  <input type="hidden" name="__EVENTVALIDATION" value="abc" />
  <input type="text" name="buscar" value="no" />
</form>
"#;
        let fields = extract_hidden_fields(body);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.get("__VIEWSTATE").map(String::as_str), Some("dDwtMTA..."));
        assert!(!fields.contains_key("buscar"));
    }

    #[test]
    fn test_next_page_url() {
        let body = r#"<div class="pager"><a class="next" href="?page=3">Siguiente</a></div>"#;
        let sel = Selector::parse("a.next").unwrap();
        let base = Url::parse("https://portal.gov.ar/listado?page=2").unwrap();
        assert_eq!(
            next_page_url(body, &sel, &base).as_deref(),
            Some("https://portal.gov.ar/listado?page=3")
        );
        assert_eq!(next_page_url("<div></div>", &sel, &base), None);
    }
}
