//! Detail-page parsing for the enrichment pipeline.
//!
//! Detail pages across portals share a shape: label/value pairs in a table
//! or definition list, plus attached documents. This parser mines those
//! pairs by label keyword instead of per-source selectors, so enrichment
//! works on any source with a direct URL.

use scraper::{Html, Selector};
use url::Url;

use licita_core::dates;
use licita_core::models::AttachedFile;

/// Field-additive facts recovered from a detail page.
#[derive(Debug, Default, Clone)]
pub struct DetailFields {
    pub description: Option<String>,
    pub budget_text: Option<String>,
    pub currency: Option<String>,
    pub opening_date: Option<chrono::NaiveDate>,
    pub expedient_number: Option<String>,
    pub attached_files: Vec<AttachedFile>,
}

impl DetailFields {
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.budget_text.is_none()
            && self.opening_date.is_none()
            && self.expedient_number.is_none()
            && self.attached_files.is_empty()
    }
}

/// Parses a detail page. Synchronous: `scraper::Html` never crosses an
/// await point.
pub fn parse_detail(body: &str, base: &Url) -> DetailFields {
    let document = Html::parse_document(body);
    let mut fields = DetailFields::default();

    let tr_sel = Selector::parse("tr").expect("static selector");
    let cell_sel = Selector::parse("th, td").expect("static selector");
    for row in document.select(&tr_sel) {
        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|c| collapse(&c.text().collect::<String>()))
            .collect();
        if cells.len() >= 2 {
            apply_pair(&mut fields, &cells[0], &cells[1..].join(" "));
        }
    }

    let dt_sel = Selector::parse("dt").expect("static selector");
    let dd_sel = Selector::parse("dd").expect("static selector");
    for (dt, dd) in document.select(&dt_sel).zip(document.select(&dd_sel)) {
        apply_pair(
            &mut fields,
            &collapse(&dt.text().collect::<String>()),
            &collapse(&dd.text().collect::<String>()),
        );
    }

    // Free-text fallback for the opening date.
    if fields.opening_date.is_none() {
        let text = collapse(&document.root_element().text().collect::<String>());
        fields.opening_date =
            dates::find_labeled_date(&text, &["fecha de apertura", "apertura"]);
    }

    let pdf_sel =
        Selector::parse("a[href$='.pdf'], a[href$='.PDF'], a[href$='.doc'], a[href$='.docx']")
            .expect("static selector");
    for link in document.select(&pdf_sel) {
        if let Some(href) = link.value().attr("href") {
            if let Ok(absolute) = base.join(href) {
                let url = absolute.to_string();
                if fields.attached_files.iter().any(|f| f.url == url) {
                    continue;
                }
                let label = collapse(&link.text().collect::<String>());
                fields.attached_files.push(AttachedFile {
                    filename: if label.is_empty() {
                        filename_of(&absolute)
                    } else {
                        label
                    },
                    url,
                    mime: mime_of(&absolute),
                    size: None,
                });
            }
        }
    }

    fields
}

fn apply_pair(fields: &mut DetailFields, label: &str, value: &str) {
    let label = label.to_lowercase();
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    if (label.contains("objeto") || label.contains("descripci")) && fields.description.is_none() {
        fields.description = Some(value.to_string());
    } else if (label.contains("presupuesto") || label.contains("monto"))
        && fields.budget_text.is_none()
    {
        fields.budget_text = Some(value.to_string());
        if fields.currency.is_none() {
            fields.currency = dates::detect_currency(value).map(str::to_string);
        }
    } else if label.contains("moneda") && fields.currency.is_none() {
        fields.currency = dates::detect_currency(value).map(str::to_string);
    } else if label.contains("apertura") && fields.opening_date.is_none() {
        fields.opening_date = dates::parse_date(value);
    } else if label.contains("expediente") && fields.expedient_number.is_none() {
        fields.expedient_number = Some(value.to_string());
    }
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn filename_of(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut s| s.next_back().map(str::to_string))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "documento".to_string())
}

fn mime_of(url: &Url) -> Option<String> {
    let path = url.path().to_lowercase();
    if path.ends_with(".pdf") {
        Some("application/pdf".to_string())
    } else if path.ends_with(".doc") {
        Some("application/msword".to_string())
    } else if path.ends_with(".docx") {
        Some(
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document".to_string(),
        )
    } else {
        None
    }
}
