//! Record resolver: date fallback chains, estado computation, canonical URL
//! classification, and content-hash identity.
//!
//! Pure business logic, decoupled from I/O: "today" is an argument, never
//! read from a clock, so estado is reproducible in tests and across a full
//! corpus recomputation.

use chrono::{Datelike, Duration, NaiveDate};
use serde_json::json;
use url::Url;

use crate::dates;
use crate::models::{Estado, NewLicitacion, RawRecord, UrlQuality};

/// Records published before this day are archived regardless of estado.
fn archive_cutoff() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).expect("static date")
}

/// Why a raw record was not ingested. Counted as a run warning; never
/// aborts the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingTitle,
    YearOutOfRange(i32),
}

impl SkipReason {
    pub fn describe(&self) -> String {
        match self {
            SkipReason::MissingTitle => "missing required field: title".to_string(),
            SkipReason::YearOutOfRange(y) => format!("year {} outside accepted window", y),
        }
    }
}

/// A resolved record plus the warnings produced while resolving it.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub record: NewLicitacion,
    pub warnings: Vec<String>,
}

/// Vigencia as a pure function of the three date fields and "today".
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use licita_core::models::Estado;
/// use licita_core::resolver::compute_estado;
///
/// let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
/// let today = d(2025, 6, 1);
///
/// assert_eq!(compute_estado(Some(d(2024, 11, 1)), None, None, today), Estado::Archivada);
/// assert_eq!(compute_estado(Some(d(2025, 5, 1)), Some(d(2025, 8, 1)), None, today), Estado::Vigente);
/// assert_eq!(compute_estado(Some(d(2025, 3, 1)), Some(d(2025, 5, 1)), None, today), Estado::Vencida);
/// assert_eq!(
///     compute_estado(Some(d(2025, 3, 1)), Some(d(2025, 5, 1)), Some(d(2025, 7, 1)), today),
///     Estado::Prorrogada
/// );
/// ```
pub fn compute_estado(
    publication_date: Option<NaiveDate>,
    opening_date: Option<NaiveDate>,
    fecha_prorroga: Option<NaiveDate>,
    today: NaiveDate,
) -> Estado {
    if let Some(publication) = publication_date {
        if publication < archive_cutoff() {
            return Estado::Archivada;
        }
    }
    if let Some(opening) = opening_date {
        if opening < today {
            if let Some(prorroga) = fecha_prorroga {
                if prorroga > today {
                    return Estado::Prorrogada;
                }
            }
            return Estado::Vencida;
        }
    }
    Estado::Vigente
}

/// Resolves a raw adapter record into a storable [`NewLicitacion`].
///
/// Applies the publication/opening fallback chains, repairs date-order
/// violations, computes estado and the content hash, classifies the source
/// URL, and derives the nodo tag. Records with out-of-window years or
/// without a title are skipped.
pub fn resolve(raw: RawRecord, today: NaiveDate) -> Result<Resolution, SkipReason> {
    let title = raw.title.trim().to_string();
    if title.is_empty() {
        return Err(SkipReason::MissingTitle);
    }

    // Adapter-supplied dates with years outside the window make the whole
    // record non-ingestable; text-derived dates below are already filtered.
    for date in [raw.publication_date, raw.opening_date, raw.fecha_prorroga]
        .into_iter()
        .flatten()
    {
        if !dates::in_year_window(date) {
            return Err(SkipReason::YearOutOfRange(date.year()));
        }
    }

    let mut warnings = Vec::new();
    let mut metadata = match &raw.extra {
        serde_json::Value::Object(map) if !map.is_empty() => {
            json!({ "source_extra": map.clone() })
        }
        _ => json!({}),
    };

    let description = raw
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string);
    let desc_head = description
        .as_deref()
        .map(|d| dates::truncate_chars(d, 500))
        .unwrap_or("");

    // Publication chain: parsed -> title -> description head -> year from
    // title -> year from description. Cross-derivation from the opening
    // date and the filename scan happen after the opening chain.
    let mut year_only = false;
    let mut publication_date = raw
        .publication_date
        .or_else(|| dates::find_unlabeled_date(&title).filter(|d| dates::in_year_window(*d)))
        .or_else(|| dates::find_unlabeled_date(desc_head).filter(|d| dates::in_year_window(*d)));
    if publication_date.is_none() {
        let year = dates::extract_year(&title).or_else(|| dates::extract_year(desc_head));
        if let Some(y) = year {
            publication_date = NaiveDate::from_ymd_opt(y, 1, 1);
            year_only = true;
        }
    }

    // Opening chain: parsed -> labeled "Apertura" in description or title.
    let mut opening_date = raw.opening_date.or_else(|| {
        let labels = ["fecha de apertura", "apertura"];
        dates::find_labeled_date(description.as_deref().unwrap_or(""), &labels)
            .or_else(|| dates::find_labeled_date(&title, &labels))
            .filter(|d| dates::in_year_window(*d))
    });

    // Cross-derivation and filename scans, in chain order.
    if publication_date.is_none() {
        if let Some(opening) = opening_date {
            publication_date = Some(opening - Duration::days(30));
            set_meta(&mut metadata, "publication_date_derived", json!("opening_minus_30d"));
        }
    }
    if publication_date.is_none() {
        publication_date = scan_filenames(&raw, &mut year_only);
    }
    if opening_date.is_none() {
        if let Some(publication) = publication_date {
            opening_date = Some(publication + Duration::days(45));
            set_meta(&mut metadata, "opening_date_estimated", json!(true));
        }
    }
    if opening_date.is_none() {
        opening_date = raw
            .attached_files
            .iter()
            .find_map(|f| dates::parse_date(&f.filename))
            .filter(|d| dates::in_year_window(*d));
    }
    if year_only {
        set_meta(&mut metadata, "publication_date_precision", json!("year"));
    }

    // Order repair: opening before publication means the publication value
    // was wrong (usually a deadline mis-scraped into the wrong column).
    if let (Some(publication), Some(opening)) = (publication_date, opening_date) {
        if dates::validate_order(publication, opening).is_err() {
            publication_date = Some(opening - Duration::days(30));
            set_meta(&mut metadata, "reason", json!("date_order_violation"));
            warnings.push(format!(
                "date order violation: publication {} > opening {}, repaired",
                publication, opening
            ));
        }
    }

    let estado = compute_estado(publication_date, opening_date, raw.fecha_prorroga, today);

    let (canonical_url, url_quality) = classify_url(&raw);
    let mut source_urls = std::collections::BTreeMap::new();
    if let Some(url) = &canonical_url {
        source_urls.insert(raw.source.clone(), url.clone());
    }

    let budget = raw.budget_text.as_deref().and_then(dates::parse_budget);
    let currency = raw.currency.clone().or_else(|| {
        raw.budget_text
            .as_deref()
            .and_then(dates::detect_currency)
            .map(str::to_string)
    });

    let organization = normalize_whitespace(&raw.organization);
    let content_hash = NewLicitacion::compute_content_hash(&title, &raw.source, publication_date);
    let nodo = derive_nodo(raw.category.as_deref(), &title);
    set_meta(&mut metadata, "fuentes", json!([raw.source.clone()]));

    Ok(Resolution {
        record: NewLicitacion {
            id: uuid::Uuid::new_v4(),
            title,
            organization,
            fuente: raw.source,
            jurisdiccion: raw.jurisdiccion,
            category: raw.category,
            tipo_procedimiento: raw.tipo_procedimiento,
            nodo,
            description,
            publication_date,
            opening_date,
            fecha_prorroga: raw.fecha_prorroga,
            estado,
            budget,
            currency,
            expedient_number: raw.expedient_number.filter(|s| !s.trim().is_empty()),
            licitacion_number: raw.licitacion_number.filter(|s| !s.trim().is_empty()),
            canonical_url,
            url_quality,
            source_urls,
            content_hash,
            attached_files: dedupe_files(raw.attached_files),
            enrichment_level: 1,
            metadata,
        },
        warnings,
    })
}

/// Classifies the adapter's URL. The adapter's own hint wins; without one,
/// a URL that plausibly identifies a single process (id-like query param or
/// numeric tail segment) counts as direct, anything else as the listing.
fn classify_url(raw: &RawRecord) -> (Option<String>, UrlQuality) {
    let Some(raw_url) = raw.source_url.as_deref() else {
        return (None, UrlQuality::Partial);
    };
    let Ok(parsed) = Url::parse(raw_url) else {
        return (None, UrlQuality::Partial);
    };
    let quality = raw.url_quality.unwrap_or_else(|| {
        let id_in_query = parsed
            .query_pairs()
            .any(|(k, v)| k.to_lowercase().contains("id") && !v.is_empty());
        let numeric_tail = parsed
            .path_segments()
            .and_then(|mut s| s.next_back().map(|seg| seg.chars().any(|c| c.is_ascii_digit())))
            .unwrap_or(false);
        if id_in_query || numeric_tail {
            UrlQuality::Direct
        } else {
            UrlQuality::Partial
        }
    });
    (Some(parsed.into()), quality)
}

/// Publication-date filename scan: full date first, then a bare year.
fn scan_filenames(raw: &RawRecord, year_only: &mut bool) -> Option<NaiveDate> {
    let full = raw
        .attached_files
        .iter()
        .find_map(|f| dates::parse_date(&f.filename))
        .filter(|d| dates::in_year_window(*d));
    if full.is_some() {
        return full;
    }
    let year = raw
        .attached_files
        .iter()
        .find_map(|f| dates::extract_year(&f.filename))?;
    *year_only = true;
    NaiveDate::from_ymd_opt(year, 1, 1)
}

fn set_meta(metadata: &mut serde_json::Value, key: &str, value: serde_json::Value) {
    if let serde_json::Value::Object(map) = metadata {
        map.insert(key.to_string(), value);
    }
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn dedupe_files(files: Vec<crate::models::AttachedFile>) -> Vec<crate::models::AttachedFile> {
    let mut seen = std::collections::HashSet::new();
    files
        .into_iter()
        .filter(|f| seen.insert(f.url.clone()))
        .collect()
}

/// Nodo tag grouping related rubros, derived from the category (or, when
/// the source has none, keywords in the title).
pub fn derive_nodo(category: Option<&str>, title: &str) -> Option<String> {
    const TABLE: &[(&str, &str)] = &[
        ("obra", "obras"),
        ("construcc", "obras"),
        ("pavimenta", "obras"),
        ("infraestructura", "obras"),
        ("vial", "obras"),
        ("salud", "salud"),
        ("hospital", "salud"),
        ("medicamento", "salud"),
        ("insumo", "salud"),
        ("inform", "tecnologia"),
        ("software", "tecnologia"),
        ("tecnolog", "tecnologia"),
        ("alimento", "alimentos"),
        ("transporte", "transporte"),
        ("vehícul", "transporte"),
        ("vehicul", "transporte"),
        ("combustible", "transporte"),
        ("servicio", "servicios"),
        ("limpieza", "servicios"),
        ("seguridad", "servicios"),
    ];
    let haystack = format!(
        "{} {}",
        category.unwrap_or("").to_lowercase(),
        title.to_lowercase()
    );
    TABLE
        .iter()
        .find(|(needle, _)| haystack.contains(needle))
        .map(|(_, nodo)| nodo.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttachedFile;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn raw(title: &str) -> RawRecord {
        let mut r = RawRecord::new("comprar-mza", "Mendoza", title);
        r.organization = "Ministerio de Salud".into();
        r
    }

    #[test]
    fn test_estado_no_dates_is_vigente() {
        assert_eq!(compute_estado(None, None, None, d(2025, 6, 1)), Estado::Vigente);
    }

    #[test]
    fn test_estado_prorroga_already_past_is_vencida() {
        let estado = compute_estado(
            Some(d(2025, 3, 1)),
            Some(d(2025, 4, 1)),
            Some(d(2025, 5, 1)),
            d(2025, 6, 1),
        );
        assert_eq!(estado, Estado::Vencida);
    }

    #[test]
    fn test_estado_opens_today_is_vigente() {
        let today = d(2025, 6, 1);
        let estado = compute_estado(Some(d(2025, 5, 1)), Some(today), None, today);
        assert_eq!(estado, Estado::Vigente);
    }

    #[test]
    fn test_estado_archivada_beats_everything() {
        let estado = compute_estado(
            Some(d(2024, 6, 1)),
            Some(d(2026, 1, 1)),
            None,
            d(2025, 6, 1),
        );
        assert_eq!(estado, Estado::Archivada);
    }

    // Date fallback: year-only title + labeled apertura in description.
    #[test]
    fn test_resolve_year_fallback_scenario() {
        let mut r = raw("Licitación Pública Nº 45/2025");
        r.description = Some("Apertura: 15/08/2025".into());

        let res = resolve(r, d(2025, 6, 1)).unwrap();
        assert_eq!(res.record.publication_date, Some(d(2025, 1, 1)));
        assert_eq!(res.record.opening_date, Some(d(2025, 8, 15)));
        assert_eq!(res.record.estado, Estado::Vigente);
        assert_eq!(
            res.record.metadata["publication_date_precision"],
            serde_json::json!("year")
        );

        let mut r = raw("Licitación Pública Nº 45/2025");
        r.description = Some("Apertura: 15/08/2025".into());
        let res = resolve(r, d(2025, 9, 1)).unwrap();
        assert_eq!(res.record.estado, Estado::Vencida);
    }

    // Invariant repair: publication after opening gets pulled back 30 days.
    #[test]
    fn test_resolve_date_order_repair() {
        let mut r = raw("Provisión de oxígeno medicinal");
        r.publication_date = Some(d(2025, 9, 10));
        r.opening_date = Some(d(2025, 8, 1));

        let res = resolve(r, d(2025, 6, 1)).unwrap();
        assert_eq!(res.record.publication_date, Some(d(2025, 7, 2)));
        assert_eq!(res.record.opening_date, Some(d(2025, 8, 1)));
        assert_eq!(
            res.record.metadata["reason"],
            serde_json::json!("date_order_violation")
        );
        assert_eq!(res.warnings.len(), 1);
    }

    #[test]
    fn test_resolve_publication_from_title_date() {
        let r = raw("Llamado del 03/02/2025 a licitación de insumos");
        let res = resolve(r, d(2025, 6, 1)).unwrap();
        assert_eq!(res.record.publication_date, Some(d(2025, 2, 3)));
        // Opening estimated 45 days out when nothing else is known.
        assert_eq!(res.record.opening_date, Some(d(2025, 3, 20)));
        assert_eq!(
            res.record.metadata["opening_date_estimated"],
            serde_json::json!(true)
        );
    }

    #[test]
    fn test_resolve_publication_derived_from_opening() {
        let mut r = raw("Adquisición de luminarias LED");
        r.opening_date = Some(d(2025, 8, 1));
        let res = resolve(r, d(2025, 6, 1)).unwrap();
        assert_eq!(res.record.publication_date, Some(d(2025, 7, 2)));
        assert_eq!(
            res.record.metadata["publication_date_derived"],
            serde_json::json!("opening_minus_30d")
        );
    }

    #[test]
    fn test_resolve_filename_scan() {
        let mut r = raw("Adquisición de equipamiento gastronómico");
        r.attached_files.push(AttachedFile {
            filename: "pliego-15-03-2025.pdf".into(),
            url: "https://example.gov.ar/pliego.pdf".into(),
            mime: None,
            size: None,
        });
        let res = resolve(r, d(2025, 6, 1)).unwrap();
        assert_eq!(res.record.publication_date, Some(d(2025, 3, 15)));
    }

    #[test]
    fn test_resolve_no_dates_at_all() {
        let r = raw("Contratación de servicio de vigilancia");
        let res = resolve(r, d(2025, 6, 1)).unwrap();
        assert_eq!(res.record.publication_date, None);
        assert_eq!(res.record.opening_date, None);
        assert_eq!(res.record.estado, Estado::Vigente);
        assert!(res.record.content_hash.len() == 64);
    }

    #[test]
    fn test_resolve_rejects_out_of_window_year() {
        let mut r = raw("Obra histórica");
        r.publication_date = Some(d(2019, 5, 1));
        assert_eq!(
            resolve(r, d(2025, 6, 1)).unwrap_err(),
            SkipReason::YearOutOfRange(2019)
        );
    }

    #[test]
    fn test_resolve_rejects_empty_title() {
        let r = raw("   ");
        assert_eq!(resolve(r, d(2025, 6, 1)).unwrap_err(), SkipReason::MissingTitle);
    }

    #[test]
    fn test_resolve_budget_and_currency() {
        let mut r = raw("Compra de ambulancias");
        r.budget_text = Some("$ 98.700.000,00".into());
        let res = resolve(r, d(2025, 6, 1)).unwrap();
        assert_eq!(
            res.record.budget,
            Some(rust_decimal::Decimal::new(9_870_000_000, 2))
        );
        assert_eq!(res.record.currency.as_deref(), Some("ARS"));
    }

    #[test]
    fn test_classify_url_hint_wins() {
        let mut r = raw("x");
        r.source_url = Some("https://portal.gov.ar/listado".into());
        r.url_quality = Some(UrlQuality::Proxy);
        let (url, quality) = classify_url(&r);
        assert!(url.is_some());
        assert_eq!(quality, UrlQuality::Proxy);
    }

    #[test]
    fn test_classify_url_heuristics() {
        let mut r = raw("x");
        r.source_url = Some("https://portal.gov.ar/proceso?id=1234".into());
        assert_eq!(classify_url(&r).1, UrlQuality::Direct);

        r.source_url = Some("https://portal.gov.ar/procesos/LP-45-2025".into());
        assert_eq!(classify_url(&r).1, UrlQuality::Direct);

        r.source_url = Some("https://portal.gov.ar/listado".into());
        assert_eq!(classify_url(&r).1, UrlQuality::Partial);

        r.source_url = Some("not a url".into());
        assert_eq!(classify_url(&r), (None, UrlQuality::Partial));
    }

    #[test]
    fn test_attached_files_deduped_by_url() {
        let mut r = raw("Obra de red cloacal");
        for name in ["pliego.pdf", "pliego-copia.pdf"] {
            r.attached_files.push(AttachedFile {
                filename: name.into(),
                url: "https://example.gov.ar/pliego.pdf".into(),
                mime: None,
                size: None,
            });
        }
        let res = resolve(r, d(2025, 6, 1)).unwrap();
        assert_eq!(res.record.attached_files.len(), 1);
    }

    #[test]
    fn test_derive_nodo() {
        assert_eq!(
            derive_nodo(Some("Obra Pública"), "Pavimentación Ruta 40"),
            Some("obras".into())
        );
        assert_eq!(
            derive_nodo(None, "Adquisición de medicamentos oncológicos"),
            Some("salud".into())
        );
        assert_eq!(derive_nodo(None, "Concesión de casino"), None);
    }

    #[test]
    fn test_content_hash_stable_across_resolutions() {
        let make = || {
            let mut r = raw("Provisión de insumos");
            r.publication_date = Some(d(2025, 3, 14));
            resolve(r, d(2025, 6, 1)).unwrap().record.content_hash
        };
        assert_eq!(make(), make());
    }
}
