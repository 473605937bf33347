//! Cross-source deduplication: identity matching and field merge.
//!
//! Matching walks an ordered key chain (expediente, número de licitación,
//! content hash, fuzzy title) and the first positive level wins. All
//! scoring is pure CPU; candidate retrieval is the repository's problem.

use chrono::NaiveDate;
use uuid::Uuid;

use crate::models::{Licitacion, NewLicitacion, UrlQuality};
use crate::resolver::compute_estado;

/// Token-set similarity at or above this treats two titles as the same
/// tender. Chosen from observed source behavior; calibrate against a
/// labeled dataset before changing.
pub const TITLE_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Fuzzy matches must have publication dates within this many days.
pub const PUBLICATION_WINDOW_DAYS: i64 = 7;

/// Which level of the key chain produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    Expediente,
    NumeroLicitacion,
    ContentHash,
    FuzzyTitle,
}

/// A positive identity match against an existing record.
#[derive(Debug)]
pub struct Match<'a> {
    pub existing: &'a Licitacion,
    pub key: MatchKey,
    pub similarity: f64,
}

/// The identity-relevant projection of a record, so matching works the same
/// for incoming resolved records and for stored records during a sweep.
#[derive(Debug, Clone, Copy)]
pub struct IdentityKey<'a> {
    pub expedient_number: Option<&'a str>,
    pub licitacion_number: Option<&'a str>,
    pub content_hash: &'a str,
    pub title: &'a str,
    pub organization: &'a str,
    pub publication_date: Option<NaiveDate>,
}

impl<'a> From<&'a NewLicitacion> for IdentityKey<'a> {
    fn from(r: &'a NewLicitacion) -> Self {
        Self {
            expedient_number: r.expedient_number.as_deref(),
            licitacion_number: r.licitacion_number.as_deref(),
            content_hash: &r.content_hash,
            title: &r.title,
            organization: &r.organization,
            publication_date: r.publication_date,
        }
    }
}

impl<'a> From<&'a Licitacion> for IdentityKey<'a> {
    fn from(r: &'a Licitacion) -> Self {
        Self {
            expedient_number: r.expedient_number.as_deref(),
            licitacion_number: r.licitacion_number.as_deref(),
            content_hash: &r.content_hash,
            title: &r.title,
            organization: &r.organization,
            publication_date: r.publication_date,
        }
    }
}

/// Normalizes an administrative identifier: uppercase, no interior spaces.
pub fn normalize_identifier(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// Normalizes an organization name: lowercase, accents folded, whitespace
/// collapsed.
pub fn normalize_org(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .map(fold_accent)
        .collect()
}

fn fold_accent(c: char) -> char {
    match c {
        'á' => 'a',
        'é' => 'e',
        'í' => 'i',
        'ó' => 'o',
        'ú' | 'ü' => 'u',
        other => other,
    }
}

fn tokens(s: &str) -> std::collections::BTreeSet<String> {
    s.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { fold_accent(c) } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Token-set ratio: order-insensitive title similarity in [0, 1] built on
/// normalized Levenshtein over the sorted token sets.
///
/// # Examples
///
/// ```
/// use licita_core::dedup::token_set_ratio;
///
/// let a = "Pavimentación Ruta 40 Km 12-18";
/// let b = "Pavimentación de Ruta 40 Km 12 a 18";
/// assert!(token_set_ratio(a, b) >= 0.85);
/// assert!(token_set_ratio("Compra de ambulancias", "Obra de gas natural") < 0.5);
/// ```
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let inter: Vec<&String> = ta.intersection(&tb).collect();
    let only_a: Vec<&String> = ta.difference(&tb).collect();
    let only_b: Vec<&String> = tb.difference(&ta).collect();

    let joined = |parts: &[&String]| parts.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ");
    let base = joined(&inter);
    let with_a = if only_a.is_empty() {
        base.clone()
    } else if base.is_empty() {
        joined(&only_a)
    } else {
        format!("{} {}", base, joined(&only_a))
    };
    let with_b = if only_b.is_empty() {
        base.clone()
    } else if base.is_empty() {
        joined(&only_b)
    } else {
        format!("{} {}", base, joined(&only_b))
    };

    let r1 = strsim::normalized_levenshtein(&base, &with_a);
    let r2 = strsim::normalized_levenshtein(&base, &with_b);
    let r3 = strsim::normalized_levenshtein(&with_a, &with_b);
    r1.max(r2).max(r3)
}

/// Walks the key chain against same-jurisdiction candidates. The first
/// positive level wins; within a level, ties break to the oldest
/// `first_seen_at` (then id) so matching is deterministic.
pub fn find_match<'a>(
    incoming: IdentityKey<'_>,
    candidates: &'a [Licitacion],
) -> Option<Match<'a>> {
    if let Some(expedient) = incoming.expedient_number {
        let needle = normalize_identifier(expedient);
        if !needle.is_empty() {
            let hit = pick_oldest(candidates.iter().filter(|c| {
                c.expedient_number
                    .as_deref()
                    .map(|e| normalize_identifier(e) == needle)
                    .unwrap_or(false)
            }));
            if let Some(existing) = hit {
                return Some(Match {
                    existing,
                    key: MatchKey::Expediente,
                    similarity: 1.0,
                });
            }
        }
    }

    if let Some(numero) = incoming.licitacion_number {
        let needle = normalize_identifier(numero);
        if !needle.is_empty() {
            let hit = pick_oldest(candidates.iter().filter(|c| {
                c.licitacion_number
                    .as_deref()
                    .map(|n| normalize_identifier(n) == needle)
                    .unwrap_or(false)
            }));
            if let Some(existing) = hit {
                return Some(Match {
                    existing,
                    key: MatchKey::NumeroLicitacion,
                    similarity: 1.0,
                });
            }
        }
    }

    let hit = pick_oldest(
        candidates
            .iter()
            .filter(|c| c.content_hash == incoming.content_hash),
    );
    if let Some(existing) = hit {
        return Some(Match {
            existing,
            key: MatchKey::ContentHash,
            similarity: 1.0,
        });
    }

    fuzzy_match(incoming, candidates)
}

fn fuzzy_match<'a>(
    incoming: IdentityKey<'_>,
    candidates: &'a [Licitacion],
) -> Option<Match<'a>> {
    let publication = incoming.publication_date?;
    let org = normalize_org(incoming.organization);
    if org.is_empty() {
        return None;
    }

    let mut best: Option<(&Licitacion, f64)> = None;
    for candidate in candidates {
        let Some(candidate_pub) = candidate.publication_date else {
            continue;
        };
        if (publication - candidate_pub).num_days().abs() > PUBLICATION_WINDOW_DAYS {
            continue;
        }
        if normalize_org(&candidate.organization) != org {
            continue;
        }
        let similarity = token_set_ratio(incoming.title, &candidate.title);
        if similarity < TITLE_SIMILARITY_THRESHOLD {
            continue;
        }
        best = match best {
            None => Some((candidate, similarity)),
            Some((current, current_sim)) => {
                if similarity > current_sim
                    || (similarity == current_sim && older_than(candidate, current))
                {
                    Some((candidate, similarity))
                } else {
                    Some((current, current_sim))
                }
            }
        };
    }
    best.map(|(existing, similarity)| Match {
        existing,
        key: MatchKey::FuzzyTitle,
        similarity,
    })
}

fn older_than(a: &Licitacion, b: &Licitacion) -> bool {
    (a.first_seen_at, a.id) < (b.first_seen_at, b.id)
}

fn pick_oldest<'a, I: Iterator<Item = &'a Licitacion>>(iter: I) -> Option<&'a Licitacion> {
    iter.min_by_key(|c| (c.first_seen_at, c.id))
}

/// Merges a freshly resolved record into its stored match.
///
/// Scalars keep the non-null / longer / more precise value, preferring
/// `direct > proxy > partial` URLs; `source_urls` and `attached_files`
/// union; `enrichment_level` takes the max; `first_seen_at` and
/// `workflow_state` stay as stored; estado is recomputed. An opening date
/// that moved later than the stored one is a prórroga signal and lands in
/// `fecha_prorroga` rather than overwriting the original opening.
pub fn merge_incoming(
    existing: &Licitacion,
    incoming: &NewLicitacion,
    today: NaiveDate,
) -> Licitacion {
    let mut merged = existing.clone();

    merged.title = longer(&existing.title, &incoming.title);
    merged.organization = longer(&existing.organization, &incoming.organization);
    merged.description = longer_opt(existing.description.as_deref(), incoming.description.as_deref());
    merged.category = prefer_existing(existing.category.as_deref(), incoming.category.as_deref());
    merged.tipo_procedimiento = prefer_existing(
        existing.tipo_procedimiento.as_deref(),
        incoming.tipo_procedimiento.as_deref(),
    );
    merged.nodo = prefer_existing(existing.nodo.as_deref(), incoming.nodo.as_deref());
    merged.expedient_number = prefer_existing(
        existing.expedient_number.as_deref(),
        incoming.expedient_number.as_deref(),
    );
    merged.licitacion_number = prefer_existing(
        existing.licitacion_number.as_deref(),
        incoming.licitacion_number.as_deref(),
    );
    merged.currency = prefer_existing(existing.currency.as_deref(), incoming.currency.as_deref());
    merged.budget = existing.budget.or(incoming.budget);

    // Publication: a day-precision date beats a year-only placeholder.
    merged.publication_date = match (existing.publication_date, incoming.publication_date) {
        (Some(old), Some(new)) => {
            if year_only(&existing.metadata) && !year_only(&incoming.metadata) {
                Some(new)
            } else {
                Some(old)
            }
        }
        (old, new) => old.or(new),
    };

    // Opening: a later incoming date is an observed prórroga.
    merged.fecha_prorroga = existing.fecha_prorroga.or(incoming.fecha_prorroga);
    match (existing.opening_date, incoming.opening_date) {
        (Some(old), Some(new)) if new > old => {
            merged.fecha_prorroga = Some(new);
        }
        (None, Some(new)) => merged.opening_date = Some(new),
        _ => {}
    }

    if incoming.url_quality.rank() > existing.url_quality.rank() {
        merged.canonical_url = incoming.canonical_url.clone();
        merged.url_quality = incoming.url_quality;
    } else if merged.canonical_url.is_none() {
        merged.canonical_url = incoming.canonical_url.clone();
        merged.url_quality = if incoming.canonical_url.is_some() {
            incoming.url_quality
        } else {
            existing.url_quality
        };
    }

    for (source, url) in &incoming.source_urls {
        merged
            .source_urls
            .entry(source.clone())
            .or_insert_with(|| url.clone());
    }
    merge_files(&mut merged.attached_files, &incoming.attached_files);
    merged.enrichment_level = existing.enrichment_level.max(incoming.enrichment_level);
    merge_metadata(&mut merged.metadata, &incoming.metadata);

    // A fuente this record has not carried before means a cross-source
    // merge: the incoming identity is recorded. A repeat from a known
    // fuente is just an update, so re-ingesting a batch stays idempotent.
    let mut fuentes = known_fuentes(existing);
    if !fuentes.iter().any(|f| f == &incoming.fuente) {
        fuentes.push(incoming.fuente.clone());
        merged.merged_from.push(incoming.id);
        merged.merged_from.sort();
        merged.merged_from.dedup();
        merged.is_merged = true;
    }
    if let serde_json::Value::Object(map) = &mut merged.metadata {
        map.insert("fuentes".to_string(), serde_json::json!(fuentes));
    }

    merged.estado = compute_estado(
        merged.publication_date,
        merged.opening_date,
        merged.fecha_prorroga,
        today,
    );
    merged
}

/// Merges two stored records during a dedup sweep. The older record (by
/// `first_seen_at`) wins identity; the loser's id lands in `merged_from`.
pub fn merge_records(a: &Licitacion, b: &Licitacion, today: NaiveDate) -> Licitacion {
    let (winner, loser) = if older_than(a, b) { (a, b) } else { (b, a) };
    let as_incoming = NewLicitacion {
        id: loser.id,
        title: loser.title.clone(),
        organization: loser.organization.clone(),
        fuente: loser.fuente.clone(),
        jurisdiccion: loser.jurisdiccion.clone(),
        category: loser.category.clone(),
        tipo_procedimiento: loser.tipo_procedimiento.clone(),
        nodo: loser.nodo.clone(),
        description: loser.description.clone(),
        publication_date: loser.publication_date,
        opening_date: loser.opening_date,
        fecha_prorroga: loser.fecha_prorroga,
        estado: loser.estado,
        budget: loser.budget,
        currency: loser.currency.clone(),
        expedient_number: loser.expedient_number.clone(),
        licitacion_number: loser.licitacion_number.clone(),
        canonical_url: loser.canonical_url.clone(),
        url_quality: loser.url_quality,
        source_urls: loser.source_urls.clone(),
        content_hash: loser.content_hash.clone(),
        attached_files: loser.attached_files.clone(),
        enrichment_level: loser.enrichment_level,
        metadata: loser.metadata.clone(),
    };
    let mut merged = merge_incoming(winner, &as_incoming, today);
    merged.first_seen_at = winner.first_seen_at.min(loser.first_seen_at);
    merged.merged_from.push(loser.id);
    merged
        .merged_from
        .extend(loser.merged_from.iter().copied());
    merged.merged_from.sort();
    merged.merged_from.dedup();
    merged.is_merged = true;
    merged
}

/// One winner absorbing one loser, as planned by a sweep.
#[derive(Debug, Clone)]
pub struct SweepMerge {
    pub winner: Licitacion,
    pub absorbed: Uuid,
}

/// Plans a full dedup sweep over one jurisdiction's records: every record
/// is matched against the already-accepted set, and positive matches merge
/// into their winner. Transitive chains collapse to a single survivor.
pub fn plan_sweep(mut records: Vec<Licitacion>, today: NaiveDate) -> Vec<SweepMerge> {
    records.sort_by(|a, b| (a.first_seen_at, a.id).cmp(&(b.first_seen_at, b.id)));

    let mut accepted: Vec<Licitacion> = Vec::new();
    let mut merges: Vec<SweepMerge> = Vec::new();
    for record in records {
        let position = find_match(IdentityKey::from(&record), &accepted)
            .map(|m| accepted.iter().position(|c| c.id == m.existing.id).expect("match from accepted"));
        match position {
            Some(idx) => {
                let winner = merge_records(&accepted[idx], &record, today);
                merges.push(SweepMerge {
                    winner: winner.clone(),
                    absorbed: record.id,
                });
                accepted[idx] = winner;
            }
            None => accepted.push(record),
        }
    }

    // Report only the final shape of each winner.
    let mut latest: std::collections::BTreeMap<Uuid, Licitacion> = std::collections::BTreeMap::new();
    for m in &merges {
        latest.insert(m.winner.id, m.winner.clone());
    }
    merges
        .into_iter()
        .map(|m| SweepMerge {
            winner: latest.get(&m.winner.id).cloned().expect("winner tracked"),
            absorbed: m.absorbed,
        })
        .collect()
}

fn longer(a: &str, b: &str) -> String {
    if b.trim().len() > a.trim().len() {
        b.to_string()
    } else {
        a.to_string()
    }
}

fn longer_opt(a: Option<&str>, b: Option<&str>) -> Option<String> {
    match (a, b) {
        (Some(x), Some(y)) => Some(longer(x, y)),
        (Some(x), None) => Some(x.to_string()),
        (None, Some(y)) => Some(y.to_string()),
        (None, None) => None,
    }
}

fn prefer_existing(a: Option<&str>, b: Option<&str>) -> Option<String> {
    a.or(b).map(str::to_string)
}

/// Fuentes that have already contributed to a stored record.
fn known_fuentes(existing: &Licitacion) -> Vec<String> {
    existing
        .metadata
        .get("fuentes")
        .and_then(|v| v.as_array())
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect::<Vec<String>>()
        })
        .filter(|fuentes| !fuentes.is_empty())
        .unwrap_or_else(|| vec![existing.fuente.clone()])
}

fn year_only(metadata: &serde_json::Value) -> bool {
    metadata
        .get("publication_date_precision")
        .and_then(|v| v.as_str())
        == Some("year")
}

fn merge_files(
    target: &mut Vec<crate::models::AttachedFile>,
    incoming: &[crate::models::AttachedFile],
) {
    for file in incoming {
        if !target.iter().any(|f| f.url == file.url) {
            target.push(file.clone());
        }
    }
}

fn merge_metadata(target: &mut serde_json::Value, incoming: &serde_json::Value) {
    if let (serde_json::Value::Object(dst), serde_json::Value::Object(src)) = (target, incoming) {
        for (k, v) in src {
            dst.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttachedFile, Estado, WorkflowState};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn stored(title: &str, fuente: &str) -> Licitacion {
        let first_seen = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        Licitacion {
            id: Uuid::new_v4(),
            title: title.to_string(),
            organization: "Dirección de Vialidad".to_string(),
            fuente: fuente.to_string(),
            jurisdiccion: "Mendoza".to_string(),
            category: None,
            tipo_procedimiento: None,
            nodo: None,
            description: None,
            publication_date: Some(d(2025, 6, 1)),
            opening_date: Some(d(2025, 7, 15)),
            fecha_prorroga: None,
            estado: Estado::Vigente,
            budget: None,
            currency: None,
            expedient_number: None,
            licitacion_number: None,
            canonical_url: Some(format!("https://{}.gov.ar/p/1", fuente)),
            url_quality: UrlQuality::Partial,
            source_urls: BTreeMap::from([(
                fuente.to_string(),
                format!("https://{}.gov.ar/p/1", fuente),
            )]),
            content_hash: NewLicitacion::compute_content_hash(title, fuente, Some(d(2025, 6, 1))),
            attached_files: Vec::new(),
            workflow_state: WorkflowState::Descubierta,
            first_seen_at: first_seen,
            created_at: first_seen,
            updated_at: first_seen,
            merged_from: Vec::new(),
            is_merged: false,
            enrichment_level: 1,
            metadata: serde_json::json!({}),
        }
    }

    fn incoming(title: &str, fuente: &str) -> NewLicitacion {
        NewLicitacion {
            id: Uuid::new_v4(),
            title: title.to_string(),
            organization: "Dirección de Vialidad".to_string(),
            fuente: fuente.to_string(),
            jurisdiccion: "Mendoza".to_string(),
            category: None,
            tipo_procedimiento: None,
            nodo: None,
            description: None,
            publication_date: Some(d(2025, 6, 1)),
            opening_date: Some(d(2025, 7, 15)),
            fecha_prorroga: None,
            estado: Estado::Vigente,
            budget: None,
            currency: None,
            expedient_number: None,
            licitacion_number: None,
            canonical_url: Some(format!("https://{}.gov.ar/detalle?id=9", fuente)),
            url_quality: UrlQuality::Partial,
            source_urls: BTreeMap::from([(
                fuente.to_string(),
                format!("https://{}.gov.ar/detalle?id=9", fuente),
            )]),
            content_hash: NewLicitacion::compute_content_hash(title, fuente, Some(d(2025, 6, 1))),
            attached_files: Vec::new(),
            enrichment_level: 1,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier(" ex-2025-12345 "), "EX-2025-12345");
        assert_eq!(normalize_identifier("EX 2025 12345"), "EX202512345");
    }

    #[test]
    fn test_normalize_org_folds_accents() {
        assert_eq!(
            normalize_org("  Dirección   de Vialidad "),
            "direccion de vialidad"
        );
    }

    #[test]
    fn test_match_by_expediente_beats_everything() {
        let mut existing = stored("Título viejo totalmente distinto", "boletin");
        existing.expedient_number = Some("EX-2025-12345".into());
        let mut new = incoming("Compra de ambulancias", "comprar-mza");
        new.expedient_number = Some("ex-2025-12345".into());

        let m = find_match(IdentityKey::from(&new), std::slice::from_ref(&existing)).unwrap();
        assert_eq!(m.key, MatchKey::Expediente);
    }

    #[test]
    fn test_match_by_licitacion_number() {
        let mut existing = stored("Obra A", "boletin");
        existing.licitacion_number = Some("LP 45/2025".into());
        let mut new = incoming("Obra A bis", "comprar-mza");
        new.licitacion_number = Some("lp45/2025".into());

        let m = find_match(IdentityKey::from(&new), std::slice::from_ref(&existing)).unwrap();
        assert_eq!(m.key, MatchKey::NumeroLicitacion);
    }

    #[test]
    fn test_match_by_content_hash() {
        let existing = stored("Compra de ambulancias", "comprar-mza");
        let new = incoming("Compra de ambulancias", "comprar-mza");
        let m = find_match(IdentityKey::from(&new), std::slice::from_ref(&existing)).unwrap();
        assert_eq!(m.key, MatchKey::ContentHash);
    }

    // Reworded titles from different gazettes still match.
    #[test]
    fn test_fuzzy_match_reworded_title() {
        let mut existing = stored("Pavimentación Ruta 40 Km 12-18", "boletin");
        existing.publication_date = Some(d(2025, 6, 1));
        let mut new = incoming("Pavimentación de Ruta 40 Km 12 a 18", "comprar-mza");
        new.publication_date = Some(d(2025, 6, 4));

        let m = find_match(IdentityKey::from(&new), std::slice::from_ref(&existing)).unwrap();
        assert_eq!(m.key, MatchKey::FuzzyTitle);
        assert!(m.similarity >= TITLE_SIMILARITY_THRESHOLD);
    }

    #[test]
    fn test_fuzzy_rejects_outside_publication_window() {
        let mut existing = stored("Pavimentación Ruta 40 Km 12-18", "boletin");
        existing.publication_date = Some(d(2025, 6, 1));
        let mut new = incoming("Pavimentación de Ruta 40 Km 12 a 18", "comprar-mza");
        new.publication_date = Some(d(2025, 6, 15));

        assert!(find_match(IdentityKey::from(&new), std::slice::from_ref(&existing)).is_none());
    }

    #[test]
    fn test_fuzzy_rejects_different_organization() {
        let mut existing = stored("Pavimentación Ruta 40 Km 12-18", "boletin");
        existing.organization = "Municipalidad de San Rafael".into();
        let new = incoming("Pavimentación de Ruta 40 Km 12 a 18", "comprar-mza");

        assert!(find_match(IdentityKey::from(&new), std::slice::from_ref(&existing)).is_none());
    }

    #[test]
    fn test_fuzzy_rejects_dissimilar_titles() {
        let existing = stored("Provisión de gas natural licuado", "boletin");
        let new = incoming("Compra de ambulancias de alta complejidad", "comprar-mza");
        assert!(find_match(IdentityKey::from(&new), std::slice::from_ref(&existing)).is_none());
    }

    #[test]
    fn test_fuzzy_tie_breaks_to_oldest() {
        let mut older = stored("Pavimentación Ruta 40 Km 12-18", "boletin");
        older.first_seen_at = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        let newer = stored("Pavimentación Ruta 40 Km 12-18", "otro");
        let candidates = vec![newer, older.clone()];

        let new = incoming("Pavimentación de Ruta 40 Km 12 a 18", "comprar-mza");
        let m = find_match(IdentityKey::from(&new), &candidates).unwrap();
        assert_eq!(m.existing.id, older.id);
    }

    // Two sources, one expediente: urls from both survive the merge and
    // the losing identity is recorded.
    #[test]
    fn test_merge_unions_source_urls() {
        let existing = stored("Compra de ambulancias", "boletin");
        let new = incoming("Compra de ambulancias", "comprar-mza");

        let merged = merge_incoming(&existing, &new, d(2025, 6, 10));
        assert_eq!(merged.source_urls.len(), 2);
        assert!(merged.source_urls.contains_key("boletin"));
        assert!(merged.source_urls.contains_key("comprar-mza"));
        assert_eq!(merged.merged_from, vec![new.id]);
        assert!(merged.is_merged);
    }

    // Re-ingesting from an already-known fuente is an update, not a merge:
    // merged_from must not grow on every run.
    #[test]
    fn test_merge_same_fuente_is_idempotent() {
        let existing = stored("Compra de ambulancias", "boletin");
        let first = incoming("Compra de ambulancias", "boletin");
        let merged = merge_incoming(&existing, &first, d(2025, 6, 10));
        assert!(merged.merged_from.is_empty());
        assert!(!merged.is_merged);

        let again = incoming("Compra de ambulancias", "boletin");
        let merged = merge_incoming(&merged, &again, d(2025, 6, 10));
        assert!(merged.merged_from.is_empty());
    }

    #[test]
    fn test_merge_prefers_direct_url() {
        let existing = stored("Compra de ambulancias", "boletin");
        let mut new = incoming("Compra de ambulancias", "comprar-mza");
        new.url_quality = UrlQuality::Direct;

        let merged = merge_incoming(&existing, &new, d(2025, 6, 10));
        assert_eq!(merged.url_quality, UrlQuality::Direct);
        assert_eq!(merged.canonical_url, new.canonical_url);
    }

    #[test]
    fn test_merge_detects_prorroga() {
        let existing = stored("Compra de ambulancias", "boletin");
        let mut new = incoming("Compra de ambulancias", "comprar-mza");
        new.opening_date = Some(d(2025, 9, 1));

        let merged = merge_incoming(&existing, &new, d(2025, 8, 1));
        assert_eq!(merged.opening_date, Some(d(2025, 7, 15)));
        assert_eq!(merged.fecha_prorroga, Some(d(2025, 9, 1)));
        assert_eq!(merged.estado, Estado::Prorrogada);
    }

    #[test]
    fn test_merge_keeps_workflow_and_first_seen() {
        let mut existing = stored("Compra de ambulancias", "boletin");
        existing.workflow_state = WorkflowState::Evaluando;
        let new = incoming("Compra de ambulancias", "comprar-mza");

        let merged = merge_incoming(&existing, &new, d(2025, 6, 10));
        assert_eq!(merged.workflow_state, WorkflowState::Evaluando);
        assert_eq!(merged.first_seen_at, existing.first_seen_at);
    }

    #[test]
    fn test_merge_enrichment_level_max() {
        let mut existing = stored("Compra de ambulancias", "boletin");
        existing.enrichment_level = 2;
        let new = incoming("Compra de ambulancias", "comprar-mza");

        let merged = merge_incoming(&existing, &new, d(2025, 6, 10));
        assert_eq!(merged.enrichment_level, 2);
    }

    #[test]
    fn test_merge_day_precision_beats_year_only() {
        let mut existing = stored("Compra de ambulancias", "boletin");
        existing.publication_date = Some(d(2025, 1, 1));
        existing.metadata = serde_json::json!({"publication_date_precision": "year"});
        let mut new = incoming("Compra de ambulancias", "comprar-mza");
        new.publication_date = Some(d(2025, 6, 3));

        let merged = merge_incoming(&existing, &new, d(2025, 6, 10));
        assert_eq!(merged.publication_date, Some(d(2025, 6, 3)));
    }

    #[test]
    fn test_merge_files_union_by_url() {
        let mut existing = stored("Compra de ambulancias", "boletin");
        existing.attached_files.push(AttachedFile {
            filename: "pliego.pdf".into(),
            url: "https://a/pliego.pdf".into(),
            mime: None,
            size: None,
        });
        let mut new = incoming("Compra de ambulancias", "comprar-mza");
        new.attached_files.push(AttachedFile {
            filename: "pliego.pdf".into(),
            url: "https://a/pliego.pdf".into(),
            mime: None,
            size: None,
        });
        new.attached_files.push(AttachedFile {
            filename: "circular-1.pdf".into(),
            url: "https://a/circular-1.pdf".into(),
            mime: None,
            size: None,
        });

        let merged = merge_incoming(&existing, &new, d(2025, 6, 10));
        assert_eq!(merged.attached_files.len(), 2);
    }

    #[test]
    fn test_merge_records_tracks_merged_from() {
        let a = stored("Compra de ambulancias", "boletin");
        let mut b = stored("Compra de ambulancias 2025", "comprar-mza");
        b.first_seen_at = a.first_seen_at + chrono::Duration::hours(1);

        let merged = merge_records(&a, &b, d(2025, 6, 10));
        assert_eq!(merged.id, a.id);
        assert!(merged.is_merged);
        assert_eq!(merged.merged_from, vec![b.id]);
    }

    // A≡B and B≡C collapse to one survivor carrying both ids.
    #[test]
    fn test_sweep_transitive_chain() {
        let mut a = stored("Pavimentación Ruta 40 Km 12-18", "boletin");
        a.expedient_number = Some("EX-2025-12345".into());
        let mut b = stored("Pavimentación de Ruta 40 Km 12 a 18", "comprar-mza");
        b.expedient_number = Some("EX-2025-12345".into());
        b.first_seen_at = a.first_seen_at + chrono::Duration::hours(1);
        b.content_hash = "otra".into();
        let mut c = stored("Pavimentación de la Ruta 40, Km 12 a 18", "comprasapps");
        c.first_seen_at = a.first_seen_at + chrono::Duration::hours(2);
        c.content_hash = "distinta".into();
        c.publication_date = Some(d(2025, 6, 3));

        let merges = plan_sweep(vec![a.clone(), b, c], d(2025, 6, 10));
        assert_eq!(merges.len(), 2);
        assert!(merges.iter().all(|m| m.winner.id == a.id));
        let final_winner = &merges.last().unwrap().winner;
        assert_eq!(final_winner.merged_from.len(), 2);
    }

    #[test]
    fn test_sweep_no_matches_is_empty() {
        let a = stored("Obra de red cloacal", "boletin");
        let mut b = stored("Compra de tomógrafos", "comprar-mza");
        b.first_seen_at = a.first_seen_at + chrono::Duration::hours(1);
        assert!(plan_sweep(vec![a, b], d(2025, 6, 10)).is_empty());
    }
}
