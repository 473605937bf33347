//! Argentine-locale date and text helpers.
//!
//! Everything here is pure and side-effect free. The accepted year window
//! is [2024, 2027]; anything else is treated as noise (OCR artifacts,
//! expediente numbers, addresses) rather than a tender date.

use chrono::{Datelike, NaiveDate};
use chrono_tz::Tz;
use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::LazyLock;

/// Inclusive year window accepted for any tender date.
pub const YEAR_MIN: i32 = 2024;
pub const YEAR_MAX: i32 = 2027;

/// Timezone for locale-dependent operations (quiet window, "today").
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Argentina::Mendoza;

/// Largest budget accepted before a parse is considered garbage (1e12 ARS).
const MAX_BUDGET: i64 = 1_000_000_000_000;

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap());

static DMY_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})[/-](\d{1,2})[/-](\d{2,4})\b").unwrap());

static SPANISH_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})\s+de\s+([a-záéíóúñ]+)\s+(?:de[l]?\s+)?(\d{4})\b").unwrap()
});

static BUDGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$?\s*(\d{1,3}(?:\.\d{3})+|\d+)(?:,(\d{1,2}))?").unwrap()
});

/// Named year patterns, tried strictly before the generic fallback. The
/// order matters: expediente and decreto shapes are far more reliable than
/// a bare year in free text.
static YEAR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // "EX-2025-00123", "/2026-..."
        Regex::new(r"[/-](202[4-7])[/-]").unwrap(),
        // "Nº 45/2025", "Decreto 123/2025"
        Regex::new(r"\d+/(202[4-7])\b").unwrap(),
        // trailing "-2024"
        Regex::new(r"-(202[4-7])\b").unwrap(),
        // trailing "/25"
        Regex::new(r"/(2[4-7])$").unwrap(),
    ]
});

static YEAR_GENERIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(202[4-7])\b").unwrap());

fn spanish_month(name: &str) -> Option<u32> {
    let lowered = name.to_lowercase();
    let n = match lowered.as_str() {
        "enero" | "ene" => 1,
        "febrero" | "feb" => 2,
        "marzo" | "mar" => 3,
        "abril" | "abr" => 4,
        "mayo" | "may" => 5,
        "junio" | "jun" => 6,
        "julio" | "jul" => 7,
        "agosto" | "ago" => 8,
        "septiembre" | "setiembre" | "sep" | "set" => 9,
        "octubre" | "oct" => 10,
        "noviembre" | "nov" => 11,
        "diciembre" | "dic" => 12,
        _ => return None,
    };
    Some(n)
}

/// Maps a possibly two-digit year. Two-digit years 24-27 belong to the
/// window; 28+ (and anything below 24) are rejected rather than guessed.
fn expand_year(y: i32) -> Option<i32> {
    if (100..).contains(&y) {
        Some(y)
    } else if (24..=27).contains(&y) {
        Some(2000 + y)
    } else {
        None
    }
}

/// Returns true when the date's year falls inside the accepted window.
pub fn in_year_window(date: NaiveDate) -> bool {
    (YEAR_MIN..=YEAR_MAX).contains(&date.year())
}

/// Parses a date out of free text, tolerant of the formats Argentine
/// portals actually publish.
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use licita_core::dates::parse_date;
///
/// let d = NaiveDate::from_ymd_opt(2025, 8, 15).unwrap();
/// assert_eq!(parse_date("15/08/2025"), Some(d));
/// assert_eq!(parse_date("2025-08-15"), Some(d));
/// assert_eq!(parse_date("15-08-25"), Some(d));
/// assert_eq!(parse_date("Publicado el 15 de agosto de 2025"), Some(d));
/// assert_eq!(parse_date("15-08-28"), None); // two-digit 28+ rejected
/// ```
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    find_date(text).map(|(_, d)| d)
}

/// First date occurrence in the text, with its byte offset.
fn find_date(text: &str) -> Option<(usize, NaiveDate)> {
    let mut best: Option<(usize, NaiveDate)> = None;

    for caps in ISO_DATE.captures_iter(text) {
        let m = caps.get(0).unwrap();
        let date = ymd(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        );
        if let Some(d) = date {
            push_earlier(&mut best, m.start(), d);
        }
    }
    for caps in DMY_DATE.captures_iter(text) {
        let m = caps.get(0).unwrap();
        let year = expand_year(caps[3].parse().ok()?);
        if let Some(y) = year {
            if let Some(d) = ymd(y, caps[2].parse().ok()?, caps[1].parse().ok()?) {
                push_earlier(&mut best, m.start(), d);
            }
        }
    }
    for caps in SPANISH_DATE.captures_iter(text) {
        let m = caps.get(0).unwrap();
        if let Some(month) = spanish_month(&caps[2]) {
            if let Some(d) = ymd(caps[3].parse().ok()?, month, caps[1].parse().ok()?) {
                push_earlier(&mut best, m.start(), d);
            }
        }
    }
    best
}

fn push_earlier(best: &mut Option<(usize, NaiveDate)>, pos: usize, date: NaiveDate) {
    match best {
        Some((p, _)) if *p <= pos => {}
        _ => *best = Some((pos, date)),
    }
}

fn ymd(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y, m, d)
}

/// Extracts a tender year from text. Named source patterns (expediente,
/// decreto, trailing short year) are tried before the generic bare-year
/// fallback, and only years inside the window are returned.
///
/// # Examples
///
/// ```
/// use licita_core::dates::extract_year;
///
/// assert_eq!(extract_year("Licitación Pública Nº 45/2025"), Some(2025));
/// assert_eq!(extract_year("EX-2026-00123-GDEMZA"), Some(2026));
/// assert_eq!(extract_year("expediente 4444/25"), Some(2025));
/// assert_eq!(extract_year("Resolución 99/2019"), None);
/// ```
pub fn extract_year(text: &str) -> Option<i32> {
    for pattern in YEAR_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            let y: i32 = caps[1].parse().ok()?;
            return expand_year(y);
        }
    }
    YEAR_GENERIC
        .captures(text)
        .and_then(|caps| caps[1].parse().ok())
}

/// Scans for a labeled date ("Publicado", "Apertura", "Fecha de apertura")
/// and parses the date following the label.
pub fn extract_date(text: &str) -> Option<NaiveDate> {
    find_labeled_date(
        text,
        &[
            "fecha de apertura",
            "apertura",
            "fecha de publicación",
            "fecha de publicacion",
            "publicado",
        ],
    )
}

/// First date found within 48 characters after any of the given labels
/// (case-insensitive).
pub fn find_labeled_date(text: &str, labels: &[&str]) -> Option<NaiveDate> {
    let lowered = text.to_lowercase();
    let mut earliest: Option<(usize, NaiveDate)> = None;
    for label in labels {
        let mut from = 0;
        while let Some(rel) = lowered[from..].find(label) {
            let pos = from + rel + label.len();
            let window_end = end_of_chars(text, pos, 48);
            if let Some((_, d)) = find_date(&text[pos..window_end]) {
                push_earlier(&mut earliest, from + rel, d);
            }
            from = pos;
        }
    }
    earliest.map(|(_, d)| d)
}

/// First date in the text that is not preceded by an "apertura" label in
/// its immediate left context. Used when resolving publication dates so a
/// lone "Apertura: 15/08/2025" is not mistaken for a publication date.
pub fn find_unlabeled_date(text: &str) -> Option<NaiveDate> {
    let mut scan_from = 0;
    while scan_from < text.len() {
        let (pos, date) = match find_date(&text[scan_from..]) {
            Some((rel, d)) => (scan_from + rel, d),
            None => return None,
        };
        let ctx_start = start_of_chars(text, pos, 24);
        let context = text[ctx_start..pos].to_lowercase();
        if !context.contains("apertura") {
            return Some(date);
        }
        // Skip past this match and keep scanning.
        scan_from = match text[pos..].char_indices().nth(1) {
            Some((off, _)) => pos + off,
            None => return None,
        };
    }
    None
}

/// Byte offset of the position `n` chars before `pos`, clamped to 0.
fn start_of_chars(text: &str, pos: usize, n: usize) -> usize {
    text[..pos]
        .char_indices()
        .rev()
        .take(n)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(pos)
}

/// Byte offset of the position `n` chars after `pos`, clamped to the end.
fn end_of_chars(text: &str, pos: usize, n: usize) -> usize {
    text[pos..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| pos + i)
        .unwrap_or(text.len())
}

/// Truncates to at most `n` chars on a char boundary.
pub fn truncate_chars(text: &str, n: usize) -> &str {
    &text[..end_of_chars(text, 0, n)]
}

/// Parses an Argentine-notation amount (`$1.234.567,89`).
///
/// Rejects values above 1e12, which in practice are concatenated digits or
/// expediente numbers rather than budgets.
///
/// # Examples
///
/// ```
/// use rust_decimal::Decimal;
/// use std::str::FromStr;
/// use licita_core::dates::parse_budget;
///
/// assert_eq!(
///     parse_budget("$1.234.567,89"),
///     Some(Decimal::from_str("1234567.89").unwrap())
/// );
/// assert_eq!(parse_budget("Presupuesto oficial: $ 500.000"), Some(Decimal::from(500_000)));
/// assert_eq!(parse_budget("99999999999999999"), None);
/// ```
pub fn parse_budget(text: &str) -> Option<Decimal> {
    let caps = BUDGET.captures(text)?;
    let integer: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
    let normalized = match caps.get(2) {
        Some(frac) => format!("{}.{}", integer, frac.as_str()),
        None => integer,
    };
    let value = Decimal::from_str(&normalized).ok()?;
    if value > Decimal::from(MAX_BUDGET) || value <= Decimal::ZERO {
        return None;
    }
    Some(value)
}

/// Best-effort ISO currency code from surrounding text.
pub fn detect_currency(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    if lowered.contains("usd")
        || lowered.contains("u$s")
        || lowered.contains("dólar")
        || lowered.contains("dolar")
    {
        Some("USD")
    } else if lowered.contains("ars") || lowered.contains('$') || lowered.contains("pesos") {
        Some("ARS")
    } else {
        None
    }
}

/// Checks the year window, returning the reason on rejection.
pub fn validate_range(date: NaiveDate) -> Result<(), String> {
    if in_year_window(date) {
        Ok(())
    } else {
        Err(format!(
            "year {} outside [{}, {}]",
            date.year(),
            YEAR_MIN,
            YEAR_MAX
        ))
    }
}

/// Checks `opening >= publication`, returning the reason on violation.
pub fn validate_order(publication: NaiveDate, opening: NaiveDate) -> Result<(), String> {
    if opening >= publication {
        Ok(())
    } else {
        Err(format!(
            "opening {} precedes publication {}",
            opening, publication
        ))
    }
}
