//! Query filter model and smart-search analysis.
//!
//! The SQL that executes these filters lives in the db crate; this module
//! only models them, so filter parsing, clamping, and keyword detection
//! stay testable without a database.

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::models::{Estado, WorkflowState};

/// Default page size for listings.
pub const DEFAULT_PAGE_SIZE: u32 = 15;

/// Hard cap on page size.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Which date column range filters apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FechaCampo {
    #[default]
    PublicationDate,
    OpeningDate,
    /// When the record was first scraped.
    FechaScraping,
}

impl FechaCampo {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publication_date" | "fecha_publicacion" => Some(FechaCampo::PublicationDate),
            "opening_date" | "fecha_apertura" => Some(FechaCampo::OpeningDate),
            "fecha_scraping" => Some(FechaCampo::FechaScraping),
            _ => None,
        }
    }
}

/// Whitelisted sort keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    PublicationDate,
    OpeningDate,
    FechaScraping,
    Budget,
}

impl SortField {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publication_date" => Some(SortField::PublicationDate),
            "opening_date" => Some(SortField::OpeningDate),
            "fecha_scraping" => Some(SortField::FechaScraping),
            "budget" => Some(SortField::Budget),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asc" => Some(SortOrder::Asc),
            "desc" => Some(SortOrder::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: SortField,
    pub order: SortOrder,
}

impl Default for Sort {
    fn default() -> Self {
        Self {
            field: SortField::PublicationDate,
            order: SortOrder::Desc,
        }
    }
}

/// 1-based page plus size, clamped to the allowed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Pagination {
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page: page.max(1),
            size: size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.size as i64
    }

    pub fn limit(&self) -> i64 {
        self.size as i64
    }
}

/// All recognized listing filters; everything ANDs together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    /// Full-text query over title/description/organization/category.
    pub q: Option<String>,
    pub fuente: Option<String>,
    #[serde(default)]
    pub fuente_exclude: Vec<String>,
    pub estado: Option<Estado>,
    pub category: Option<String>,
    pub workflow_state: Option<WorkflowState>,
    pub jurisdiccion: Option<String>,
    pub tipo_procedimiento: Option<String>,
    pub organization: Option<String>,
    pub nodo: Option<String>,
    pub budget_min: Option<Decimal>,
    pub budget_max: Option<Decimal>,
    pub fecha_desde: Option<NaiveDate>,
    pub fecha_hasta: Option<NaiveDate>,
    #[serde(default)]
    pub fecha_campo: FechaCampo,
    pub year: Option<i32>,
    /// Only records first seen after this instant.
    pub nuevas_desde: Option<DateTime<Utc>>,
    #[serde(default)]
    pub only_national: bool,
}

impl ListFilter {
    /// A copy with one facet dimension removed, for self-excluding facet
    /// aggregation.
    pub fn without_dimension(&self, dimension: FacetDimension) -> ListFilter {
        let mut f = self.clone();
        match dimension {
            FacetDimension::Fuente => f.fuente = None,
            FacetDimension::Status => f.estado = None,
            FacetDimension::Category => f.category = None,
            FacetDimension::WorkflowState => f.workflow_state = None,
            FacetDimension::Jurisdiccion => f.jurisdiccion = None,
            FacetDimension::TipoProcedimiento => f.tipo_procedimiento = None,
            FacetDimension::Organization => f.organization = None,
            FacetDimension::Nodo => f.nodo = None,
        }
        f
    }
}

/// The discrete dimensions facet counts are computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetDimension {
    Fuente,
    Status,
    Category,
    WorkflowState,
    Jurisdiccion,
    TipoProcedimiento,
    Organization,
    Nodo,
}

impl FacetDimension {
    pub const ALL: [FacetDimension; 8] = [
        FacetDimension::Fuente,
        FacetDimension::Status,
        FacetDimension::Category,
        FacetDimension::WorkflowState,
        FacetDimension::Jurisdiccion,
        FacetDimension::TipoProcedimiento,
        FacetDimension::Organization,
        FacetDimension::Nodo,
    ];

    /// Key under which this dimension appears in facet responses.
    pub fn key(&self) -> &'static str {
        match self {
            FacetDimension::Fuente => "fuente",
            FacetDimension::Status => "status",
            FacetDimension::Category => "category",
            FacetDimension::WorkflowState => "workflow_state",
            FacetDimension::Jurisdiccion => "jurisdiccion",
            FacetDimension::TipoProcedimiento => "tipo_procedimiento",
            FacetDimension::Organization => "organization",
            FacetDimension::Nodo => "nodos",
        }
    }

    /// Column backing this dimension.
    pub fn column(&self) -> &'static str {
        match self {
            FacetDimension::Fuente => "fuente",
            FacetDimension::Status => "estado",
            FacetDimension::Category => "category",
            FacetDimension::WorkflowState => "workflow_state",
            FacetDimension::Jurisdiccion => "jurisdiccion",
            FacetDimension::TipoProcedimiento => "tipo_procedimiento",
            FacetDimension::Organization => "organization",
            FacetDimension::Nodo => "nodo",
        }
    }
}

/// One facet value with its count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCount {
    pub value: String,
    pub count: i64,
}

/// A page of results.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: i64,
}

static QUERY_YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(202[4-7])\b").unwrap());

/// What smart search extracted from a free-text query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SmartQuery {
    /// Original text, always retained as the fallback filter.
    pub text: Option<String>,
    /// Detected keyword filters, echoed back to the UI.
    pub auto_filters: BTreeMap<String, String>,
}

/// Inspects `q` for keyword patterns (year, fuente names, rubro names) and
/// turns them into `auto_filters`. The original text always survives as the
/// fallback full-text filter.
pub fn analyze_query(q: &str, known_fuentes: &[String], known_rubros: &[String]) -> SmartQuery {
    let trimmed = q.trim();
    if trimmed.is_empty() {
        return SmartQuery::default();
    }
    let mut auto_filters = BTreeMap::new();
    let lowered = trimmed.to_lowercase();

    if let Some(caps) = QUERY_YEAR.captures(trimmed) {
        auto_filters.insert("year".to_string(), caps[1].to_string());
    }
    if let Some(fuente) = known_fuentes
        .iter()
        .find(|f| lowered.contains(&f.to_lowercase()))
    {
        auto_filters.insert("fuente".to_string(), fuente.clone());
    }
    if let Some(rubro) = known_rubros
        .iter()
        .find(|r| lowered.contains(&r.to_lowercase()))
    {
        auto_filters.insert("category".to_string(), rubro.clone());
    }

    SmartQuery {
        text: Some(trimmed.to_string()),
        auto_filters,
    }
}

/// Applies a smart-search result onto a filter: detected keywords fill
/// their fields only where the caller has not set them explicitly.
pub fn apply_auto_filters(filter: &mut ListFilter, smart: &SmartQuery) {
    if let Some(year) = smart.auto_filters.get("year") {
        if filter.year.is_none() {
            filter.year = year.parse().ok();
        }
    }
    if let Some(fuente) = smart.auto_filters.get("fuente") {
        if filter.fuente.is_none() {
            filter.fuente = Some(fuente.clone());
        }
    }
    if let Some(category) = smart.auto_filters.get("category") {
        if filter.category.is_none() {
            filter.category = Some(category.clone());
        }
    }
    filter.q = smart.text.clone();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults() {
        let p = Pagination::default();
        assert_eq!(p.page, 1);
        assert_eq!(p.size, 15);
        assert_eq!(p.offset(), 0);
    }

    #[test]
    fn test_pagination_clamps() {
        let p = Pagination::new(0, 500);
        assert_eq!(p.page, 1);
        assert_eq!(p.size, MAX_PAGE_SIZE);

        let p = Pagination::new(3, 20);
        assert_eq!(p.offset(), 40);
        assert_eq!(p.limit(), 20);
    }

    #[test]
    fn test_sort_parsing() {
        assert_eq!(SortField::parse("budget"), Some(SortField::Budget));
        assert_eq!(SortField::parse("title"), None);
        assert_eq!(SortOrder::parse("asc"), Some(SortOrder::Asc));
        assert_eq!(SortOrder::parse("up"), None);
    }

    #[test]
    fn test_fecha_campo_aliases() {
        assert_eq!(
            FechaCampo::parse("fecha_apertura"),
            Some(FechaCampo::OpeningDate)
        );
        assert_eq!(
            FechaCampo::parse("fecha_scraping"),
            Some(FechaCampo::FechaScraping)
        );
        assert_eq!(FechaCampo::parse("updated_at"), None);
    }

    #[test]
    fn test_without_dimension() {
        let filter = ListFilter {
            fuente: Some("boletin".into()),
            estado: Some(Estado::Vigente),
            ..Default::default()
        };
        let f = filter.without_dimension(FacetDimension::Fuente);
        assert!(f.fuente.is_none());
        assert_eq!(f.estado, Some(Estado::Vigente));

        let f = filter.without_dimension(FacetDimension::Status);
        assert!(f.estado.is_none());
        assert_eq!(f.fuente.as_deref(), Some("boletin"));
    }

    #[test]
    fn test_analyze_query_year() {
        let smart = analyze_query("obras 2025", &[], &[]);
        assert_eq!(smart.auto_filters.get("year").map(String::as_str), Some("2025"));
        assert_eq!(smart.text.as_deref(), Some("obras 2025"));
    }

    #[test]
    fn test_analyze_query_out_of_window_year_ignored() {
        let smart = analyze_query("censo 2019", &[], &[]);
        assert!(smart.auto_filters.get("year").is_none());
    }

    #[test]
    fn test_analyze_query_fuente_and_rubro() {
        let fuentes = vec!["comprar-mza".to_string(), "boletin".to_string()];
        let rubros = vec!["Salud".to_string()];
        let smart = analyze_query("salud boletin vigentes", &fuentes, &rubros);
        assert_eq!(
            smart.auto_filters.get("fuente").map(String::as_str),
            Some("boletin")
        );
        assert_eq!(
            smart.auto_filters.get("category").map(String::as_str),
            Some("Salud")
        );
    }

    #[test]
    fn test_analyze_query_empty() {
        assert_eq!(analyze_query("   ", &[], &[]), SmartQuery::default());
    }

    #[test]
    fn test_apply_auto_filters_respects_explicit() {
        let mut filter = ListFilter {
            year: Some(2024),
            ..Default::default()
        };
        let smart = analyze_query("obras 2025", &[], &[]);
        apply_auto_filters(&mut filter, &smart);
        // Explicit year wins over the detected one.
        assert_eq!(filter.year, Some(2024));
        assert_eq!(filter.q.as_deref(), Some("obras 2025"));
    }

    #[test]
    fn test_apply_auto_filters_fills_empty() {
        let mut filter = ListFilter::default();
        let smart = analyze_query("obras 2025", &[], &[]);
        apply_auto_filters(&mut filter, &smart);
        assert_eq!(filter.year, Some(2025));
    }

    #[test]
    fn test_facet_dimension_keys() {
        assert_eq!(FacetDimension::Status.key(), "status");
        assert_eq!(FacetDimension::Status.column(), "estado");
        assert_eq!(FacetDimension::Nodo.key(), "nodos");
        assert_eq!(FacetDimension::ALL.len(), 8);
    }

    #[test]
    fn test_list_filter_serde_roundtrip() {
        let filter = ListFilter {
            q: Some("ruta 40".into()),
            estado: Some(Estado::Vigente),
            only_national: true,
            fecha_campo: FechaCampo::OpeningDate,
            ..Default::default()
        };
        let json = serde_json::to_string(&filter).unwrap();
        let back: ListFilter = serde_json::from_str(&json).unwrap();
        assert_eq!(back.q.as_deref(), Some("ruta 40"));
        assert_eq!(back.estado, Some(Estado::Vigente));
        assert!(back.only_national);
        assert_eq!(back.fecha_campo, FechaCampo::OpeningDate);
    }
}
