use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Vigencia state of a tender with respect to its opening date.
///
/// Always computed by the resolver from the three date fields plus "today";
/// nothing outside the resolver writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Estado {
    Vigente,
    Vencida,
    Prorrogada,
    Archivada,
}

impl Estado {
    pub fn as_str(&self) -> &'static str {
        match self {
            Estado::Vigente => "vigente",
            Estado::Vencida => "vencida",
            Estado::Prorrogada => "prorrogada",
            Estado::Archivada => "archivada",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vigente" => Some(Estado::Vigente),
            "vencida" => Some(Estado::Vencida),
            "prorrogada" => Some(Estado::Prorrogada),
            "archivada" => Some(Estado::Archivada),
            _ => None,
        }
    }
}

impl fmt::Display for Estado {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-assigned workflow stage. Ingestion and enrichment never touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    #[default]
    Descubierta,
    Evaluando,
    Preparando,
    Presentada,
    Descartada,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Descubierta => "descubierta",
            WorkflowState::Evaluando => "evaluando",
            WorkflowState::Preparando => "preparando",
            WorkflowState::Presentada => "presentada",
            WorkflowState::Descartada => "descartada",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "descubierta" => Some(WorkflowState::Descubierta),
            "evaluando" => Some(WorkflowState::Evaluando),
            "preparando" => Some(WorkflowState::Preparando),
            "presentada" => Some(WorkflowState::Presentada),
            "descartada" => Some(WorkflowState::Descartada),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality of a known URL for a record.
///
/// `Direct` points at a stable per-process page, `Proxy` needs a server-side
/// form replay, `Partial` is only the listing page. Ordering follows
/// usefulness: `Direct > Proxy > Partial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlQuality {
    Direct,
    Proxy,
    Partial,
}

impl UrlQuality {
    /// Rank for merge decisions; higher wins.
    pub fn rank(&self) -> u8 {
        match self {
            UrlQuality::Direct => 2,
            UrlQuality::Proxy => 1,
            UrlQuality::Partial => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UrlQuality::Direct => "direct",
            UrlQuality::Proxy => "proxy",
            UrlQuality::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(UrlQuality::Direct),
            "proxy" => Some(UrlQuality::Proxy),
            "partial" => Some(UrlQuality::Partial),
            _ => None,
        }
    }
}

/// Resource class of a source adapter, driving timeouts and concurrency caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterCategory {
    #[default]
    Light,
    Medium,
    Heavy,
}

impl AdapterCategory {
    /// Per-run timeout for this category.
    pub fn timeout(&self) -> Duration {
        match self {
            AdapterCategory::Light => Duration::from_secs(300),
            AdapterCategory::Medium => Duration::from_secs(600),
            AdapterCategory::Heavy => Duration::from_secs(1200),
        }
    }

    /// Scheduler kills a run outliving this cap.
    pub fn hard_timeout(&self) -> Duration {
        self.timeout() * 3 / 2
    }

    /// Maximum concurrent runs of this category.
    pub fn max_concurrent(&self) -> usize {
        match self {
            AdapterCategory::Light => 6,
            AdapterCategory::Medium => 4,
            AdapterCategory::Heavy => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterCategory::Light => "light",
            AdapterCategory::Medium => "medium",
            AdapterCategory::Heavy => "heavy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "light" => Some(AdapterCategory::Light),
            "medium" => Some(AdapterCategory::Medium),
            "heavy" => Some(AdapterCategory::Heavy),
            _ => None,
        }
    }
}

/// A document attached to a tender (pliego, circular, anexo).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedFile {
    pub filename: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

/// What an adapter could recover from a listing row or detail page.
///
/// Raw strings plus best-effort parses. No date resolution and no estado
/// logic happens here; that is the resolver's job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: String,
    pub title: String,
    pub organization: String,
    pub jurisdiccion: String,
    pub category: Option<String>,
    pub tipo_procedimiento: Option<String>,
    pub description: Option<String>,
    /// Date the adapter managed to parse directly, if any.
    pub publication_date: Option<NaiveDate>,
    pub opening_date: Option<NaiveDate>,
    pub fecha_prorroga: Option<NaiveDate>,
    pub expedient_number: Option<String>,
    pub licitacion_number: Option<String>,
    pub budget_text: Option<String>,
    pub currency: Option<String>,
    /// Best-effort URL for this record, with a quality hint.
    pub source_url: Option<String>,
    pub url_quality: Option<UrlQuality>,
    pub attached_files: Vec<AttachedFile>,
    /// Anything else the source exposed, preserved for debugging.
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl RawRecord {
    pub fn new(source: &str, jurisdiccion: &str, title: &str) -> Self {
        Self {
            source: source.to_string(),
            jurisdiccion: jurisdiccion.to_string(),
            title: title.to_string(),
            extra: serde_json::Value::Null,
            ..Default::default()
        }
    }
}

/// A fully resolved record ready for the deduplication engine and storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLicitacion {
    /// Identity assigned at resolution time. Becomes the stored id on
    /// insert; lands in the winner's `merged_from` when dedup folds this
    /// record into an existing one instead.
    pub id: Uuid,
    pub title: String,
    pub organization: String,
    pub fuente: String,
    pub jurisdiccion: String,
    pub category: Option<String>,
    pub tipo_procedimiento: Option<String>,
    pub nodo: Option<String>,
    pub description: Option<String>,
    pub publication_date: Option<NaiveDate>,
    pub opening_date: Option<NaiveDate>,
    pub fecha_prorroga: Option<NaiveDate>,
    pub estado: Estado,
    pub budget: Option<Decimal>,
    pub currency: Option<String>,
    pub expedient_number: Option<String>,
    pub licitacion_number: Option<String>,
    pub canonical_url: Option<String>,
    pub url_quality: UrlQuality,
    /// source name → URL, as seen across sources.
    pub source_urls: BTreeMap<String, String>,
    pub content_hash: String,
    pub attached_files: Vec<AttachedFile>,
    pub enrichment_level: i16,
    pub metadata: serde_json::Value,
}

impl NewLicitacion {
    /// Deterministic identity fingerprint over
    /// `lowercase(title) | source | publication day or "unknown"`.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::NaiveDate;
    /// use licita_core::models::NewLicitacion;
    ///
    /// let d = NaiveDate::from_ymd_opt(2025, 8, 15);
    /// let a = NewLicitacion::compute_content_hash("Obra Ruta 40", "comprar-mza", d);
    /// let b = NewLicitacion::compute_content_hash("OBRA RUTA 40", "comprar-mza", d);
    /// assert_eq!(a, b);
    /// assert_eq!(a.len(), 64);
    /// ```
    pub fn compute_content_hash(
        title: &str,
        source: &str,
        publication_date: Option<NaiveDate>,
    ) -> String {
        let day = publication_date
            .map(|d| d.format("%Y%m%d").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let mut hasher = Sha256::new();
        hasher.update(title.trim().to_lowercase().as_bytes());
        hasher.update(b"|");
        hasher.update(source.as_bytes());
        hasher.update(b"|");
        hasher.update(day.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Canonical tender record as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Licitacion {
    pub id: Uuid,
    pub title: String,
    pub organization: String,
    pub fuente: String,
    pub jurisdiccion: String,
    pub category: Option<String>,
    pub tipo_procedimiento: Option<String>,
    pub nodo: Option<String>,
    pub description: Option<String>,
    pub publication_date: Option<NaiveDate>,
    pub opening_date: Option<NaiveDate>,
    pub fecha_prorroga: Option<NaiveDate>,
    pub estado: Estado,
    pub budget: Option<Decimal>,
    pub currency: Option<String>,
    pub expedient_number: Option<String>,
    pub licitacion_number: Option<String>,
    pub canonical_url: Option<String>,
    pub url_quality: UrlQuality,
    pub source_urls: BTreeMap<String, String>,
    pub content_hash: String,
    pub attached_files: Vec<AttachedFile>,
    pub workflow_state: WorkflowState,
    pub first_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub merged_from: Vec<Uuid>,
    pub is_merged: bool,
    pub enrichment_level: i16,
    pub metadata: serde_json::Value,
}

/// Persisted scraper configuration; seeded from `sources.toml` and carrying
/// runtime state (`active`, `last_run`, `runs_count`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    pub name: String,
    pub url: String,
    /// Adapter type the registry resolves (`json_api`, `html_listing`, ...).
    pub adapter: String,
    pub jurisdiccion: String,
    pub category: AdapterCategory,
    pub active: bool,
    /// Standard 5-field cron expression.
    pub schedule: String,
    pub selectors: BTreeMap<String, String>,
    pub pagination: PaginationState,
    pub last_run: Option<DateTime<Utc>>,
    pub runs_count: i64,
    pub min_interval_hours: Option<f64>,
    pub adaptive_schedule: bool,
    pub paused_reason: Option<String>,
}

/// Pagination knobs, interpreted by each adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaginationState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
}

/// Outcome class of a scraper run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "partial" => Some(RunStatus::Partial),
            "failed" => Some(RunStatus::Failed),
            "skipped" => Some(RunStatus::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a source adapter, durable across process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperRun {
    pub id: Uuid,
    pub scraper_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub items_found: i64,
    pub items_saved: i64,
    pub items_updated: i64,
    pub items_duplicated: i64,
    pub duration_seconds: Option<f64>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub logs: Vec<String>,
}

impl ScraperRun {
    /// Starts a new in-progress run record.
    pub fn begin(scraper_name: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            scraper_name: scraper_name.to_string(),
            started_at,
            ended_at: None,
            status: RunStatus::Running,
            items_found: 0,
            items_saved: 0,
            items_updated: 0,
            items_duplicated: 0,
            duration_seconds: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            logs: Vec::new(),
        }
    }

    /// Closes the run, deriving its final status from the counters:
    /// `failed` when nothing was produced or a fatal error preceded the
    /// first record, `partial` when errors/warnings rode along with saved
    /// items, `success` otherwise.
    pub fn finish(&mut self, ended_at: DateTime<Utc>) {
        self.ended_at = Some(ended_at);
        self.duration_seconds = Some(
            (ended_at - self.started_at).num_milliseconds() as f64 / 1000.0,
        );
        self.status = if self.items_found == 0 && !self.errors.is_empty() {
            RunStatus::Failed
        } else if !self.errors.is_empty() || !self.warnings.is_empty() {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };
    }

    /// Closes the run as failed with the given reason.
    pub fn fail(&mut self, ended_at: DateTime<Utc>, reason: &str) {
        self.ended_at = Some(ended_at);
        self.duration_seconds = Some(
            (ended_at - self.started_at).num_milliseconds() as f64 / 1000.0,
        );
        self.status = RunStatus::Failed;
        self.errors.push(reason.to_string());
    }
}

/// A user's bookmark on a tender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Favorite {
    pub user_id: String,
    pub licitacion_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_estado_roundtrip() {
        for estado in [
            Estado::Vigente,
            Estado::Vencida,
            Estado::Prorrogada,
            Estado::Archivada,
        ] {
            assert_eq!(Estado::parse(estado.as_str()), Some(estado));
        }
        assert_eq!(Estado::parse("abierta"), None);
    }

    #[test]
    fn test_workflow_state_default() {
        assert_eq!(WorkflowState::default(), WorkflowState::Descubierta);
    }

    #[test]
    fn test_url_quality_ranking() {
        assert!(UrlQuality::Direct.rank() > UrlQuality::Proxy.rank());
        assert!(UrlQuality::Proxy.rank() > UrlQuality::Partial.rank());
    }

    #[test]
    fn test_category_timeouts() {
        assert_eq!(AdapterCategory::Light.timeout().as_secs(), 300);
        assert_eq!(AdapterCategory::Medium.timeout().as_secs(), 600);
        assert_eq!(AdapterCategory::Heavy.timeout().as_secs(), 1200);
        assert_eq!(AdapterCategory::Heavy.hard_timeout().as_secs(), 1800);
    }

    #[test]
    fn test_category_concurrency_caps() {
        assert_eq!(AdapterCategory::Heavy.max_concurrent(), 2);
        assert_eq!(AdapterCategory::Medium.max_concurrent(), 4);
        assert_eq!(AdapterCategory::Light.max_concurrent(), 6);
    }

    #[test]
    fn test_content_hash_deterministic() {
        let d = NaiveDate::from_ymd_opt(2025, 3, 14);
        let a = NewLicitacion::compute_content_hash("Provisión de insumos", "boletin", d);
        let b = NewLicitacion::compute_content_hash("Provisión de insumos", "boletin", d);
        assert_eq!(a, b);
    }

    #[test]
    fn test_content_hash_case_insensitive_title() {
        let d = NaiveDate::from_ymd_opt(2025, 3, 14);
        let a = NewLicitacion::compute_content_hash("Provisión De Insumos", "boletin", d);
        let b = NewLicitacion::compute_content_hash("provisión de insumos", "boletin", d);
        assert_eq!(a, b);
    }

    #[test]
    fn test_content_hash_unknown_date() {
        let a = NewLicitacion::compute_content_hash("Obra", "boletin", None);
        let b = NewLicitacion::compute_content_hash("Obra", "boletin", None);
        assert_eq!(a, b);
        let c = NewLicitacion::compute_content_hash(
            "Obra",
            "boletin",
            NaiveDate::from_ymd_opt(2025, 1, 1),
        );
        assert_ne!(a, c);
    }

    #[test]
    fn test_content_hash_distinguishes_source() {
        let d = NaiveDate::from_ymd_opt(2025, 3, 14);
        let a = NewLicitacion::compute_content_hash("Obra", "boletin", d);
        let b = NewLicitacion::compute_content_hash("Obra", "comprar", d);
        assert_ne!(a, b);
    }

    #[test]
    fn test_run_finish_success() {
        let t0 = Utc::now();
        let mut run = ScraperRun::begin("mendoza-compras", t0);
        run.items_found = 10;
        run.items_saved = 10;
        run.finish(t0 + chrono::Duration::seconds(42));
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.duration_seconds, Some(42.0));
    }

    #[test]
    fn test_run_finish_partial_on_warnings() {
        let t0 = Utc::now();
        let mut run = ScraperRun::begin("mendoza-compras", t0);
        run.items_found = 10;
        run.items_saved = 8;
        run.warnings.push("year 2019 outside window".into());
        run.finish(t0 + chrono::Duration::seconds(1));
        assert_eq!(run.status, RunStatus::Partial);
    }

    #[test]
    fn test_run_finish_failed_when_nothing_produced() {
        let t0 = Utc::now();
        let mut run = ScraperRun::begin("mendoza-compras", t0);
        run.errors.push("HTTP 503".into());
        run.finish(t0 + chrono::Duration::seconds(1));
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[test]
    fn test_run_fail_reason_recorded() {
        let t0 = Utc::now();
        let mut run = ScraperRun::begin("mendoza-compras", t0);
        run.items_found = 3;
        run.fail(t0 + chrono::Duration::seconds(5), "cancelled");
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.errors.iter().any(|e| e == "cancelled"));
    }

    #[test]
    fn test_raw_record_serde_roundtrip() {
        let mut raw = RawRecord::new("comprar-mza", "Mendoza", "Adquisición de ambulancias");
        raw.expedient_number = Some("EX-2025-00123".into());
        raw.attached_files.push(AttachedFile {
            filename: "pliego.pdf".into(),
            url: "https://example.gov.ar/pliego.pdf".into(),
            mime: Some("application/pdf".into()),
            size: None,
        });
        let json = serde_json::to_string(&raw).unwrap();
        let back: RawRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.title, raw.title);
        assert_eq!(back.attached_files.len(), 1);
    }
}
