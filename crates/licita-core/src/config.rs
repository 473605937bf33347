//! Configuration: environment tunables and the `sources.toml` file.

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::dates::DEFAULT_TIMEZONE;
use crate::error::AppError;
use crate::models::{AdapterCategory, PaginationState, ScraperConfig};

/// Runtime tunables read from the environment, with working defaults.
#[derive(Debug, Clone)]
pub struct EnvSettings {
    /// Global cap on concurrently running scrapers.
    pub max_concurrent_scrapers: usize,
    /// Minimum spacing between requests to one host, in milliseconds.
    pub http_rate_limit_ms_per_host: u64,
    /// Consecutive failures before a host's circuit opens.
    pub http_circuit_fail_threshold: u32,
    /// Minutes an open circuit stays open.
    pub http_circuit_cooldown_min: u64,
    /// Wall-clock window in which scheduled runs are suppressed.
    pub quiet_window: Option<QuietWindow>,
    /// Timezone for the quiet window and estado's "today".
    pub timezone: Tz,
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self {
            max_concurrent_scrapers: 6,
            http_rate_limit_ms_per_host: 1000,
            http_circuit_fail_threshold: 5,
            http_circuit_cooldown_min: 5,
            quiet_window: None,
            timezone: DEFAULT_TIMEZONE,
        }
    }
}

impl EnvSettings {
    /// Reads settings from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through a lookup function. Unparseable values fall
    /// back to defaults with a warning rather than failing startup.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut settings = Self::default();

        if let Some(v) = parsed(&lookup, "MAX_CONCURRENT_SCRAPERS") {
            settings.max_concurrent_scrapers = v;
        }
        if let Some(v) = parsed(&lookup, "HTTP_RATE_LIMIT_MS_PER_HOST") {
            settings.http_rate_limit_ms_per_host = v;
        }
        if let Some(v) = parsed(&lookup, "HTTP_CIRCUIT_FAIL_THRESHOLD") {
            settings.http_circuit_fail_threshold = v;
        }
        if let Some(v) = parsed(&lookup, "HTTP_CIRCUIT_COOLDOWN_MIN") {
            settings.http_circuit_cooldown_min = v;
        }

        let start = lookup("QUIET_WINDOW_START").and_then(|s| parse_time(&s));
        let end = lookup("QUIET_WINDOW_END").and_then(|s| parse_time(&s));
        if let (Some(start), Some(end)) = (start, end) {
            settings.quiet_window = Some(QuietWindow { start, end });
        }

        if let Some(tz) = lookup("TIMEZONE") {
            match Tz::from_str(&tz) {
                Ok(parsed) => settings.timezone = parsed,
                Err(_) => {
                    tracing::warn!("Unknown TIMEZONE '{}', keeping {}", tz, settings.timezone)
                }
            }
        }

        settings
    }
}

fn parsed<F: Fn(&str) -> Option<String>, T: FromStr>(lookup: &F, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}='{}'", key, raw);
            None
        }
    }
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

/// A wall-clock suppression window, possibly wrapping midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietWindow {
    /// True when the given local time falls inside the window.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            // Wraps midnight, e.g. 22:00-06:00.
            t >= self.start || t < self.end
        }
    }
}

// =============================================================================
// Source configuration (sources.toml)
// =============================================================================

fn default_adapter() -> String {
    "html_listing".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_schedule() -> String {
    "0 */6 * * *".to_string()
}

/// Root structure of sources.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub sources: Vec<SourceEntry>,
}

impl SourcesConfig {
    /// Returns only enabled sources.
    pub fn enabled_sources(&self) -> Vec<&SourceEntry> {
        self.sources.iter().filter(|s| s.enabled).collect()
    }

    /// Find a source by name (case-insensitive).
    pub fn find_by_name(&self, name: &str) -> Option<&SourceEntry> {
        self.sources
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }
}

/// One scrapeable portal as declared in sources.toml.
///
/// Runtime state (`active`, `last_run`, `runs_count`) lives in the
/// database; entries here are synced into `scraper_configs` at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    pub url: String,

    /// Adapter type resolved by the registry.
    #[serde(default = "default_adapter")]
    pub adapter: String,

    pub jurisdiccion: String,

    /// Standard 5-field cron expression.
    #[serde(default = "default_schedule")]
    pub schedule: String,

    #[serde(default)]
    pub category: AdapterCategory,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub description: Option<String>,

    /// Adapter-specific CSS selectors or JSON field paths.
    #[serde(default)]
    pub selectors: BTreeMap<String, String>,

    #[serde(default)]
    pub pagination: PaginationState,

    /// Adaptive scheduling floor, in hours.
    pub min_interval_hours: Option<f64>,

    /// Doubles the interval after repeated empty runs.
    #[serde(default)]
    pub adaptive_schedule: bool,
}

impl SourceEntry {
    /// Shapes this entry as a fresh scraper config for the first sync.
    pub fn to_scraper_config(&self) -> ScraperConfig {
        ScraperConfig {
            name: self.name.clone(),
            url: self.url.clone(),
            adapter: self.adapter.clone(),
            jurisdiccion: self.jurisdiccion.clone(),
            category: self.category,
            active: self.enabled,
            schedule: self.schedule.clone(),
            selectors: self.selectors.clone(),
            pagination: self.pagination.clone(),
            last_run: None,
            runs_count: 0,
            min_interval_hours: self.min_interval_hours,
            adaptive_schedule: self.adaptive_schedule,
            paused_reason: None,
        }
    }
}

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "sources.toml";

/// Default configuration directory: `~/.config/licita/`.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("licita"))
}

/// Default configuration file path: `~/.config/licita/sources.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join(CONFIG_FILE_NAME))
}

/// Template written on first use so `licita serve` works out of the box.
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Licita source configuration
#
# Usage:
#   licita serve                    # schedule every enabled source
#   licita harvest --source <name>  # run one source immediately
#
# Set enabled = false to skip a source. Schedules are standard 5-field cron.

[[sources]]
name = "comprar-mza"
url = "https://comprar.mendoza.gov.ar/Compras.aspx"
adapter = "viewstate"
jurisdiccion = "Mendoza"
category = "medium"
schedule = "0 */6 * * *"
description = "Portal de compras de la Provincia de Mendoza"

[sources.selectors]
row = "table[id$='dgResultado'] tr"
title = "td:nth-of-type(2)"
expediente = "td:nth-of-type(1)"

[[sources]]
name = "boletin-mza"
url = "https://www.mendoza.gov.ar/boletinoficial/licitaciones/"
adapter = "boletin"
jurisdiccion = "Mendoza"
schedule = "30 7 * * *"
description = "Boletín Oficial de Mendoza, sección licitaciones"

[[sources]]
name = "comprar-nacion"
url = "https://comprar.gob.ar/api/procesos"
adapter = "json_api"
jurisdiccion = "Nacional"
schedule = "15 */4 * * *"
adaptive_schedule = true
description = "COMPR.AR nacional (API JSON)"

[sources.selectors]
items = "data"
title = "nombre"
organization = "unidad_operativa"
expediente = "numero_expediente"
numero = "numero_proceso"
published = "fecha_publicacion"
opening = "fecha_apertura"

[sources.pagination]
style = "page_param"
param = "page"
max_pages = 20
"#;

/// Load source configuration from a TOML file.
///
/// With no explicit path, the default XDG location is used and a template
/// is auto-created when missing (mirroring first-run behavior); a custom
/// path that does not exist is an error.
pub fn load_sources_config(path: Option<PathBuf>) -> Result<Option<SourcesConfig>, AppError> {
    let using_default_path = path.is_none();
    let config_path = match path {
        Some(p) => p,
        None => match default_config_path() {
            Some(p) => p,
            None => return Ok(None),
        },
    };

    if !config_path.exists() {
        if using_default_path {
            match create_default_config(&config_path) {
                Ok(()) => {
                    tracing::info!(
                        "Config file created at {}. Edit it to add sources.",
                        config_path.display()
                    );
                }
                Err(e) => {
                    tracing::warn!("Could not create default config template: {}", e);
                    return Ok(None);
                }
            }
        } else {
            return Err(AppError::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }
    }

    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        AppError::Config(format!(
            "Failed to read config file '{}': {}",
            config_path.display(),
            e
        ))
    })?;

    let config: SourcesConfig = toml::from_str(&content).map_err(|e| {
        AppError::Config(format!(
            "Invalid TOML in '{}': {}",
            config_path.display(),
            e
        ))
    })?;

    Ok(Some(config))
}

fn create_default_config(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    tracing::info!("Created default config template at: {}", path.display());
    Ok(())
}
