//! Source adapters: one per portal family, behind a common trait.
//!
//! An adapter's single job is enumeration and extraction: walk listing
//! pages (respecting the configured pagination), parse rows or detail
//! pages, and emit [`RawRecord`]s with whatever fields the source exposes.
//! Date resolution and estado logic are deliberately absent here.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use licita_core::error::AppError;
use licita_core::models::{AdapterCategory, RawRecord, ScraperConfig};

use crate::http::FetchClient;

mod boletin;
mod genexus;
mod html_listing;
mod json_api;
mod rows;
mod viewstate;

pub use boletin::BoletinAdapter;
pub use genexus::GenexusAdapter;
pub use html_listing::HtmlListingAdapter;
pub use json_api::JsonApiAdapter;
pub use viewstate::ViewstateAdapter;

/// Per-run context handed to adapters.
#[derive(Clone)]
pub struct AdapterContext {
    pub cancel: CancellationToken,
    /// Resolver's "today"; adapters only pass it through for logging.
    pub today: NaiveDate,
}

/// What one run of an adapter produced. Per-row parse problems accumulate
/// in `warnings`; they never abort the run.
#[derive(Debug, Default)]
pub struct AdapterOutput {
    pub records: Vec<RawRecord>,
    pub warnings: Vec<String>,
}

impl AdapterOutput {
    pub fn push_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::debug!("adapter warning: {}", warning);
        self.warnings.push(warning);
    }
}

impl std::fmt::Debug for dyn SourceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceAdapter").field("name", &self.name()).finish()
    }
}

/// A named scraping strategy for one portal family.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Registry key; also the `adapter` value in sources.toml.
    fn name(&self) -> &'static str;

    fn category(&self) -> AdapterCategory;

    /// URL-pattern fallback used when a config names no adapter type.
    fn handles_url(&self, _url: &Url) -> bool {
        false
    }

    async fn run(
        &self,
        config: &ScraperConfig,
        client: &FetchClient,
        ctx: &AdapterContext,
    ) -> Result<AdapterOutput, AppError>;
}

/// Adapter lookup: by configured type first, by URL pattern second.
/// Adding a source family is one `register` call.
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    /// Registry pre-loaded with the built-in adapters.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        registry.register(Arc::new(JsonApiAdapter));
        registry.register(Arc::new(HtmlListingAdapter));
        registry.register(Arc::new(ViewstateAdapter));
        registry.register(Arc::new(GenexusAdapter));
        registry.register(Arc::new(BoletinAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.name(), adapter);
    }

    /// Resolves the adapter for a config: exact type name, then URL
    /// pattern fallback.
    pub fn resolve(&self, config: &ScraperConfig) -> Result<Arc<dyn SourceAdapter>, AppError> {
        if let Some(adapter) = self.adapters.get(config.adapter.as_str()) {
            return Ok(Arc::clone(adapter));
        }
        if let Ok(url) = Url::parse(&config.url) {
            if let Some(adapter) = self.adapters.values().find(|a| a.handles_url(&url)) {
                return Ok(Arc::clone(adapter));
            }
        }
        Err(AppError::Config(format!(
            "no adapter '{}' for source '{}'",
            config.adapter, config.name
        )))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.adapters.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(adapter: &str, url: &str) -> ScraperConfig {
        ScraperConfig {
            name: "prueba".into(),
            url: url.into(),
            adapter: adapter.into(),
            jurisdiccion: "Mendoza".into(),
            category: AdapterCategory::Light,
            active: true,
            schedule: "0 */6 * * *".into(),
            selectors: BTreeMap::new(),
            pagination: Default::default(),
            last_run: None,
            runs_count: 0,
            min_interval_hours: None,
            adaptive_schedule: false,
            paused_reason: None,
        }
    }

    #[test]
    fn test_registry_resolves_by_name() {
        let registry = AdapterRegistry::with_builtins();
        let adapter = registry
            .resolve(&config("json_api", "https://example.gov.ar"))
            .unwrap();
        assert_eq!(adapter.name(), "json_api");
    }

    #[test]
    fn test_registry_url_fallback() {
        let registry = AdapterRegistry::with_builtins();
        let adapter = registry
            .resolve(&config("", "https://portal.gov.ar/Compras.aspx"))
            .unwrap();
        assert_eq!(adapter.name(), "viewstate");
    }

    #[test]
    fn test_registry_unknown_adapter() {
        let registry = AdapterRegistry::with_builtins();
        let err = registry
            .resolve(&config("playwright", "https://example.gov.ar"))
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_registry_names_sorted() {
        let registry = AdapterRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec!["boletin", "genexus", "html_listing", "json_api", "viewstate"]
        );
    }
}
