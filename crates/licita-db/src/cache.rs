//! TTL caches for the query engine's aggregate endpoints.
//!
//! Facets and distinct lists are recomputed at most once per TTL;
//! ingestion invalidates them lazily after writes.

use moka::sync::Cache;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use licita_core::query::FacetCount;

const FACETS_TTL: Duration = Duration::from_secs(5 * 60);
const DISTINCT_TTL: Duration = Duration::from_secs(30 * 60);
const RUBROS_TTL: Duration = Duration::from_secs(60 * 60);

pub(crate) type FacetsValue = Arc<BTreeMap<String, Vec<FacetCount>>>;
pub(crate) type ValuesList = Arc<Vec<String>>;

pub(crate) struct QueryCaches {
    pub facets: Cache<String, FacetsValue>,
    pub distinct: Cache<String, ValuesList>,
    pub rubros: Cache<String, ValuesList>,
}

impl QueryCaches {
    pub fn new() -> Self {
        Self {
            facets: Cache::builder()
                .max_capacity(256)
                .time_to_live(FACETS_TTL)
                .build(),
            distinct: Cache::builder()
                .max_capacity(512)
                .time_to_live(DISTINCT_TTL)
                .build(),
            rubros: Cache::builder()
                .max_capacity(4)
                .time_to_live(RUBROS_TTL)
                .build(),
        }
    }

    /// Drops everything; called after writes that touch cached dimensions.
    pub fn invalidate(&self) {
        self.facets.invalidate_all();
        self.distinct.invalidate_all();
        self.rubros.invalidate_all();
    }
}
