//! Shared context threaded through every engine component.
//!
//! No component reads global state: the database handles, HTTP client,
//! configuration, notification sink, and crucially the clock all arrive
//! through [`CoreContext`]. The injectable clock is what makes estado
//! computation and quiet-window decisions reproducible in tests.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::sync::Arc;

use licita_client::{AdapterRegistry, FetchClient};
use licita_core::EnvSettings;
use licita_db::{FavoriteRepository, LicitacionRepository, QueryEngine, RunRepository};

use crate::notify::NotificationSink;

/// Time source. Production uses [`SystemClock`]; tests pin a
/// [`FixedClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at construction time.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Everything a run, sweep, or query needs, passed explicitly.
#[derive(Clone)]
pub struct CoreContext {
    pub licitaciones: LicitacionRepository,
    pub runs: RunRepository,
    pub favorites: FavoriteRepository,
    pub query: Arc<QueryEngine>,
    pub http: FetchClient,
    pub registry: Arc<AdapterRegistry>,
    pub settings: EnvSettings,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn NotificationSink>,
}

impl CoreContext {
    /// Calendar "today" in the configured timezone; the resolver's notion
    /// of now.
    pub fn today(&self) -> NaiveDate {
        self.clock
            .now()
            .with_timezone(&self.settings.timezone)
            .date_naive()
    }

    /// Local wall-clock time, for the quiet window.
    pub fn local_time(&self) -> NaiveTime {
        self.clock.now().with_timezone(&self.settings.timezone).time()
    }
}
