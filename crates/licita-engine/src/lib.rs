//! Licita Engine - orchestration around the core pipeline.
//!
//! The scheduler drives one supervisor task per source through a global
//! semaphore plus per-category semaphores; each run walks
//! adapter → resolver → dedup/upsert and is durable in `scraper_runs`.
//! Health monitoring, auto-pause, and the enrichment job run as their own
//! periodic loops over the same [`context::CoreContext`].

pub mod context;
pub mod enrichment;
pub mod health;
pub mod notify;
pub mod runner;
pub mod scheduler;

pub use context::{Clock, CoreContext, FixedClock, SystemClock};
pub use enrichment::EnrichmentJob;
pub use health::{HealthMonitor, SourceHealth};
pub use notify::{LogSink, NotificationSink};
pub use runner::{execute_run, RunOutcome};
pub use scheduler::{JobSnapshot, Scheduler, SchedulerStatus};
