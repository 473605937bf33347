//! Cron scheduler and worker pool.
//!
//! One supervisor task per source. A run needs two permits, its category's
//! and the global one, so heavy sources can never crowd out light ones and
//! the process-wide cap holds regardless of mix. Supervisors are
//! sequential, which gives `max_instances=1` for free, and the next tick
//! is always computed fresh after a run, which is `coalesce=true`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use licita_core::error::AppError;
use licita_core::models::{AdapterCategory, RunStatus, ScraperConfig, ScraperRun};

use crate::context::CoreContext;
use crate::runner::execute_run;

/// Ceiling for the adaptive interval multiplier.
const MAX_ADAPTIVE_FACTOR: u32 = 8;

/// Zero-novel runs in a row before the interval doubles.
const EMPTY_RUNS_BEFORE_BACKOFF: u32 = 3;

/// Normalizes a standard 5-field cron expression to the 6-field
/// (seconds-first) form the `cron` crate parses.
pub(crate) fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

/// Next fire time after `after`, evaluated in the scheduler's timezone.
pub(crate) fn next_occurrence(
    expr: &str,
    after: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<DateTime<Utc>>, AppError> {
    let schedule = Schedule::from_str(&normalize_cron(expr))
        .map_err(|e| AppError::Config(format!("bad cron '{}': {}", expr, e)))?;
    let local = after.with_timezone(&tz);
    Ok(schedule.after(&local).next().map(|dt| dt.with_timezone(&Utc)))
}

/// Adaptive-schedule step: given the counters and a run's novel-item
/// count, returns the next (consecutive_empty, factor) pair.
pub(crate) fn adaptive_step(
    consecutive_empty: u32,
    factor: u32,
    novel_items: i64,
) -> (u32, u32) {
    if novel_items > 0 {
        return (0, 1);
    }
    let consecutive_empty = consecutive_empty + 1;
    if consecutive_empty >= EMPTY_RUNS_BEFORE_BACKOFF {
        (0, (factor * 2).min(MAX_ADAPTIVE_FACTOR))
    } else {
        (consecutive_empty, factor)
    }
}

/// The base interval the adaptive multiplier applies to: the configured
/// floor if any, else the gap between the next two cron fires.
fn base_interval(config: &ScraperConfig, now: DateTime<Utc>, tz: Tz) -> ChronoDuration {
    if let Some(hours) = config.min_interval_hours {
        return ChronoDuration::seconds((hours * 3600.0) as i64);
    }
    if let Ok(schedule) = Schedule::from_str(&normalize_cron(&config.schedule)) {
        let mut upcoming = schedule.after(&now.with_timezone(&tz));
        if let (Some(a), Some(b)) = (upcoming.next(), upcoming.next()) {
            return b - a;
        }
    }
    ChronoDuration::hours(6)
}

/// Live state of one supervised job.
pub struct JobState {
    pub name: String,
    running: AtomicBool,
    queued: AtomicBool,
    next_run: Mutex<Option<DateTime<Utc>>>,
    last_status: Mutex<Option<RunStatus>>,
    consecutive_empty: AtomicU32,
    factor: AtomicU32,
}

impl JobState {
    fn new(name: String) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            next_run: Mutex::new(None),
            last_status: Mutex::new(None),
            consecutive_empty: AtomicU32::new(0),
            factor: AtomicU32::new(1),
        }
    }

    /// Resets adaptive counters; used by reactivation.
    fn reset(&self) {
        self.consecutive_empty.store(0, Ordering::Relaxed);
        self.factor.store(1, Ordering::Relaxed);
    }
}

struct JobHandle {
    trigger_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
    state: Arc<JobState>,
}

/// Introspection snapshot of one job.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobSnapshot {
    pub name: String,
    pub active: bool,
    pub running: bool,
    pub queued: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub adaptive_factor: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub jobs: usize,
    pub available_global_slots: usize,
}

pub struct Scheduler {
    ctx: Arc<CoreContext>,
    global: Arc<Semaphore>,
    light: Arc<Semaphore>,
    medium: Arc<Semaphore>,
    heavy: Arc<Semaphore>,
    jobs: Mutex<HashMap<String, JobHandle>>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(ctx: Arc<CoreContext>) -> Arc<Self> {
        let global = ctx.settings.max_concurrent_scrapers.max(1);
        Arc::new(Self {
            ctx,
            global: Arc::new(Semaphore::new(global)),
            light: Arc::new(Semaphore::new(AdapterCategory::Light.max_concurrent())),
            medium: Arc::new(Semaphore::new(AdapterCategory::Medium.max_concurrent())),
            heavy: Arc::new(Semaphore::new(AdapterCategory::Heavy.max_concurrent())),
            jobs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Marks stale runs aborted and spawns a supervisor per configured
    /// source (paused sources included: their ticks record `skipped`).
    pub async fn start(self: &Arc<Self>) -> Result<usize, AppError> {
        let aborted = self.ctx.runs.fail_stale_runs().await?;
        if aborted > 0 {
            tracing::warn!(aborted, "marked stale runs as aborted");
        }

        let configs = self.ctx.runs.list_configs(false).await?;
        let count = configs.len();
        for config in configs {
            self.spawn_job(config.name.clone());
        }
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(jobs = count, "scheduler started");
        Ok(count)
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("scheduler stopped");
    }

    fn spawn_job(self: &Arc<Self>, name: String) {
        let mut jobs = self.jobs.lock().expect("jobs lock");
        if jobs.contains_key(&name) {
            return;
        }
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let cancel = self.shutdown.child_token();
        let state = Arc::new(JobState::new(name.clone()));
        jobs.insert(
            name.clone(),
            JobHandle {
                trigger_tx,
                cancel: cancel.clone(),
                state: Arc::clone(&state),
            },
        );
        drop(jobs);

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            supervise(scheduler, name, cancel, trigger_rx, state).await;
        });
    }

    /// Enqueues an out-of-band run, still bounded by the concurrency caps.
    /// A full trigger queue means one is already pending; that's coalesced.
    pub fn trigger(&self, name: &str) -> Result<(), AppError> {
        let jobs = self.jobs.lock().expect("jobs lock");
        let handle = jobs
            .get(name)
            .ok_or_else(|| AppError::ConfigNotFound(name.to_string()))?;
        match handle.trigger_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(AppError::Generic(format!(
                "job '{}' is no longer supervised",
                name
            ))),
        }
    }

    /// Ensures a supervisor exists (sources added after start) and resets
    /// its adaptive counters. Called on reactivation.
    pub async fn reschedule(self: &Arc<Self>, name: &str) -> Result<(), AppError> {
        self.ctx.runs.get_config(name).await?;
        self.spawn_job(name.to_string());
        let jobs = self.jobs.lock().expect("jobs lock");
        if let Some(handle) = jobs.get(name) {
            handle.state.reset();
        }
        Ok(())
    }

    /// Cancels a job's in-flight run without removing the supervisor.
    pub fn cancel_job(&self, name: &str) -> Result<(), AppError> {
        let jobs = self.jobs.lock().expect("jobs lock");
        let handle = jobs
            .get(name)
            .ok_or_else(|| AppError::ConfigNotFound(name.to_string()))?;
        handle.cancel.cancel();
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            jobs: self.jobs.lock().expect("jobs lock").len(),
            available_global_slots: self.global.available_permits(),
        }
    }

    /// Snapshot of every supervised job joined with its stored config.
    pub async fn jobs(&self) -> Result<Vec<JobSnapshot>, AppError> {
        let configs: HashMap<String, ScraperConfig> = self
            .ctx
            .runs
            .list_configs(false)
            .await?
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();

        let jobs = self.jobs.lock().expect("jobs lock");
        let mut snapshots: Vec<JobSnapshot> = jobs
            .values()
            .map(|handle| {
                let state = &handle.state;
                let config = configs.get(&state.name);
                JobSnapshot {
                    name: state.name.clone(),
                    active: config.map(|c| c.active).unwrap_or(false),
                    running: state.running.load(Ordering::Relaxed),
                    queued: state.queued.load(Ordering::Relaxed),
                    next_run: *state.next_run.lock().expect("state lock"),
                    last_run: config.and_then(|c| c.last_run),
                    last_status: *state.last_status.lock().expect("state lock"),
                    adaptive_factor: state.factor.load(Ordering::Relaxed),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }

    fn category_semaphore(&self, category: AdapterCategory) -> Arc<Semaphore> {
        match category {
            AdapterCategory::Light => Arc::clone(&self.light),
            AdapterCategory::Medium => Arc::clone(&self.medium),
            AdapterCategory::Heavy => Arc::clone(&self.heavy),
        }
    }
}

enum Wake {
    Tick,
    Manual,
    Shutdown,
}

async fn supervise(
    scheduler: Arc<Scheduler>,
    name: String,
    cancel: CancellationToken,
    mut trigger_rx: mpsc::Receiver<()>,
    state: Arc<JobState>,
) {
    let ctx = Arc::clone(&scheduler.ctx);
    loop {
        // Re-read the config each cycle so pauses, reactivations, and
        // schedule edits take effect without a restart.
        let config = match ctx.runs.get_config(&name).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(source = %name, "config read failed: {}", e);
                if sleep_or_cancel(std::time::Duration::from_secs(60), &cancel).await {
                    return;
                }
                continue;
            }
        };

        let now = ctx.clock.now();
        let tz = ctx.settings.timezone;
        let mut next = match next_occurrence(&config.schedule, now, tz) {
            Ok(Some(next)) => next,
            Ok(None) => now + ChronoDuration::days(1),
            Err(e) => {
                tracing::warn!(source = %name, "{}", e);
                now + ChronoDuration::hours(1)
            }
        };

        let factor = state.factor.load(Ordering::Relaxed);
        if config.adaptive_schedule && factor > 1 {
            let delayed = config.last_run.unwrap_or(now)
                + base_interval(&config, now, tz) * factor as i32;
            if delayed > next {
                tracing::debug!(source = %name, factor, until = %delayed, "adaptive backoff");
                next = delayed;
            }
        }
        *state.next_run.lock().expect("state lock") = Some(next);

        let wait = (next - now).to_std().unwrap_or_default();
        let wake = tokio::select! {
            _ = tokio::time::sleep(wait) => Wake::Tick,
            received = trigger_rx.recv() => match received {
                Some(()) => Wake::Manual,
                None => Wake::Shutdown,
            },
            _ = cancel.cancelled() => Wake::Shutdown,
        };

        match wake {
            Wake::Shutdown => return,
            Wake::Tick => {
                if !config.active {
                    record_skipped(&ctx, &name, "source paused").await;
                    continue;
                }
                if let Some(window) = ctx.settings.quiet_window {
                    let local = ctx.local_time();
                    if window.contains(local) {
                        record_skipped(&ctx, &name, "quiet window").await;
                        continue;
                    }
                }
            }
            // Manual triggers run even when paused; they are how an
            // operator probes a source before reactivating it.
            Wake::Manual => {}
        }

        state.queued.store(true, Ordering::Relaxed);
        let category = scheduler.category_semaphore(config.category);
        let global = Arc::clone(&scheduler.global);
        let permits = tokio::select! {
            permits = acquire_both(category, global) => permits,
            _ = cancel.cancelled() => {
                state.queued.store(false, Ordering::Relaxed);
                return;
            }
        };
        state.queued.store(false, Ordering::Relaxed);

        state.running.store(true, Ordering::Relaxed);
        let outcome = execute_run(&ctx, &config, cancel.child_token()).await;
        state.running.store(false, Ordering::Relaxed);
        drop(permits);

        match outcome {
            Ok(outcome) => {
                *state.last_status.lock().expect("state lock") = Some(outcome.run.status);
                if config.adaptive_schedule {
                    let (empty, factor) = adaptive_step(
                        state.consecutive_empty.load(Ordering::Relaxed),
                        state.factor.load(Ordering::Relaxed),
                        outcome.novel_items,
                    );
                    state.consecutive_empty.store(empty, Ordering::Relaxed);
                    state.factor.store(factor, Ordering::Relaxed);
                }
            }
            Err(e) => {
                tracing::error!(source = %name, "failed to persist run: {}", e);
                if sleep_or_cancel(std::time::Duration::from_secs(30), &cancel).await {
                    return;
                }
            }
        }
    }
}

/// Both permits, category first. Every supervisor acquires in the same
/// order, so the pair cannot deadlock.
async fn acquire_both(
    category: Arc<Semaphore>,
    global: Arc<Semaphore>,
) -> (OwnedSemaphorePermit, OwnedSemaphorePermit) {
    let category = category
        .acquire_owned()
        .await
        .expect("category semaphore closed");
    let global = global.acquire_owned().await.expect("global semaphore closed");
    (category, global)
}

/// Returns true when cancelled.
async fn sleep_or_cancel(duration: std::time::Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.cancelled() => true,
    }
}

async fn record_skipped(ctx: &CoreContext, name: &str, reason: &str) {
    let now = ctx.clock.now();
    let mut run = ScraperRun::begin(name, now);
    run.status = RunStatus::Skipped;
    run.ended_at = Some(now);
    run.duration_seconds = Some(0.0);
    run.logs.push(reason.to_string());
    if let Err(e) = ctx.runs.record_run(&run).await {
        tracing::warn!(source = %name, "could not record skipped run: {}", e);
    } else {
        tracing::info!(source = %name, reason, "tick skipped");
    }
}
