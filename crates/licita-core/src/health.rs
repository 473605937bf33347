//! Per-source health scoring.
//!
//! Pure computation over a window of recent runs; the sweep that feeds it
//! and the auto-pause side effects live in the engine crate.

use chrono::{DateTime, Utc};

use crate::models::RunStatus;

/// How many recent runs participate in the score.
pub const HEALTH_WINDOW: usize = 20;

/// This many consecutive failed runs pause the source.
pub const PAUSE_AFTER_FAILURES: usize = 3;

/// The slice of a [`crate::models::ScraperRun`] that health scoring needs.
#[derive(Debug, Clone)]
pub struct RunSample {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: Option<f64>,
    pub items_saved: i64,
    pub items_updated: i64,
}

impl RunSample {
    fn yielded(&self) -> i64 {
        self.items_saved + self.items_updated
    }
}

/// Health score and its components, each in [0, 1] except `score`.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub score: u8,
    pub success_rate: f64,
    pub freshness: f64,
    pub yield_score: f64,
    pub stability: f64,
    pub consecutive_failures: usize,
}

impl HealthReport {
    /// Auto-pause fires on consecutive failures, independent of the score.
    pub fn should_pause(&self) -> bool {
        self.consecutive_failures >= PAUSE_AFTER_FAILURES
    }
}

/// Scores one source from its recent runs (newest first).
///
/// Weighted sum: 40% success rate over the window, 30% freshness against
/// twice the schedule interval, 20% yield against the trailing median
/// (repeated zero yield zeroes the component), 10% duration stability.
pub fn evaluate(
    runs: &[RunSample],
    schedule_interval_hours: f64,
    now: DateTime<Utc>,
) -> HealthReport {
    let window: Vec<&RunSample> = runs.iter().take(HEALTH_WINDOW).collect();

    let success_rate = if window.is_empty() {
        0.0
    } else {
        let successes = window
            .iter()
            .filter(|r| r.status == RunStatus::Success)
            .count();
        successes as f64 / window.len() as f64
    };

    let freshness = window
        .iter()
        .find(|r| r.status == RunStatus::Success)
        .map(|last| {
            let hours = (now - last.started_at).num_seconds() as f64 / 3600.0;
            let horizon = (2.0 * schedule_interval_hours).max(1.0);
            1.0 - (hours / horizon).clamp(0.0, 1.0)
        })
        .unwrap_or(0.0);

    let yield_score = compute_yield(&window);
    let stability = compute_stability(&window);

    let consecutive_failures = runs
        .iter()
        .take_while(|r| r.status == RunStatus::Failed)
        .count();

    let weighted =
        0.4 * success_rate + 0.3 * freshness + 0.2 * yield_score + 0.1 * stability;
    HealthReport {
        score: (weighted * 100.0).round().clamp(0.0, 100.0) as u8,
        success_rate,
        freshness,
        yield_score,
        stability,
        consecutive_failures,
    }
}

fn compute_yield(window: &[&RunSample]) -> f64 {
    let Some(recent) = window.first() else {
        return 0.0;
    };

    // Three zero-yield runs in a row means the source dried up or the
    // selectors broke; either way the component bottoms out.
    if window.len() >= 3 && window.iter().take(3).all(|r| r.yielded() == 0) {
        return 0.0;
    }

    let mut trailing: Vec<i64> = window.iter().skip(1).map(|r| r.yielded()).collect();
    if trailing.is_empty() {
        return if recent.yielded() > 0 { 1.0 } else { 0.0 };
    }
    trailing.sort_unstable();
    let median = trailing[trailing.len() / 2] as f64;
    if median <= 0.0 {
        return if recent.yielded() > 0 { 1.0 } else { 0.0 };
    }
    (recent.yielded() as f64 / median).clamp(0.0, 1.0)
}

fn compute_stability(window: &[&RunSample]) -> f64 {
    let durations: Vec<f64> = window.iter().filter_map(|r| r.duration_seconds).collect();
    if durations.len() < 2 {
        return 1.0;
    }
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;
    if mean <= 0.0 {
        return 1.0;
    }
    let variance = durations
        .iter()
        .map(|d| (d - mean).powi(2))
        .sum::<f64>()
        / durations.len() as f64;
    let cv = variance.sqrt() / mean;
    1.0 / (1.0 + cv)
}
