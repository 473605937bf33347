//! Health sweep and auto-pause.
//!
//! Every 30 minutes each source's recent runs are scored (the scoring
//! itself is pure, in `licita_core::health`); three consecutive failures
//! pause the source and emit a notification. Reactivation is always
//! manual and always permitted.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use licita_core::error::AppError;
use licita_core::health::{evaluate, HealthReport, HEALTH_WINDOW};
use licita_core::models::ScraperConfig;

use crate::context::CoreContext;
use crate::scheduler::Scheduler;

/// How often the sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

const AUTO_PAUSE_REASON: &str = "3 consecutive failed runs";

/// One source's health at sweep time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceHealth {
    pub name: String,
    pub active: bool,
    pub score: u8,
    pub success_rate: f64,
    pub freshness: f64,
    pub yield_score: f64,
    pub stability: f64,
    pub consecutive_failures: usize,
    pub paused_reason: Option<String>,
}

pub struct HealthMonitor {
    ctx: Arc<CoreContext>,
    scheduler: Arc<Scheduler>,
}

impl HealthMonitor {
    pub fn new(ctx: Arc<CoreContext>, scheduler: Arc<Scheduler>) -> Self {
        Self { ctx, scheduler }
    }

    /// Periodic sweep until shutdown.
    pub async fn run_loop(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = shutdown.cancelled() => return,
            }
            match self.sweep().await {
                Ok(report) => {
                    tracing::info!(sources = report.len(), "health sweep complete");
                }
                Err(e) => tracing::error!("health sweep failed: {}", e),
            }
        }
    }

    /// Scores every source and auto-pauses the ones that earned it.
    pub async fn sweep(&self) -> Result<Vec<SourceHealth>, AppError> {
        let configs = self.ctx.runs.list_configs(false).await?;
        let mut results = Vec::with_capacity(configs.len());

        for config in configs {
            let samples = self
                .ctx
                .runs
                .recent_samples(&config.name, HEALTH_WINDOW as i64)
                .await?;
            let report = evaluate(
                &samples,
                schedule_interval_hours(&config),
                self.ctx.clock.now(),
            );

            if config.active && report.should_pause() {
                tracing::warn!(
                    source = %config.name,
                    score = report.score,
                    "auto-pausing after {} consecutive failures",
                    report.consecutive_failures
                );
                self.ctx
                    .runs
                    .set_active(&config.name, false, Some(AUTO_PAUSE_REASON))
                    .await?;
                self.ctx
                    .notifier
                    .notify(
                        "auto_pause",
                        serde_json::json!({
                            "source": config.name,
                            "score": report.score,
                            "consecutive_failures": report.consecutive_failures,
                            "reason": AUTO_PAUSE_REASON,
                        }),
                    )
                    .await;
                results.push(to_source_health(&config, &report, false, Some(AUTO_PAUSE_REASON)));
            } else {
                results.push(to_source_health(
                    &config,
                    &report,
                    config.active,
                    config.paused_reason.as_deref(),
                ));
            }
        }
        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }

    /// Clears a pause regardless of score, resets the job's adaptive
    /// counters, and puts it back on the schedule.
    pub async fn reactivate(&self, name: &str) -> Result<(), AppError> {
        self.ctx.runs.set_active(name, true, None).await?;
        self.scheduler.reschedule(name).await?;
        self.ctx
            .notifier
            .notify("reactivated", serde_json::json!({ "source": name }))
            .await;
        tracing::info!(source = %name, "source reactivated");
        Ok(())
    }
}

fn to_source_health(
    config: &ScraperConfig,
    report: &HealthReport,
    active: bool,
    paused_reason: Option<&str>,
) -> SourceHealth {
    SourceHealth {
        name: config.name.clone(),
        active,
        score: report.score,
        success_rate: report.success_rate,
        freshness: report.freshness,
        yield_score: report.yield_score,
        stability: report.stability,
        consecutive_failures: report.consecutive_failures,
        paused_reason: paused_reason.map(str::to_string),
    }
}

/// Freshness horizon input: the configured floor, else 6 hours.
fn schedule_interval_hours(config: &ScraperConfig) -> f64 {
    config.min_interval_hours.unwrap_or(6.0)
}
