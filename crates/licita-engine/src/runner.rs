//! One scraper run, end to end: adapter → resolver → dedup/upsert.
//!
//! The run row is written before the adapter's first request, so a process
//! death leaves a `running` row that boot-time cleanup marks aborted.
//! Per-record problems become warnings; the run's final status falls out
//! of its counters.

use tokio_util::sync::CancellationToken;

use licita_client::AdapterContext;
use licita_core::error::AppError;
use licita_core::models::{ScraperConfig, ScraperRun};
use licita_core::resolver;

use crate::context::CoreContext;

/// A finished run plus what the scheduler's adaptive logic needs.
#[derive(Debug)]
pub struct RunOutcome {
    pub run: ScraperRun,
    /// Newly inserted identities; zero means the source had nothing new.
    pub novel_items: i64,
}

/// Executes one run of `config` under `cancel`, bounded by the category's
/// hard timeout. Always leaves a closed run row behind; the returned
/// `Err` is reserved for failures to persist the run itself.
pub async fn execute_run(
    ctx: &CoreContext,
    config: &ScraperConfig,
    cancel: CancellationToken,
) -> Result<RunOutcome, AppError> {
    let mut run = ScraperRun::begin(&config.name, ctx.clock.now());
    tracing::info!(source = %config.name, run_id = %run.id, "run started");
    ctx.runs.record_run(&run).await?;

    let fetched = fetch_records(ctx, config, &cancel).await;
    let mut novel_items = 0;

    match fetched {
        Ok(output) => {
            run.items_found = output.records.len() as i64;
            run.warnings.extend(output.warnings);
            run.logs
                .push(format!("adapter produced {} records", run.items_found));

            let today = ctx.today();
            let mut resolved = Vec::with_capacity(output.records.len());
            for raw in output.records {
                match resolver::resolve(raw, today) {
                    Ok(resolution) => {
                        run.warnings.extend(resolution.warnings);
                        resolved.push(resolution.record);
                    }
                    Err(skip) => run.warnings.push(skip.describe()),
                }
            }

            match ctx.licitaciones.upsert_batch(&resolved, today).await {
                Ok(stats) => {
                    run.items_saved = stats.inserted;
                    run.items_updated = stats.updated;
                    run.items_duplicated = stats.duplicated;
                    run.errors.extend(stats.errors);
                    run.logs.push(format!(
                        "saved {} new, merged {} existing, {} in-batch duplicates",
                        stats.inserted, stats.updated, stats.duplicated
                    ));
                    novel_items = stats.inserted;
                    ctx.query.invalidate_caches();
                }
                Err(e) => run.errors.push(format!("bulk write failed: {}", e)),
            }
            run.finish(ctx.clock.now());
        }
        Err(AppError::JobCancelled) => run.fail(ctx.clock.now(), "cancelled"),
        Err(AppError::JobTimeout) => run.fail(ctx.clock.now(), "timeout"),
        Err(e) => {
            run.errors.push(e.to_string());
            run.finish(ctx.clock.now());
        }
    }

    ctx.runs.update_run(&run).await?;
    ctx.runs.touch_last_run(&config.name, run.started_at).await?;
    tracing::info!(
        source = %config.name,
        run_id = %run.id,
        status = %run.status,
        found = run.items_found,
        saved = run.items_saved,
        updated = run.items_updated,
        "run finished"
    );
    Ok(RunOutcome { run, novel_items })
}

async fn fetch_records(
    ctx: &CoreContext,
    config: &ScraperConfig,
    cancel: &CancellationToken,
) -> Result<licita_client::AdapterOutput, AppError> {
    let adapter = ctx.registry.resolve(config)?;
    let adapter_ctx = AdapterContext {
        cancel: cancel.clone(),
        today: ctx.today(),
    };

    // The scheduler's hard cap: 1.5x the category timeout, then the run is
    // killed regardless of what the adapter is doing.
    tokio::select! {
        result = adapter.run(config, &ctx.http, &adapter_ctx) => result,
        _ = tokio::time::sleep(config.category.hard_timeout()) => Err(AppError::JobTimeout),
        _ = cancel.cancelled() => Err(AppError::JobCancelled),
    }
}
