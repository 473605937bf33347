use anyhow::Context as _;
use chrono::NaiveDate;
use clap::Parser;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use licita_cli::{Command, Config, ExportFormat};
use licita_client::{AdapterRegistry, FetchClient, HttpSettings};
use licita_core::models::{Estado, Licitacion, WorkflowState};
use licita_core::query::{ListFilter, Pagination, Sort, SortField, SortOrder};
use licita_core::{load_sources_config, EnvSettings, FechaCampo};
use licita_db::{
    FavoriteRepository, LicitacionRepository, QueryEngine, RunRepository,
};
use licita_engine::{
    CoreContext, EnrichmentJob, HealthMonitor, LogSink, Scheduler, SystemClock,
};

use licita_cli::config::{FavoritesAction, FilterArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let ctx = build_context(&config).await?;

    match &config.command {
        Command::Serve => serve(&config, ctx).await?,
        Command::Harvest { source, all } => {
            harvest(&config, ctx, source.as_deref(), *all).await?
        }
        Command::List {
            filter,
            page,
            size,
            sort_by,
            sort_order,
            json,
        } => {
            let filter = build_filter(filter)?;
            let sort = build_sort(sort_by, sort_order)?;
            list(ctx, filter, sort, Pagination::new(*page, *size), *json).await?
        }
        Command::Vigentes { page, size } => {
            vigentes(ctx, Pagination::new(*page, *size)).await?
        }
        Command::Stats => stats(ctx).await?,
        Command::Runs { scraper, limit } => runs(ctx, scraper.as_deref(), *limit).await?,
        Command::Health => health(ctx).await?,
        Command::Reactivate { name } => reactivate(ctx, name).await?,
        Command::Dedup { jurisdiccion } => dedup(ctx, jurisdiccion).await?,
        Command::RecomputeEstados => recompute_estados(ctx).await?,
        Command::Favorites { action } => favorites(ctx, action).await?,
        Command::Workflow { id, state } => workflow(ctx, id, state).await?,
        Command::Export {
            format,
            filter,
            limit,
        } => {
            let filter = build_filter(filter)?;
            export(ctx, format, filter, *limit).await?
        }
    }

    Ok(())
}

async fn build_context(config: &Config) -> anyhow::Result<Arc<CoreContext>> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    licita_db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let settings = EnvSettings::from_env();
    let http = FetchClient::new(HttpSettings {
        rate_limit_per_host: std::time::Duration::from_millis(
            settings.http_rate_limit_ms_per_host,
        ),
        circuit_fail_threshold: settings.http_circuit_fail_threshold,
        circuit_cooldown: std::time::Duration::from_secs(
            settings.http_circuit_cooldown_min * 60,
        ),
        ..Default::default()
    })
    .context("Failed to build HTTP client")?;

    let licitaciones = LicitacionRepository::new(pool.clone());
    Ok(Arc::new(CoreContext {
        query: Arc::new(QueryEngine::new(licitaciones.clone())),
        licitaciones,
        runs: RunRepository::new(pool.clone()),
        favorites: FavoriteRepository::new(pool),
        http,
        registry: Arc::new(AdapterRegistry::with_builtins()),
        settings,
        clock: Arc::new(SystemClock),
        notifier: Arc::new(LogSink),
    }))
}

async fn sync_sources(config: &Config, ctx: &CoreContext) -> anyhow::Result<()> {
    if let Some(sources) = load_sources_config(config.sources.clone())? {
        ctx.runs.sync_sources(&sources.sources).await?;
        info!("Synced {} sources from configuration", sources.sources.len());
    }
    Ok(())
}

async fn serve(config: &Config, ctx: Arc<CoreContext>) -> anyhow::Result<()> {
    sync_sources(config, &ctx).await?;

    let scheduler = Scheduler::new(Arc::clone(&ctx));
    let jobs = scheduler.start().await?;
    info!("Scheduling {} sources", jobs);

    let shutdown = CancellationToken::new();
    let monitor = HealthMonitor::new(Arc::clone(&ctx), Arc::clone(&scheduler));
    tokio::spawn(monitor.run_loop(shutdown.child_token()));
    let enrichment = EnrichmentJob::new(Arc::clone(&ctx));
    tokio::spawn(enrichment.run_loop(shutdown.child_token()));

    info!("Serving. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    shutdown.cancel();
    scheduler.stop();
    Ok(())
}

async fn harvest(
    config: &Config,
    ctx: Arc<CoreContext>,
    source: Option<&str>,
    all: bool,
) -> anyhow::Result<()> {
    sync_sources(config, &ctx).await?;

    let configs = if all {
        ctx.runs.list_configs(true).await?
    } else {
        let name = source.context("Pass --source <name> or --all")?;
        vec![ctx.runs.get_config(name).await?]
    };
    anyhow::ensure!(!configs.is_empty(), "No active sources to harvest");

    for scraper in &configs {
        let outcome =
            licita_engine::execute_run(&ctx, scraper, CancellationToken::new()).await?;
        let run = outcome.run;
        println!(
            "{:<20} {:<8} found {:>4}  new {:>4}  merged {:>4}  warnings {:>3}",
            run.scraper_name,
            run.status.to_string(),
            run.items_found,
            run.items_saved,
            run.items_updated,
            run.warnings.len()
        );
        for error in &run.errors {
            eprintln!("   error: {}", error);
        }
    }
    Ok(())
}

async fn list(
    ctx: Arc<CoreContext>,
    filter: ListFilter,
    sort: Sort,
    pagination: Pagination,
    json: bool,
) -> anyhow::Result<()> {
    let (page, smart) = ctx.query.search(filter, sort, pagination).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    if !smart.auto_filters.is_empty() {
        let detected: Vec<String> = smart
            .auto_filters
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!("Detected filters: {}\n", detected.join(", "));
    }

    if page.items.is_empty() {
        println!("No results (page {} of {} total records).", page.page, page.total);
        return Ok(());
    }

    println!(
        "Page {} · {} of {} records\n",
        page.page,
        page.items.len(),
        page.total
    );
    for (i, item) in page.items.iter().enumerate() {
        print_row(pagination.offset() as usize + i + 1, item);
    }
    Ok(())
}

async fn vigentes(ctx: Arc<CoreContext>, pagination: Pagination) -> anyhow::Result<()> {
    let page = ctx.query.vigentes(ctx.today(), pagination).await?;
    println!("{} tenders still open\n", page.total);
    for (i, item) in page.items.iter().enumerate() {
        print_row(pagination.offset() as usize + i + 1, item);
    }
    Ok(())
}

fn print_row(index: usize, item: &Licitacion) {
    println!(
        "{:>3}. [{:<10}] {}",
        index,
        item.estado.to_string(),
        truncate_text(&item.title, 90)
    );
    println!(
        "     {} · {} · publicada {} · apertura {}",
        item.fuente,
        truncate_text(&item.organization, 40),
        fmt_date(item.publication_date),
        fmt_date(item.opening_date)
    );
    if let Some(url) = &item.canonical_url {
        println!("     {}", url);
    }
    println!();
}

async fn stats(ctx: Arc<CoreContext>) -> anyhow::Result<()> {
    let stats = ctx.query.stats().await?;
    let distribution = ctx.query.estado_distribution(ctx.today()).await?;

    println!("\nCorpus\n");
    println!("  Total licitaciones:    {}", stats.total);
    println!("  Abiertas hoy:          {}", distribution.vigentes_hoy);
    if let Some(last_update) = stats.last_update {
        println!("  Last update:           {}", last_update);
    }
    println!("\nPor estado:");
    for (estado, count) in &distribution.by_estado {
        println!("  {:<12} {:>6}", estado, count);
    }
    println!("\nPor año de publicación:");
    for (year, count) in &distribution.by_year {
        println!("  {:<12} {:>6}", year, count);
    }
    println!("\nPor fuente:");
    for (fuente, count) in &stats.by_fuente {
        println!("  {:<24} {:>6}", fuente, count);
    }
    println!();
    Ok(())
}

async fn runs(
    ctx: Arc<CoreContext>,
    scraper: Option<&str>,
    limit: i64,
) -> anyhow::Result<()> {
    let runs = ctx.runs.list_runs(scraper, limit).await?;
    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<20} {:<8} found {:>4}  new {:>4}  merged {:>4}  {}s",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.scraper_name,
            run.status.to_string(),
            run.items_found,
            run.items_saved,
            run.items_updated,
            run.duration_seconds.map(|d| d.round() as i64).unwrap_or(0),
        );
        for warning in run.warnings.iter().take(3) {
            println!("    warning: {}", warning);
        }
        for error in &run.errors {
            println!("    error: {}", error);
        }
    }
    Ok(())
}

async fn health(ctx: Arc<CoreContext>) -> anyhow::Result<()> {
    let scheduler = Scheduler::new(Arc::clone(&ctx));
    let monitor = HealthMonitor::new(Arc::clone(&ctx), scheduler);
    let report = monitor.sweep().await?;

    println!("\n{:<20} {:>6} {:>9} {:>7}  estado", "fuente", "score", "éxito", "racha");
    for source in report {
        println!(
            "{:<20} {:>6} {:>8.0}% {:>7}  {}",
            source.name,
            source.score,
            source.success_rate * 100.0,
            source.consecutive_failures,
            if source.active {
                "activa".to_string()
            } else {
                format!("pausada ({})", source.paused_reason.as_deref().unwrap_or("-"))
            }
        );
    }
    println!();
    Ok(())
}

async fn reactivate(ctx: Arc<CoreContext>, name: &str) -> anyhow::Result<()> {
    let scheduler = Scheduler::new(Arc::clone(&ctx));
    let monitor = HealthMonitor::new(Arc::clone(&ctx), scheduler);
    monitor.reactivate(name).await?;
    println!("Source '{}' reactivated.", name);
    Ok(())
}

async fn dedup(ctx: Arc<CoreContext>, jurisdiccion: &str) -> anyhow::Result<()> {
    let absorbed = ctx
        .licitaciones
        .dedup_sweep(jurisdiccion, ctx.today())
        .await?;
    ctx.query.invalidate_caches();
    println!("Absorbed {} duplicate records in {}.", absorbed, jurisdiccion);
    Ok(())
}

async fn recompute_estados(ctx: Arc<CoreContext>) -> anyhow::Result<()> {
    let changed = ctx.licitaciones.recompute_estados(ctx.today()).await?;
    ctx.query.invalidate_caches();
    println!("Estado recomputed; {} records changed.", changed);
    Ok(())
}

async fn favorites(ctx: Arc<CoreContext>, action: &FavoritesAction) -> anyhow::Result<()> {
    match action {
        FavoritesAction::Add { user, id } => {
            let id = parse_uuid(id)?;
            let added = ctx.favorites.add(user, id).await?;
            println!("{}", if added { "Added." } else { "Already a favorite." });
        }
        FavoritesAction::Remove { user, id } => {
            let id = parse_uuid(id)?;
            let removed = ctx.favorites.remove(user, id).await?;
            println!("{}", if removed { "Removed." } else { "Was not a favorite." });
        }
        FavoritesAction::List { user } => {
            let records = ctx.favorites.list_records(user).await?;
            if records.is_empty() {
                println!("No favorites yet.");
            }
            for (i, record) in records.iter().enumerate() {
                print_row(i + 1, record);
            }
        }
    }
    Ok(())
}

async fn workflow(ctx: Arc<CoreContext>, id: &str, state: &str) -> anyhow::Result<()> {
    let id = parse_uuid(id)?;
    let state = WorkflowState::parse(state)
        .with_context(|| format!("unknown workflow state '{}'", state))?;
    let updated = ctx.licitaciones.set_workflow_state(id, state).await?;
    anyhow::ensure!(updated, "No licitación with id {}", id);
    println!("Workflow state set to {}.", state);
    Ok(())
}

async fn export(
    ctx: Arc<CoreContext>,
    format: &ExportFormat,
    filter: ListFilter,
    limit: usize,
) -> anyhow::Result<()> {
    let mut records: Vec<Licitacion> = Vec::new();
    let mut page_number = 1;
    loop {
        let page = ctx
            .query
            .list_page(&filter, Sort::default(), Pagination::new(page_number, 100))
            .await?;
        let fetched = page.items.len();
        records.extend(page.items);
        if records.len() >= limit || fetched < 100 {
            break;
        }
        page_number += 1;
    }
    records.truncate(limit);

    if records.is_empty() {
        eprintln!("No records found to export.");
        return Ok(());
    }
    info!("Exporting {} records", records.len());

    match format {
        ExportFormat::Jsonl => {
            for record in &records {
                println!("{}", serde_json::to_string(&create_export_record(record))?);
            }
        }
        ExportFormat::Json => {
            let all: Vec<_> = records.iter().map(create_export_record).collect();
            println!("{}", serde_json::to_string_pretty(&all)?);
        }
        ExportFormat::Csv => {
            println!(
                "id,title,organization,fuente,jurisdiccion,estado,publication_date,opening_date,budget,canonical_url"
            );
            for record in &records {
                println!(
                    "{},{},{},{},{},{},{},{},{},{}",
                    record.id,
                    escape_csv(&record.title),
                    escape_csv(&record.organization),
                    escape_csv(&record.fuente),
                    escape_csv(&record.jurisdiccion),
                    record.estado,
                    fmt_date(record.publication_date),
                    fmt_date(record.opening_date),
                    record
                        .budget
                        .map(|b| b.to_string())
                        .unwrap_or_default(),
                    record
                        .canonical_url
                        .as_deref()
                        .map(escape_csv)
                        .unwrap_or_default(),
                );
            }
        }
    }
    Ok(())
}

fn create_export_record(record: &Licitacion) -> serde_json::Value {
    serde_json::json!({
        "id": record.id,
        "title": record.title,
        "organization": record.organization,
        "fuente": record.fuente,
        "jurisdiccion": record.jurisdiccion,
        "category": record.category,
        "estado": record.estado,
        "publication_date": record.publication_date,
        "opening_date": record.opening_date,
        "fecha_prorroga": record.fecha_prorroga,
        "budget": record.budget,
        "currency": record.currency,
        "expedient_number": record.expedient_number,
        "canonical_url": record.canonical_url,
        "source_urls": record.source_urls,
        "first_seen_at": record.first_seen_at,
        "updated_at": record.updated_at,
    })
}

fn build_filter(args: &FilterArgs) -> anyhow::Result<ListFilter> {
    let estado = args
        .estado
        .as_deref()
        .map(|s| Estado::parse(s).with_context(|| format!("unknown estado '{}'", s)))
        .transpose()?;
    let workflow_state = args
        .workflow
        .as_deref()
        .map(|s| {
            WorkflowState::parse(s).with_context(|| format!("unknown workflow state '{}'", s))
        })
        .transpose()?;
    let fecha_campo = FechaCampo::parse(&args.fecha_campo)
        .with_context(|| format!("unknown fecha_campo '{}'", args.fecha_campo))?;

    Ok(ListFilter {
        q: args.q.clone(),
        fuente: args.fuente.clone(),
        fuente_exclude: args.fuente_exclude.clone(),
        estado,
        category: args.category.clone(),
        workflow_state,
        jurisdiccion: args.jurisdiccion.clone(),
        tipo_procedimiento: args.tipo_procedimiento.clone(),
        organization: args.organization.clone(),
        nodo: args.nodo.clone(),
        budget_min: parse_decimal(args.budget_min.as_deref())?,
        budget_max: parse_decimal(args.budget_max.as_deref())?,
        fecha_desde: parse_date_arg(args.desde.as_deref())?,
        fecha_hasta: parse_date_arg(args.hasta.as_deref())?,
        fecha_campo,
        year: args.year,
        nuevas_desde: args
            .nuevas_desde
            .as_deref()
            .map(|s| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .with_context(|| format!("invalid timestamp '{}'", s))
            })
            .transpose()?,
        only_national: args.only_national,
    })
}

fn build_sort(sort_by: &str, sort_order: &str) -> anyhow::Result<Sort> {
    let field = SortField::parse(sort_by)
        .with_context(|| format!("unknown sort field '{}'", sort_by))?;
    let order = SortOrder::parse(sort_order)
        .with_context(|| format!("unknown sort order '{}'", sort_order))?;
    Ok(Sort { field, order })
}

fn parse_decimal(value: Option<&str>) -> anyhow::Result<Option<rust_decimal::Decimal>> {
    value
        .map(|s| {
            rust_decimal::Decimal::from_str(s).with_context(|| format!("invalid amount '{}'", s))
        })
        .transpose()
}

fn parse_date_arg(value: Option<&str>) -> anyhow::Result<Option<NaiveDate>> {
    value
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))
        })
        .transpose()
}

fn parse_uuid(value: &str) -> anyhow::Result<Uuid> {
    Uuid::from_str(value).with_context(|| format!("invalid id '{}'", value))
}

fn fmt_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format("%d/%m/%Y").to_string())
        .unwrap_or_else(|| "—".to_string())
}

fn truncate_text(text: &str, max_len: usize) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() <= max_len {
        cleaned
    } else {
        let cut: String = cleaned.chars().take(max_len).collect();
        format!("{}...", cut)
    }
}

fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
