use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// CLI configuration parsed from command line arguments and environment
/// variables.
#[derive(Parser, Debug)]
#[command(name = "licita")]
#[command(author, version, about = "Aggregator of Argentine public-tender portals")]
#[command(after_help = "Examples:
  licita serve
  licita harvest --source comprar-mza
  licita list --estado vigente --jurisdiccion Mendoza
  licita export --format jsonl > licitaciones.jsonl
  licita stats")]
pub struct Config {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Path to sources.toml (defaults to ~/.config/licita/sources.toml)
    #[arg(long, global = true)]
    pub sources: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler, health monitor, and enrichment until interrupted
    Serve,
    /// Run one or all sources immediately, outside the schedule
    #[command(after_help = "Examples:
  licita harvest --source comprar-mza
  licita harvest --all")]
    Harvest {
        /// Source name from sources.toml
        #[arg(short, long, conflicts_with = "all")]
        source: Option<String>,
        /// Harvest every enabled source
        #[arg(long)]
        all: bool,
    },
    /// List tenders with filters
    List {
        #[command(flatten)]
        filter: FilterArgs,
        /// Page number (1-based)
        #[arg(long, default_value = "1")]
        page: u32,
        /// Page size (max 100)
        #[arg(long, default_value = "15")]
        size: u32,
        /// Sort field: publication_date, opening_date, fecha_scraping, budget
        #[arg(long, default_value = "publication_date")]
        sort_by: String,
        /// Sort order: asc or desc
        #[arg(long, default_value = "desc")]
        sort_order: String,
        /// Print raw JSON instead of the table view
        #[arg(long)]
        json: bool,
    },
    /// Active tenders (vigente or prorrogada, opening today or later)
    Vigentes {
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "15")]
        size: u32,
    },
    /// Corpus and per-source statistics
    Stats,
    /// Run history
    Runs {
        /// Filter by scraper name
        #[arg(short, long)]
        scraper: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// Per-source health scores
    Health,
    /// Clear a source's auto-pause and put it back on the schedule
    Reactivate {
        /// Source name
        name: String,
    },
    /// Deduplicate one jurisdiction's corpus
    Dedup {
        #[arg(long)]
        jurisdiccion: String,
    },
    /// Recompute estado for the whole corpus
    RecomputeEstados,
    /// Manage favorites
    Favorites {
        #[command(subcommand)]
        action: FavoritesAction,
    },
    /// Set the workflow state of a tender
    Workflow {
        /// Licitación id
        id: String,
        /// descubierta, evaluando, preparando, presentada, descartada
        state: String,
    },
    /// Export tenders to various formats
    #[command(after_help = "Examples:
  licita export --format jsonl > licitaciones.jsonl
  licita export --format csv --fuente boletin-mza")]
    Export {
        /// Output format for exported data
        #[arg(short, long, default_value = "jsonl")]
        format: ExportFormat,
        #[command(flatten)]
        filter: FilterArgs,
        /// Maximum number of records to export
        #[arg(short, long, default_value = "10000")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum FavoritesAction {
    Add {
        #[arg(long, default_value = "default")]
        user: String,
        id: String,
    },
    Remove {
        #[arg(long, default_value = "default")]
        user: String,
        id: String,
    },
    List {
        #[arg(long, default_value = "default")]
        user: String,
    },
}

/// Listing filters shared by `list` and `export`.
#[derive(Args, Debug, Default)]
pub struct FilterArgs {
    /// Full-text query (smart search: years, fuentes, and rubros in the
    /// text become filters)
    #[arg(short, long)]
    pub q: Option<String>,
    #[arg(long)]
    pub fuente: Option<String>,
    /// Exclude these fuentes (repeatable)
    #[arg(long)]
    pub fuente_exclude: Vec<String>,
    /// vigente, vencida, prorrogada, archivada
    #[arg(long)]
    pub estado: Option<String>,
    #[arg(long)]
    pub category: Option<String>,
    /// descubierta, evaluando, preparando, presentada, descartada
    #[arg(long)]
    pub workflow: Option<String>,
    #[arg(long)]
    pub jurisdiccion: Option<String>,
    #[arg(long)]
    pub tipo_procedimiento: Option<String>,
    #[arg(long)]
    pub organization: Option<String>,
    #[arg(long)]
    pub nodo: Option<String>,
    #[arg(long)]
    pub budget_min: Option<String>,
    #[arg(long)]
    pub budget_max: Option<String>,
    /// Lower date bound (YYYY-MM-DD)
    #[arg(long)]
    pub desde: Option<String>,
    /// Upper date bound (YYYY-MM-DD)
    #[arg(long)]
    pub hasta: Option<String>,
    /// Which date the range applies to: publication_date, opening_date,
    /// fecha_scraping
    #[arg(long, default_value = "publication_date")]
    pub fecha_campo: String,
    #[arg(long)]
    pub year: Option<i32>,
    /// Only records first seen after this instant (RFC 3339)
    #[arg(long)]
    pub nuevas_desde: Option<String>,
    #[arg(long)]
    pub only_national: bool,
}

/// Supported export formats
#[derive(Debug, Clone, ValueEnum)]
pub enum ExportFormat {
    /// JSON Lines format (one JSON object per line)
    Jsonl,
    /// Standard JSON array format
    Json,
    /// CSV format (comma-separated values)
    Csv,
}
