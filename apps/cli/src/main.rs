//! modelfetch CLI - catalog search and bulk model downloads
//!
//! A thin shell over `modelfetch-core`: it parses arguments, installs
//! logging, and renders progress for the jobs it starts.

mod commands;
mod output;
mod progress;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modelfetch_core::CoreConfig;
use modelfetch_types::BatchStrategy;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// modelfetch - search the model catalog and download files
#[derive(Parser)]
#[command(name = "modelfetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, env = "MODELFETCH_CONFIG")]
    config: Option<PathBuf>,

    /// Catalog API base URL
    #[arg(long, env = "MODELFETCH_BASE_URL")]
    base_url: Option<String>,

    /// Catalog API key
    #[arg(long, env = "MODELFETCH_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Directory downloads are written to
    #[arg(short, long, env = "MODELFETCH_DOWNLOAD_DIR")]
    download_dir: Option<PathBuf>,

    /// SQLite file recording finished downloads
    #[arg(long, env = "MODELFETCH_HISTORY_DB")]
    history_db: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum StrategyArg {
    Sequential,
    Parallel,
    Adaptive,
}

impl From<StrategyArg> for BatchStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Sequential => BatchStrategy::Sequential,
            StrategyArg::Parallel => BatchStrategy::Parallel,
            StrategyArg::Adaptive => BatchStrategy::Adaptive,
        }
    }
}

/// Options shared by every command that runs a bulk job
#[derive(clap::Args, Debug, Clone)]
pub struct JobArgs {
    /// Maximum number of files downloading at once
    #[arg(short = 'c', long)]
    max_concurrent: usize,

    /// Dispatch strategy
    #[arg(short, long, default_value = "parallel")]
    strategy: StrategyArg,

    /// Cancel the remaining files after the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Skip files already recorded in the download history
    #[arg(long)]
    skip_downloaded: bool,

    /// Starting concurrency for the adaptive strategy
    #[arg(long, default_value_t = 1)]
    baseline: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the catalog
    Search {
        /// Free text query
        query: Option<String>,

        /// Filter by model type
        #[arg(short = 't', long = "type")]
        types: Vec<String>,

        /// Sort order understood by the catalog
        #[arg(long)]
        sort: Option<String>,

        /// Page size
        #[arg(short, long)]
        limit: Option<u32>,

        /// Follow cursors and print up to this many results
        #[arg(long)]
        max_results: Option<usize>,
    },

    /// Show a model and its files
    Model {
        /// Model ID
        id: u64,
    },

    /// Download the files of a model version
    Fetch {
        /// Model ID
        model_id: u64,

        /// Version ID; the newest version when omitted
        #[arg(long)]
        version: Option<u64>,

        /// Only the primary file of the version
        #[arg(long)]
        primary_only: bool,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Download every file listed in a JSON manifest
    Manifest {
        /// Path to a JSON array of file descriptors
        file: PathBuf,

        /// Job name
        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Config file first, then flags and environment on top
fn load_config(cli: &Cli) -> Result<CoreConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => CoreConfig::default(),
    };

    if let Some(base_url) = &cli.base_url {
        config.api.base_url = base_url.clone();
    }
    if let Some(api_key) = &cli.api_key {
        config.api.api_key = Some(api_key.clone());
    }
    if let Some(dir) = &cli.download_dir {
        config.engine.download_dir = dir.clone();
    }
    if let Some(db) = &cli.history_db {
        config.history_db = Some(db.clone());
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "modelfetch", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let core = modelfetch_core::FetchCore::new(config).await?;

    match cli.command {
        Commands::Search {
            query,
            types,
            sort,
            limit,
            max_results,
        } => {
            let params = modelfetch_types::SearchParams {
                query,
                types,
                sort,
                limit,
                ..Default::default()
            };
            commands::search(&core, params, max_results, cli.output).await?
        }

        Commands::Model { id } => commands::show_model(&core, id, cli.output).await?,

        Commands::Fetch {
            model_id,
            version,
            primary_only,
            job,
        } => commands::fetch_model(&core, model_id, version, primary_only, job, cli.output).await?,

        Commands::Manifest { file, name, job } => {
            commands::run_manifest(&core, file, name, job, cli.output).await?
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}
