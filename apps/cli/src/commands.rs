//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use imgdesc_core::{Pipeline, PipelineRun, ProgressReporter, RunState};
use imgdesc_fetcher::Fetcher;
use imgdesc_inference::{InferenceClient, OpenRouterBackend};
use imgdesc_shared::{
    AppConfig, FetchConfig, FetchResult, InferenceConfig, InferenceResult, StorageConfig,
    WorklistConfig, init_config, load_config, load_config_from, resolve_api_key,
};
use imgdesc_storage::{MemoryStore, Storage, TableStore};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// imgdesc: describe batches of remote images with a multimodal model.
#[derive(Parser)]
#[command(
    name = "imgdesc",
    version,
    about = "Fetch a range of images, describe them with a multimodal model, and store the results.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.imgdesc/imgdesc.toml).
    #[arg(long, global = true, env = "IMGDESC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Fetch, describe and store one range of images.
    Run(RunArgs),

    /// Print the stored descriptions.
    Show {
        /// Maximum number of rows to print.
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Database path (overrides config).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// List recent runs.
    Runs {
        /// Maximum number of runs to print.
        #[arg(short, long, default_value = "10")]
        limit: u32,

        /// Database path (overrides config).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Overrides for a single run. Unset flags fall back to the config file.
#[derive(clap::Args)]
pub(crate) struct RunArgs {
    /// First image id (inclusive).
    #[arg(long)]
    start: Option<i64>,

    /// Last image id (inclusive).
    #[arg(long)]
    end: Option<i64>,

    /// URL template with one `{id}` placeholder.
    #[arg(long)]
    template: Option<String>,

    /// Maximum concurrent downloads.
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Maximum concurrent model calls.
    #[arg(long)]
    inference_concurrency: Option<usize>,

    /// Model id (overrides config).
    #[arg(long)]
    model: Option<String>,

    /// Database path (overrides config).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Keep results in memory instead of writing the database.
    #[arg(long)]
    dry_run: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(start) = self.start {
            config.worklist.start = start;
        }
        if let Some(end) = self.end {
            config.worklist.end = end;
        }
        if let Some(template) = &self.template {
            config.worklist.url_template = template.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.fetch.concurrency = concurrency;
        }
        if let Some(concurrency) = self.inference_concurrency {
            config.inference.concurrency = concurrency;
        }
        if let Some(model) = &self.model {
            config.inference.model = model.clone();
        }
        if let Some(db) = &self.db {
            config.storage.db_path = db.to_string_lossy().to_string();
        }
    }
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "imgdesc=info",
        1 => "imgdesc=debug",
        _ => "imgdesc=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::Run(args) => cmd_run(config, &args).await,
        Command::Show { limit, db } => cmd_show(&config, db, limit).await,
        Command::Runs { limit, db } => cmd_runs(&config, db, limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(mut config: AppConfig, args: &RunArgs) -> Result<()> {
    args.apply(&mut config);

    // Validate API key before doing anything
    let api_key = resolve_api_key(&config)?;

    let worklist = WorklistConfig::from(&config);
    let fetch_config = FetchConfig::from(&config);
    let inference_config = InferenceConfig::from(&config);
    let storage_config = StorageConfig::from_app(&config)?;

    let fetcher = Fetcher::new(fetch_config)?;
    let backend = Arc::new(OpenRouterBackend::new(
        config.inference.base_url.clone(),
        api_key,
        inference_config.timeout,
    )?);

    let store: Arc<dyn TableStore>;
    let inference;
    if args.dry_run {
        info!("dry run: results are kept in memory");
        store = Arc::new(MemoryStore::new());
        inference = InferenceClient::new(inference_config, backend);
    } else {
        let storage = Arc::new(Storage::open(&storage_config.db_path).await?);
        inference = InferenceClient::with_cache(inference_config, backend, storage.clone());
        store = storage;
    }

    info!(
        start = worklist.start,
        end = worklist.end,
        template = %worklist.url_template,
        model = %config.inference.model,
        db = %storage_config.db_path.display(),
        "starting run"
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping dispatch");
            ctrl_c.cancel();
        }
    });

    let pipeline = Pipeline::new(worklist, fetcher, inference, store, storage_config.tables);
    let reporter = CliProgress::new();
    let run = pipeline.run(&reporter, &cancel).await;

    print_run(&run);

    match (run.state, run.error) {
        (RunState::Committed, _) => Ok(()),
        (_, Some(e)) => Err(e).wrap_err_with(|| format!("run {} failed", run.id)),
        (state, None) => Err(eyre!("run {} ended in {state}", run.id)),
    }
}

fn print_run(run: &PipelineRun) {
    println!();
    match run.state {
        RunState::Committed => println!("  Run committed."),
        _ => println!("  Run failed."),
    }
    println!("  ID:         {}", run.id);
    println!("  Requested:  {}", run.requested);
    println!(
        "  Fetched:    {} ok, {} timeout, {} http error, {} network error, {} cancelled",
        run.fetch.ok, run.fetch.timeout, run.fetch.http_error, run.fetch.network_error, run.fetch.cancelled
    );
    println!(
        "  Described:  {} ok, {} skipped, {} model error, {} rate limited, {} cancelled",
        run.inference.ok,
        run.inference.skipped_no_content,
        run.inference.model_error,
        run.inference.rate_limited,
        run.inference.cancelled
    );
    println!("  Calls:      {} ({} cached)", run.backend_calls, run.cache_hits);
    println!(
        "  Time:       {:.1}s",
        run.elapsed().num_milliseconds() as f64 / 1000.0
    );
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, state: RunState) {
        let message = match state {
            RunState::Generating => "Generating worklist",
            RunState::Fetching => "Fetching images",
            RunState::Inferring => "Describing images",
            RunState::Reconciling => "Committing results",
            RunState::Committed | RunState::Failed => return,
        };
        self.bar.set_position(0);
        self.bar.set_message(message);
    }

    fn item_fetched(&self, result: &FetchResult, current: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(current as u64);
        self.bar.set_message(format!("Fetching {} ({})", result.url(), result.status()));
    }

    fn item_described(&self, result: &InferenceResult, current: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(current as u64);
        self.bar.set_message(format!("Describing #{} ({})", result.id(), result.status()));
    }

    fn done(&self, _run: &PipelineRun) {
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// show / runs
// ---------------------------------------------------------------------------

async fn open_readonly(config: &AppConfig, db: Option<PathBuf>) -> Result<(Storage, StorageConfig)> {
    let mut storage_config = StorageConfig::from_app(config)?;
    if let Some(db) = db {
        storage_config.db_path = db;
    }
    let storage = Storage::open_readonly(&storage_config.db_path).await?;
    Ok((storage, storage_config))
}

async fn cmd_show(config: &AppConfig, db: Option<PathBuf>, limit: usize) -> Result<()> {
    let (storage, storage_config) = open_readonly(config, db).await?;
    let rows = storage.read_descriptions(&storage_config.tables.descriptions).await?;

    if rows.is_empty() {
        println!("No descriptions stored yet.");
        return Ok(());
    }

    for row in rows.iter().take(limit) {
        let description = row.description.as_deref().unwrap_or("-");
        println!("{:>6}  {:<20}  {description}", row.id, row.status);
    }
    if rows.len() > limit {
        println!("... {} more", rows.len() - limit);
    }
    Ok(())
}

async fn cmd_runs(config: &AppConfig, db: Option<PathBuf>, limit: u32) -> Result<()> {
    let (storage, _) = open_readonly(config, db).await?;
    let runs = storage.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    for run in runs {
        println!("{}  {:<9}  {}  {}", run.id, run.state, run.started_at, run.stats_json);
        if let Some(error) = run.error {
            println!("    error: {error}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_override_config() {
        let cli = Cli::try_parse_from([
            "imgdesc",
            "run",
            "--start",
            "5",
            "--end",
            "9",
            "--template",
            "https://x/{id}.png",
            "--concurrency",
            "3",
            "--inference-concurrency",
            "1",
            "--dry-run",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.dry_run);

        let mut config = AppConfig::default();
        args.apply(&mut config);
        assert_eq!(config.worklist.start, 5);
        assert_eq!(config.worklist.end, 9);
        assert_eq!(config.worklist.url_template, "https://x/{id}.png");
        assert_eq!(config.fetch.concurrency, 3);
        assert_eq!(config.inference.concurrency, 1);
    }

    #[test]
    fn unset_flags_keep_config_values() {
        let cli = Cli::try_parse_from(["imgdesc", "run"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };

        let mut config = AppConfig::default();
        let before = config.clone();
        args.apply(&mut config);
        assert_eq!(config.worklist.end, before.worklist.end);
        assert_eq!(config.storage.db_path, before.storage.db_path);
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["imgdesc", "runs", "--limit", "3", "-vv", "--log-format", "json"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.log_format, LogFormat::Json));
        assert!(matches!(cli.command, Command::Runs { limit: 3, .. }));
    }
}
