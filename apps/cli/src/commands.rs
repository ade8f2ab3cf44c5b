//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use folio_core::{PoolObserver, ProgressReporter, RunSummary};
use folio_shared::{
    AppConfig, JobOutcome, JobRequest, JobResult, PoolStats, RunConfig, init_config, load_config,
    load_config_from,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// folio: fetch catalog items and assemble them into bundles.
#[derive(Parser)]
#[command(
    name = "folio",
    version,
    about = "Fetch paginated catalog items fragment by fragment and assemble one bundle per item.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

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
    /// Scan the listing and download every item.
    Run(RunArgs),

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Flags for `folio run`. Anything left unset comes from the config file.
#[derive(clap::Args, Debug, Default)]
pub(crate) struct RunArgs {
    /// Listing pages to scan.
    #[arg(long)]
    pub pages: Option<u32>,

    /// Worker pool size.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Simultaneous fragment fetches per item.
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Delay between fragment requests within an item, in milliseconds.
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// Skip items with more fragments than this (0 = no limit).
    #[arg(long)]
    pub max_fragments: Option<usize>,

    /// Ignore the listing cache and rescan.
    #[arg(long)]
    pub refresh: bool,

    /// Bundle output directory.
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Listing cache file.
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Config file to use instead of ~/.folio/folio.toml.
    #[arg(long, env = "FOLIO_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show {
        /// Config file to show instead of ~/.folio/folio.toml.
        #[arg(long, env = "FOLIO_CONFIG")]
        config: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "folio=info",
        1 => "folio=debug",
        _ => "folio=trace",
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
    match cli.command {
        Command::Run(args) => cmd_run(args).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show { config } => cmd_config_show(config.as_deref()).await,
        },
    }
}

/// The explicit config file when one is given, else the default location.
fn load_app_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

/// Config file values, then flag overrides.
fn resolve_run_config(config: &AppConfig, args: &RunArgs) -> RunConfig {
    let mut run = RunConfig::from(config);

    if let Some(pages) = args.pages {
        run.pages = pages;
    }
    if let Some(workers) = args.workers {
        run.workers = workers;
    }
    if let Some(concurrency) = args.concurrency {
        run.concurrency = concurrency;
    }
    if let Some(delay_ms) = args.delay_ms {
        run.request_delay = Duration::from_millis(delay_ms);
    }
    if let Some(max_fragments) = args.max_fragments {
        run.max_fragments = max_fragments;
    }
    if let Some(out) = &args.out {
        run.output_dir = out.clone();
    }
    if let Some(cache) = &args.cache {
        run.cache_path = cache.clone();
    }
    run.refresh = args.refresh;

    run
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let config = load_app_config(args.config.as_deref())?;
    let run_config = resolve_run_config(&config, &args);

    info!(
        pages = run_config.pages,
        workers = run_config.workers,
        concurrency = run_config.concurrency,
        output = %run_config.output_dir.display(),
        "starting run"
    );

    let reporter = Arc::new(CliProgress::new());
    let summary = folio_core::run(&run_config, reporter).await?;
    let stats = summary.stats;

    println!();
    println!("  Run complete.");
    println!("  Run ID:    {}", summary.run_id);
    println!(
        "  Items:     {}{}",
        summary.items,
        if summary.from_cache { " (cached listing)" } else { "" }
    );
    println!("  Succeeded: {}", stats.succeeded);
    println!("  Failed:    {}", stats.failed);
    println!("  Skipped:   {}", stats.skipped);
    println!("  Output:    {}", summary.output_dir.display());
    println!("  Time:      {:.1}s", summary.elapsed.as_secs_f64());
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter: one bar counting finished items.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .expect("valid progress template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }
}

impl PoolObserver for CliProgress {
    fn job_started(&self, request: &JobRequest, slot: usize) {
        self.bar.set_message(format!("[w{slot}] {}", request.title));
    }

    fn job_progress(&self, _id: &str, title: &str, completed: usize, total: usize) {
        self.bar.set_message(format!("{title} [{completed}/{total}]"));
    }

    fn job_finished(&self, result: &JobResult, _stats: &PoolStats) {
        self.bar.inc(1);
        match result.outcome {
            JobOutcome::Success if result.failed_fragments > 0 => self.bar.println(format!(
                "  ~ {} ({} of {} fragments missing)",
                result.title, result.failed_fragments, result.total_fragments
            )),
            JobOutcome::Success => self.bar.println(format!("  ✓ {}", result.title)),
            JobOutcome::Skipped => self.bar.println(format!(
                "  - {} skipped: {}",
                result.title,
                result.error.as_deref().unwrap_or("")
            )),
            JobOutcome::Failure => self.bar.println(format!(
                "  ✗ {}: {}",
                result.title,
                result.error.as_deref().unwrap_or("unknown error")
            )),
        }
    }

    fn worker_respawned(&self, slot: usize, generation: u64) {
        self.bar
            .println(format!("  ! worker {slot} restarted (generation {generation})"));
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn items_found(&self, count: usize) {
        self.bar.set_length(count as u64);
        self.bar.set_position(0);
        self.bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .expect("valid progress template")
                .progress_chars("=> "),
        );
    }

    fn done(&self, _summary: &RunSummary) {
        self.bar.finish_and_clear();
    }
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    println!("{}", render_config(path)?);
    Ok(())
}

fn render_config(path: Option<&Path>) -> Result<String> {
    let config = load_app_config(path)?;
    toml::to_string_pretty(&config).map_err(|e| eyre!("failed to render config: {e}"))
}
