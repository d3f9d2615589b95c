//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{ArgGroup, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use lienflow_core::{
    Collaborators, JsonLinesSeedSource, Orchestrator, ProgressCounters, RunSummary, SeedSource,
    StoredSeedSource, WriteQueue, recovery, shutdown,
};
use lienflow_shared::{
    AppConfig, DateRange, PipelineStatus, expand_home, init_config, load_config, load_config_from,
};
use lienflow_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// lienflow: enrichment and title analysis for foreclosure auctions.
#[derive(Parser)]
#[command(
    name = "lienflow",
    version,
    about = "Enrich foreclosure auction properties and analyze their title chains.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.lienflow/lienflow.toml).
    #[arg(long, global = true, env = "LIENFLOW_CONFIG")]
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
    /// Process every property auctioned in a date window.
    #[command(group(ArgGroup::new("input").required(true).args(["seeds", "resume"])))]
    Run {
        /// First auction date (YYYY-MM-DD).
        #[arg(long)]
        from: NaiveDate,

        /// Last auction date, inclusive (YYYY-MM-DD).
        #[arg(long)]
        to: NaiveDate,

        /// Auction export, one JSON entity per line.
        #[arg(long)]
        seeds: Option<PathBuf>,

        /// Resume pending and interrupted entities from the database.
        #[arg(long)]
        resume: bool,

        /// Override `orchestrator.global_concurrency`.
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },

    /// Show pipeline status counts and failed entities.
    Status {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Reset entities stuck after exhausting retries on non-critical steps.
    Recover {
        #[command(subcommand)]
        action: RecoverAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Recovery subcommands.
#[derive(Subcommand)]
pub(crate) enum RecoverAction {
    /// List the rows a recovery would reset.
    Audit,
    /// Reset the audited rows, then verify them.
    Apply {
        /// Apply without a dry run.
        #[arg(long)]
        yes: bool,
    },
    /// Show the current status of specific entities.
    Verify {
        /// Case numbers to check.
        #[arg(required = true)]
        case: Vec<String>,
    },
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
        0 => "lienflow=info",
        1 => "lienflow=debug",
        _ => "lienflow=trace",
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
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            from,
            to,
            seeds,
            resume,
            concurrency,
        } => {
            let mut config = resolve_config(config_path)?;
            if let Some(n) = concurrency {
                config.orchestrator.global_concurrency = n;
            }
            let range = DateRange::new(from, to)?;
            cmd_run(&config, range, seeds.as_deref(), resume).await
        }
        Command::Status { json } => cmd_status(&resolve_config(config_path)?, json).await,
        Command::Recover { action } => {
            let config = resolve_config(config_path)?;
            match action {
                RecoverAction::Audit => cmd_recover_audit(&config).await,
                RecoverAction::Apply { yes } => cmd_recover_apply(&config, yes).await,
                RecoverAction::Verify { case } => cmd_recover_verify(&config, &case).await,
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&resolve_config(config_path)?).await,
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    Ok(config)
}

fn db_path(config: &AppConfig) -> Result<PathBuf> {
    Ok(expand_home(&config.storage.db_path)?)
}

/// Open the database read-only for reporting commands.
async fn open_reader(config: &AppConfig) -> Result<Storage> {
    let path = db_path(config)?;
    if !path.exists() {
        return Err(eyre!(
            "no database at '{}'; run `lienflow run` first",
            path.display()
        ));
    }
    Ok(Storage::open_readonly(&path).await?)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: &AppConfig,
    range: DateRange,
    seeds: Option<&Path>,
    resume: bool,
) -> Result<()> {
    config.validate()?;
    let (enrichment, legal) = lienflow_sources::services_from_config(config)?;

    let storage = Arc::new(Storage::open(&db_path(config)?).await?);
    let (queue, writer) = WriteQueue::spawn(storage.clone(), &config.write_queue)?;

    let (trigger, signal) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight entities");
            trigger.trigger();
        }
    });

    let orchestrator = Orchestrator::new(
        config,
        Collaborators {
            enrichment,
            legal,
            gate: None,
        },
        queue,
        signal,
    )?;

    let source: Box<dyn SeedSource> = match (seeds, resume) {
        (Some(path), _) => Box::new(JsonLinesSeedSource::open(path).await?),
        (None, true) => Box::new(StoredSeedSource::new(storage.clone())),
        (None, false) => return Err(eyre!("either --seeds or --resume is required")),
    };

    info!(
        from = %range.start,
        to = %range.end,
        concurrency = config.orchestrator.global_concurrency,
        resume,
        "starting run"
    );

    let display = CliProgress::start(orchestrator.progress());
    let result = orchestrator.run(source.as_ref(), range).await;
    display.finish();

    // Dropping the orchestrator releases its queue handles so the writer can drain.
    drop(orchestrator);
    let stats = writer.finish().await?;
    let summary = result?;

    print_summary(&summary);
    println!(
        "  Writes:      {} applied, {} failed, {} retried",
        stats.applied, stats.failed, stats.retries
    );
    println!();
    if summary.interrupted {
        println!("  Run interrupted; resume with `lienflow run --resume`.");
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let p = &summary.progress;
    println!();
    println!("  Run finished in {:.1}s", summary.elapsed().as_secs_f64());
    println!("  Seeded:      {}", p.seeded);
    println!("  Skipped:     {} already done, {} rejected", p.skipped_existing, p.rejected);
    println!("  Completed:   {} ({} analyzed, {} gated out)", p.completed, p.analyzed, p.gate_skipped);
    println!(
        "  Failed:      {} ({} manual review, {} retries exhausted)",
        p.failed, p.manual_review, p.retries_exhausted
    );
    println!("  Requeued:    {}", p.requeued);
    println!("  Interrupted: {} ({} never started)", p.interrupted, p.pending);
    if p.seeds_lost > 0 {
        println!("  Not stored:  {} seeds", p.seeds_lost);
    }
    if p.errors > 0 {
        println!("  Errors:      {}", p.errors);
    }
    for tally in &p.sources {
        println!(
            "    {:<9} {} ok / {} failed",
            tally.source.as_str(), tally.success, tally.failure
        );
    }
}

// ---------------------------------------------------------------------------
// CLI progress display
// ---------------------------------------------------------------------------

/// Spinner polling the run counters.
struct CliProgress {
    spinner: ProgressBar,
    poller: tokio::task::JoinHandle<()>,
}

impl CliProgress {
    fn start(counters: Arc<ProgressCounters>) -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));

        let bar = spinner.clone();
        let poller = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(250));
            loop {
                tick.tick().await;
                let snap = counters.snapshot();
                bar.set_message(format!(
                    "{} pending | {} in flight | {} done | {} failed | {} requeued",
                    snap.pending, snap.in_flight, snap.completed, snap.failed, snap.requeued
                ));
            }
        });
        Self { spinner, poller }
    }

    fn finish(self) {
        self.poller.abort();
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

async fn cmd_status(config: &AppConfig, json: bool) -> Result<()> {
    let storage = open_reader(config).await?;
    let counts = storage.status_counts().await?;
    let failed = storage.list_status(Some(PipelineStatus::Failed)).await?;

    if json {
        let out = serde_json::json!({ "counts": counts, "failed": failed });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    for (status, n) in &counts {
        println!("  {status:<11} {n}");
    }
    if !failed.is_empty() {
        println!();
        println!("  Failed entities:");
        for state in &failed {
            println!(
                "    {}  step={}  retries={}  {}",
                state.entity_id,
                state
                    .error_step
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".into()),
                state.retry_count,
                state.last_error.as_deref().unwrap_or("")
            );
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// recover
// ---------------------------------------------------------------------------

async fn cmd_recover_audit(config: &AppConfig) -> Result<()> {
    let storage = open_reader(config).await?;
    let audited = recovery::audit(&storage, &config.retry_policy()?).await?;
    print_audit(&audited);
    Ok(())
}

fn print_audit(audited: &[lienflow_shared::PipelineState]) {
    println!();
    println!("  {} row(s) in recovery scope", audited.len());
    for state in audited {
        println!(
            "    {}  {}  step={}  retries={}",
            state.entity_id,
            state.status,
            state
                .error_step
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into()),
            state.retry_count
        );
    }
    println!();
}

async fn cmd_recover_apply(config: &AppConfig, yes: bool) -> Result<()> {
    let policy = config.retry_policy()?;
    let storage = Arc::new(Storage::open(&db_path(config)?).await?);

    let audited = recovery::audit(&storage, &policy).await?;
    print_audit(&audited);
    if audited.is_empty() {
        return Ok(());
    }
    if !yes {
        println!("  Dry run. Re-run with --yes to reset these rows.");
        return Ok(());
    }

    let (queue, writer) = WriteQueue::spawn(storage.clone(), &config.write_queue)?;
    let updated = recovery::apply(&queue, &policy).await?;
    drop(queue);
    writer.finish().await?;

    let report = recovery::verify(&storage, &audited).await?;
    println!("  Reset {updated} row(s); {} verified.", report.recovered.len());
    if !report.is_clean() {
        for state in &report.mismatched {
            println!("    mismatch: {}  {}", state.entity_id, state.status);
        }
        return Err(eyre!("{} row(s) did not verify", report.mismatched.len()));
    }
    Ok(())
}

async fn cmd_recover_verify(config: &AppConfig, cases: &[String]) -> Result<()> {
    let storage = open_reader(config).await?;
    let states = storage.verify_recovery(cases).await?;
    println!();
    for state in &states {
        println!(
            "  {}  {}  retries={}  error_step={}",
            state.entity_id,
            state.status,
            state.retry_count,
            state
                .error_step
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into())
        );
    }
    let missing = cases.len().saturating_sub(states.len());
    if missing > 0 {
        println!("  {missing} case number(s) not found");
    }
    println!();
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
