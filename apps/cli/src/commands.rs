//! CLI command definitions, routing, and tracing setup.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use granthub_core::{
    DailySchedule, Pipeline, PipelineDeps, PipelineState, ProgressReporter, RunOptions,
    RunSummary, wait_in_chunks,
};
use granthub_gateway::{OpenRouterClient, OpenRouterOptions};
use granthub_shared::{
    AppConfig, Credentials, WallClock, init_config, load_config, resolve_credentials,
};
use granthub_storage::Stores;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// GrantHub: keep a verified knowledge table of public funding programmes.
#[derive(Parser)]
#[command(
    name = "granthub",
    version,
    about = "Discover, verify and publish public funding programmes.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Append every run summary as one JSON line to this file.
    #[arg(long, global = true, env = "GRANTHUB_SUMMARY_LOG")]
    pub summary_log: Option<PathBuf>,

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
    /// Run the whole pipeline once and print the summary.
    Run {
        /// Maximum candidate names to request (1-25).
        #[arg(long)]
        cap: Option<usize>,

        /// Maximum rows to publish in the sync stage (1-100).
        #[arg(long)]
        sync_limit: Option<usize>,
    },

    /// Run the pipeline every day at a fixed local time.
    Worker {
        /// Run once immediately and exit.
        #[arg(long)]
        once: bool,

        /// Hour of the daily run (0-23).
        #[arg(long)]
        hour: Option<u32>,

        /// Minute of the daily run (0-59).
        #[arg(long)]
        minute: Option<u32>,

        /// Maximum rows to publish per run.
        #[arg(long)]
        limit: Option<usize>,

        /// Maximum candidate names per run.
        #[arg(long)]
        max_candidates: Option<usize>,
    },

    /// Verify stored drafts that have no final payload yet.
    Verify {
        /// Maximum rows to verify.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Publish approved rows to the knowledge table.
    Sync {
        /// Maximum rows to publish (1-100).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
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
        0 => "granthub=info",
        1 => "granthub=debug",
        _ => "granthub=trace",
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
    let summary_log = cli.summary_log;
    match cli.command {
        Command::Run { cap, sync_limit } => {
            let options = RunOptions {
                candidate_cap: cap,
                sync_limit,
            };
            cmd_run(options, summary_log.as_deref()).await
        }
        Command::Worker {
            once,
            hour,
            minute,
            limit,
            max_candidates,
        } => {
            let options = RunOptions {
                candidate_cap: max_candidates,
                sync_limit: limit,
            };
            cmd_worker(once, hour, minute, options, summary_log.as_deref()).await
        }
        Command::Verify { limit } => cmd_verify(limit).await,
        Command::Sync { limit } => cmd_sync(limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Load config, resolve secrets and open both stores.
///
/// Fails before any external call when a required value is missing.
async fn build_pipeline(cancel: &CancellationToken) -> Result<(AppConfig, Pipeline)> {
    let config = load_config()?;
    let credentials = resolve_credentials(&config)?;
    let stores = Stores::open(&config, &credentials).await?;
    let deps = PipelineDeps {
        stores,
        discovery_generator: Arc::new(llm_client(&config, &credentials, &config.llm.model)?),
        verification_generator: Arc::new(llm_client(
            &config,
            &credentials,
            config.llm.verification_model(),
        )?),
        clock: Arc::new(WallClock),
    };
    info!(
        backend = ?config.store.backend,
        model = %config.llm.model,
        verification_model = %config.llm.verification_model(),
        "pipeline ready"
    );
    let pipeline = Pipeline::new(&config, deps, cancel);
    Ok((config, pipeline))
}

fn llm_client(
    config: &AppConfig,
    credentials: &Credentials,
    model: &str,
) -> Result<OpenRouterClient> {
    Ok(OpenRouterClient::new(OpenRouterOptions {
        base_url: config.llm.base_url.clone(),
        api_key: credentials.llm_api_key.clone(),
        model: model.to_string(),
        timeout_secs: config.llm.timeout_secs,
    })?)
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        warn!("stop requested, finishing the current unit of work");
        token.cancel();
    });
}

fn append_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let line = serde_json::to_string(summary)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| eyre!("cannot open summary log {}: {e}", path.display()))?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Run once, print and log the summary.
async fn run_once(
    pipeline: &mut Pipeline,
    options: RunOptions,
    cancel: &CancellationToken,
    summary_log: Option<&Path>,
) -> Result<RunSummary> {
    let reporter = CliProgress::new();
    let summary = pipeline.run(options, cancel, &reporter).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if let Some(path) = summary_log {
        append_summary(path, &summary)?;
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(options: RunOptions, summary_log: Option<&Path>) -> Result<()> {
    let cancel = CancellationToken::new();
    let (_, mut pipeline) = build_pipeline(&cancel).await?;
    cancel_on_signal(cancel.clone());

    let summary = run_once(&mut pipeline, options, &cancel, summary_log).await?;
    if summary.is_success() {
        Ok(())
    } else {
        Err(eyre!("run finished with {} error(s)", summary.errors.len()))
    }
}

async fn cmd_worker(
    once: bool,
    hour: Option<u32>,
    minute: Option<u32>,
    options: RunOptions,
    summary_log: Option<&Path>,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let (config, mut pipeline) = build_pipeline(&cancel).await?;
    let schedule = DailySchedule::new(
        hour.unwrap_or(config.schedule.hour),
        minute.unwrap_or(config.schedule.minute),
    )?;
    cancel_on_signal(cancel.clone());

    if once {
        let summary = run_once(&mut pipeline, options, &cancel, summary_log).await?;
        if !summary.is_success() {
            return Err(eyre!("run finished with {} error(s)", summary.errors.len()));
        }
        return Ok(());
    }

    info!(at = %schedule, "worker started");
    loop {
        let wait = schedule.until_next(chrono::Local::now().naive_local());
        info!(at = %schedule, wait_secs = wait.as_secs(), "next run scheduled");
        if !wait_in_chunks(&WallClock, wait, &cancel).await {
            break;
        }

        // A failed run is reported and the worker keeps its schedule.
        match run_once(&mut pipeline, options, &cancel, summary_log).await {
            Ok(summary) if !summary.is_success() => {
                error!(errors = ?summary.errors, "scheduled run finished with errors");
            }
            Ok(_) => info!("scheduled run finished"),
            Err(e) => error!(error = %e, "scheduled run could not be reported"),
        }
        if cancel.is_cancelled() {
            break;
        }
    }
    info!("worker stopped");
    Ok(())
}

async fn cmd_verify(limit: usize) -> Result<()> {
    let cancel = CancellationToken::new();
    let (_, pipeline) = build_pipeline(&cancel).await?;
    cancel_on_signal(cancel.clone());

    let summary = pipeline.verify_pending(limit, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.errors.is_empty() {
        Ok(())
    } else {
        Err(eyre!("verification finished with {} error(s)", summary.errors.len()))
    }
}

async fn cmd_sync(limit: Option<usize>) -> Result<()> {
    let cancel = CancellationToken::new();
    let (_, pipeline) = build_pipeline(&cancel).await?;

    let summary = pipeline.sync_only(limit).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.errors.is_empty() {
        Ok(())
    } else {
        Err(eyre!("sync finished with {} error(s)", summary.errors.len()))
    }
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, state: PipelineState) {
        self.spinner.set_message(state.label());
    }

    fn stage_done(&self, state: PipelineState, detail: &str) {
        self.spinner.println(format!("  {state}: {detail}"));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}
