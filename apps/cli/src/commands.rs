//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tracing::{info, warn};

use intelhub_core::{
    AccountPool, ArchiveStore, HubDeps, HubStatistics, IntelligenceHub, OpenAiCompatibleClient,
    SiliconFlowBalanceClient, SubmitOutcome, load_prompt,
};
use intelhub_shared::{
    AppConfig, ArchiveFilter, ArchivedItem, BalancePolicy, NewDocument, PipelineConfig,
    SchemaConfig, expand_home, init_config, load_config, resolve_account_seeds,
};
use intelhub_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// intelhub: collect, analyse and archive intelligence documents.
#[derive(Parser)]
#[command(
    name = "intelhub",
    version,
    about = "Collect documents, score them with AI under a rotating account pool, and archive the results.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
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
    /// Run the hub: workers, lease reclaimer, balance monitor and collectors.
    Run,

    /// Submit documents from a JSON file (one object or an array).
    Submit {
        /// Path to the JSON file.
        file: PathBuf,
    },

    /// List archived items, newest first.
    List {
        /// Number of items to skip.
        #[arg(long, default_value = "0")]
        offset: u32,

        /// Maximum number of items to print.
        #[arg(long, default_value = "20")]
        count: u32,

        /// Minimum score (defaults to `read.default_score_threshold`).
        #[arg(long)]
        threshold: Option<f64>,

        /// Include discarded items and ignore the score threshold.
        #[arg(long)]
        all: bool,

        /// Print one JSON object per line.
        #[arg(long)]
        json: bool,
    },

    /// Refresh every account's balance once and print the pool.
    Accounts,

    /// Print queue and archive counts.
    Stats,

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
        0 => "intelhub=info",
        1 => "intelhub=debug",
        _ => "intelhub=trace",
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
        Command::Run => cmd_run().await,
        Command::Submit { file } => cmd_submit(&file).await,
        Command::List {
            offset,
            count,
            threshold,
            all,
            json,
        } => cmd_list(offset, count, threshold, all, json).await,
        Command::Accounts => cmd_accounts().await,
        Command::Stats => cmd_stats().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Hub construction
// ---------------------------------------------------------------------------

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = expand_home(&config.hub.database_path);
    let storage = Storage::open(&path)
        .await
        .wrap_err_with(|| format!("opening database at {}", path.display()))?;
    Ok(Arc::new(storage))
}

/// Open an existing database for reading only.
async fn open_storage_readonly(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = expand_home(&config.hub.database_path);
    if !path.exists() {
        return Err(eyre!("no database at {}; run `intelhub run` first", path.display()));
    }
    let storage = Storage::open_readonly(&path)
        .await
        .wrap_err_with(|| format!("opening database at {}", path.display()))?;
    Ok(Arc::new(storage))
}

/// Build a hub from config. Commands that never call the provider may run
/// with an empty account pool.
async fn build_hub(config: &AppConfig, require_accounts: bool) -> Result<IntelligenceHub> {
    let pipeline = PipelineConfig::from(config);
    let schema = SchemaConfig::from(config);
    let seeds = match resolve_account_seeds(config) {
        Ok(seeds) => seeds,
        Err(e) if require_accounts => return Err(e.into()),
        Err(_) => Vec::new(),
    };
    let pool = Arc::new(AccountPool::new(
        seeds,
        pipeline.per_account_concurrency,
        BalancePolicy::from(config),
    ));
    let deps = HubDeps {
        storage: open_storage(config).await?,
        pool,
        provider: Arc::new(OpenAiCompatibleClient::new(&config.provider)?),
        balance: Arc::new(SiliconFlowBalanceClient::new(
            &config.provider,
            pipeline.balance_query_timeout,
        )?),
        prompt: load_prompt(&config.provider, &schema)?,
        schema,
    };
    Ok(IntelligenceHub::new(deps, pipeline))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run() -> Result<()> {
    let config = load_config()?;
    let hub = Arc::new(build_hub(&config, true).await?);

    for entry in config.collectors.iter().filter(|c| c.enabled) {
        hub.registry().register(intelhub_collector::from_config(entry)?)?;
    }
    info!(
        accounts = hub.pool().len(),
        collectors = ?hub.registry().names(),
        "starting hub"
    );

    let handle = hub.start();
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(Duration::from_millis(80));

    let (hub_ref, spinner_ref) = (&hub, &spinner);
    tick_until(tokio::signal::ctrl_c(), Duration::from_millis(500), move || async move {
        match hub_ref.statistics().await {
            Ok(stats) => spinner_ref.set_message(stats_line(&stats)),
            Err(e) => warn!(error = %e, "statistics unavailable"),
        }
    })
    .await;

    spinner.set_message("shutting down");
    handle.shutdown().await;
    spinner.finish_and_clear();

    let stats = hub.statistics().await?;
    println!();
    println!("  Hub stopped.");
    print_statistics(&stats);
    Ok(())
}

/// Run `tick` every `period` until `shutdown` resolves. The shutdown future
/// is polled across ticks, so a signal that lands mid-tick is not lost.
async fn tick_until<S, T, F>(shutdown: S, period: Duration, mut tick: T)
where
    S: Future,
    T: FnMut() -> F,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = ticker.tick() => tick().await,
        }
    }
}

/// A submission file holds one document or an array of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum SubmissionFile {
    Many(Vec<NewDocument>),
    One(NewDocument),
}

async fn cmd_submit(file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("reading {}", file.display()))?;
    let docs = match serde_json::from_str::<SubmissionFile>(&raw)
        .wrap_err_with(|| format!("parsing {}", file.display()))?
    {
        SubmissionFile::Many(docs) => docs,
        SubmissionFile::One(doc) => vec![doc],
    };

    let config = load_config()?;
    let hub = build_hub(&config, false).await?;

    let (mut accepted, mut duplicates, mut rejected) = (0, 0, 0);
    for doc in docs {
        let url = doc.source_url.clone();
        match hub.submit(doc.into()).await? {
            SubmitOutcome::Accepted => {
                accepted += 1;
                println!("  accepted   {url}");
            }
            SubmitOutcome::Duplicate => {
                duplicates += 1;
                println!("  duplicate  {url}");
            }
            SubmitOutcome::Rejected(reason) => {
                rejected += 1;
                println!("  rejected   {url} ({reason})");
            }
        }
    }
    println!();
    println!("  Accepted: {accepted}  Duplicates: {duplicates}  Rejected: {rejected}");
    Ok(())
}

async fn cmd_list(offset: u32, count: u32, threshold: Option<f64>, all: bool, json: bool) -> Result<()> {
    let config = load_config()?;
    let archive = ArchiveStore::new(open_storage_readonly(&config).await?);

    let score_threshold = if all {
        None
    } else {
        Some(threshold.unwrap_or(config.read.default_score_threshold))
    };
    let items = archive
        .list(&ArchiveFilter {
            offset,
            count,
            score_threshold,
            final_state: None,
        })
        .await?;

    if json {
        for item in &items {
            println!("{}", serde_json::to_string(item)?);
        }
        return Ok(());
    }

    if items.is_empty() {
        println!("No archived items.");
        return Ok(());
    }
    for item in &items {
        println!("{}", list_line(item));
    }
    Ok(())
}

async fn cmd_accounts() -> Result<()> {
    let config = load_config()?;
    let hub = build_hub(&config, true).await?;
    let summary = hub.monitor().refresh_all().await;

    println!();
    println!("  {:<16} {:<12} {:<12} {:>10}  Checked", "Account", "Key", "State", "Balance");
    for account in hub.pool().snapshot() {
        let balance = account
            .balance
            .map(|b| format!("{b:.2}"))
            .unwrap_or_else(|| "-".into());
        let checked = account
            .last_checked_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".into());
        println!(
            "  {:<16} {:<12} {:<12} {:>10}  {checked}",
            account.id,
            account.credential,
            account.state.to_string(),
            balance
        );
    }
    println!();
    println!("  Refreshed: {}  Failed: {}", summary.refreshed, summary.failed);
    Ok(())
}

async fn cmd_stats() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;
    let queue = storage.queue_counts().await?;
    let archive = storage.archive_counts().await?;
    println!();
    println!("  Cached:     {}", queue.cached);
    println!("  Analyzing:  {}", queue.analyzing);
    println!("  Archived:   {}", archive.archived);
    println!("  Discarded:  {}", archive.discarded);
    println!();
    Ok(())
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
// Output formatting
// ---------------------------------------------------------------------------

fn stats_line(stats: &HubStatistics) -> String {
    let c = &stats.counters;
    format!(
        "queue {} cached / {} analyzing | archived {} discarded {} | accepted {} dup {} | failures t{} f{} a{} | saturated {}",
        stats.cached,
        stats.analyzing,
        stats.archived_total,
        stats.discarded_total,
        c.accepted,
        c.duplicates,
        c.transient_failures,
        c.format_failures,
        c.account_failures,
        c.saturation_waits,
    )
}

fn print_statistics(stats: &HubStatistics) {
    let c = &stats.counters;
    println!("  Accepted:    {}  Duplicates: {}  Rejected: {}", c.accepted, c.duplicates, c.rejected);
    println!("  Archived:    {}  Discarded:  {}", c.archived, c.discarded);
    println!(
        "  Failures:    transient {}  format {}  account {}",
        c.transient_failures, c.format_failures, c.account_failures
    );
    println!(
        "  Saturation:  {}  Reclaimed: {}  Leases lost: {}  Storage errors: {}",
        c.saturation_waits, c.reclaimed, c.leases_lost, c.storage_errors
    );
    println!("  Queue:       {} cached, {} analyzing", stats.cached, stats.analyzing);
    println!();
}

fn list_line(item: &ArchivedItem) -> String {
    let when = item.archived_at.format("%Y-%m-%d %H:%M");
    let heading = item
        .structured_result
        .as_ref()
        .and_then(|r| r.title.clone())
        .or_else(|| item.title.clone())
        .unwrap_or_else(|| item.source_url.clone());
    match &item.structured_result {
        Some(result) => format!(
            "{when}  {:>5.1}  {:<12} {heading}\n                    {}",
            result.score, result.classification, result.summary
        ),
        None => format!(
            "{when}  {:>5}  {:<12} {heading}",
            "-",
            item.reason.as_deref().unwrap_or("discarded")
        ),
    }
}
