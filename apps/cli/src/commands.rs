//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use examflow_classify::ClassifierClient;
use examflow_core::PassProgress;
use examflow_extract::OcrClient;
use examflow_shared::{AppConfig, expand_home, init_config, load_config, require_access_key};
use examflow_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Examflow — classify exam questions into a Subject→Topic taxonomy.
#[derive(Parser)]
#[command(
    name = "examflow",
    version,
    about = "Ingest exam questions, OCR their scans, and reconcile them into a taxonomy.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database file (overrides the configured path).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

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
    /// Ingest a CSV batch of raw exam questions.
    Ingest {
        /// Path to the CSV file.
        csv: PathBuf,

        /// Source label for this batch (exam name / upload tag).
        #[arg(short, long)]
        source: String,

        /// Exam year for this batch.
        #[arg(short, long)]
        year: i64,
    },

    /// Run OCR extraction over image-only items.
    Extract,

    /// Run the classification pass over unclassified items.
    Classify,

    /// Repair ledger rows that drifted out of the live taxonomy.
    Repair,

    /// Apply staged classifications to items, then clean up.
    Migrate,

    /// Remove sentinel ledger rows and the placeholder topic.
    CleanupSentinels,

    /// Taxonomy management.
    Taxonomy {
        /// Taxonomy subcommand.
        #[command(subcommand)]
        action: TaxonomyAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Taxonomy subcommands.
#[derive(Subcommand)]
pub(crate) enum TaxonomyAction {
    /// Reconcile a subject's topics with a desired set.
    Sync {
        /// Subject display name (created if absent).
        #[arg(long)]
        subject: String,

        /// Desired topic names, comma-separated.
        #[arg(long, value_delimiter = ',')]
        topics: Vec<String>,
    },
    /// Print all subjects and their topics.
    List,
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
        0 => "examflow=info",
        1 => "examflow=debug",
        _ => "examflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Ingest { csv, source, year } => cmd_ingest(&csv, &source, year, cli.db).await,
        Command::Extract => cmd_extract(cli.db).await,
        Command::Classify => cmd_classify(cli.db).await,
        Command::Repair => cmd_repair(cli.db).await,
        Command::Migrate => cmd_migrate(cli.db).await,
        Command::CleanupSentinels => cmd_cleanup_sentinels(cli.db).await,
        Command::Taxonomy { action } => match action {
            TaxonomyAction::Sync { subject, topics } => {
                cmd_taxonomy_sync(&subject, &topics, cli.db).await
            }
            TaxonomyAction::List => cmd_taxonomy_list(cli.db).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Resolve the database path (CLI override wins) and open it read-write.
async fn open_storage(config: &AppConfig, db_override: Option<PathBuf>) -> Result<Storage> {
    let path =
        db_override.unwrap_or_else(|| expand_home(&config.defaults.database_path));
    Ok(Storage::open(&path).await?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_ingest(csv: &std::path::Path, source: &str, year: i64, db: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config, db).await?;

    info!(path = %csv.display(), source, year, "ingesting batch");
    let summary = examflow_core::ingest::ingest_csv(&storage, csv, source, year).await?;

    println!();
    println!("  Batch ingested!");
    println!("  Rows read:     {}", summary.rows_read);
    println!("  Items created: {}", summary.items_created);
    println!("  Rows skipped:  {}", summary.rows_skipped);
    println!();
    Ok(())
}

async fn cmd_extract(db: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let app_key = require_access_key(&config.ocr.app_key_env)?;
    let storage = open_storage(&config, db).await?;

    let ocr = OcrClient::new(
        &config.ocr.endpoint,
        &app_key,
        config.defaults.http_timeout_secs,
    )?;

    let reporter = CliProgress::new();
    let summary = examflow_core::ingest::run_extraction_pass(&storage, &ocr, &reporter).await?;
    reporter.finish();

    println!();
    println!("  Extraction pass complete!");
    println!("  Processed:   {}", summary.processed);
    println!("  Extracted:   {}", summary.extracted);
    println!("  Unavailable: {}", summary.unavailable);
    println!("  Skipped:     {}", summary.skipped);
    println!("  Time:        {:.1}s", summary.elapsed.as_secs_f64());
    println!();
    Ok(())
}

async fn cmd_classify(db: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let access_key = require_access_key(&config.classifier.access_key_env)?;
    let storage = open_storage(&config, db).await?;

    let classifier = ClassifierClient::new(
        &config.classifier.endpoint,
        &access_key,
        config.defaults.http_timeout_secs,
    )?;

    let reporter = CliProgress::new();
    let summary =
        examflow_core::reconcile::run_classification_pass(&storage, &classifier, &reporter).await?;
    reporter.finish();

    println!();
    println!("  Classification pass complete!");
    println!("  Processed:  {}", summary.processed);
    println!("  Classified: {}", summary.classified);
    println!("  Undecided:  {}", summary.undecided);
    println!("  Skipped:    {}", summary.skipped);
    println!("  Failed:     {}", summary.failed);
    println!("  Time:       {:.1}s", summary.elapsed.as_secs_f64());
    println!();
    Ok(())
}

async fn cmd_repair(db: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config, db).await?;

    let reporter = CliProgress::new();
    let summary = examflow_core::reconcile::run_drift_repair(&storage, &reporter).await?;
    reporter.finish();

    println!();
    println!("  Drift repair complete!");
    println!("  Scanned:  {}", summary.scanned);
    println!("  Repaired: {}", summary.repaired);
    println!("  Time:     {:.1}s", summary.elapsed.as_secs_f64());
    println!();
    Ok(())
}

async fn cmd_migrate(db: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config, db).await?;

    let reporter = CliProgress::new();
    let summary = examflow_core::migrate::run_migration_pass(&storage, &reporter).await?;
    reporter.finish();

    println!();
    println!("  Migration pass complete!");
    println!("  Migrated:           {}", summary.migrated);
    println!("  Undecided:          {}", summary.undecided);
    println!("  Topics removed:     {}", summary.topics_removed);
    println!("  Duplicates removed: {}", summary.duplicates_removed);
    println!("  Time:               {:.1}s", summary.elapsed.as_secs_f64());
    println!();
    Ok(())
}

async fn cmd_cleanup_sentinels(db: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config, db).await?;

    let summary = examflow_core::migrate::run_sentinel_cleanup(&storage).await?;

    println!();
    println!("  Sentinel cleanup complete!");
    println!("  Proposals removed: {}", summary.proposals_removed);
    println!(
        "  Placeholder topic: {}",
        if summary.topic_removed { "removed" } else { "kept" }
    );
    println!();
    Ok(())
}

async fn cmd_taxonomy_sync(subject: &str, topics: &[String], db: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config, db).await?;

    let desired: Vec<String> = topics
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    info!(subject, topics = desired.len(), "syncing taxonomy");
    let summary = examflow_core::taxonomy::sync_subject_topics(&storage, subject, &desired).await?;

    println!();
    println!("  Taxonomy synced!");
    println!("  Created: {}", summary.created);
    println!("  Removed: {}", summary.removed);
    if !summary.blocked.is_empty() {
        println!("  Kept (still referenced):");
        for (name, count) in &summary.blocked {
            println!("    {name} ({count} item(s))");
        }
    }
    println!();
    Ok(())
}

async fn cmd_taxonomy_list(db: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config, db).await?;

    let subjects = storage.list_subjects().await?;
    if subjects.is_empty() {
        println!("No subjects yet.");
        return Ok(());
    }

    println!();
    for subject in subjects {
        match subject.year {
            Some(year) => println!("  {} ({year})", subject.name),
            None => println!("  {}", subject.name),
        }
        for topic in storage.list_topics_by_subject(&subject.id).await? {
            println!("    - {}", topic.name);
        }
    }
    println!();
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Created config file: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config = load_config()?;
    let rendered = toml::to_string_pretty(&config)?;
    println!("{rendered}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl PassProgress for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn item(&self, current: usize, total: usize, detail: &str) {
        self.spinner
            .set_message(format!("[{current}/{total}] {detail}"));
    }
}
