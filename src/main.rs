//! # Linkferry CLI
//!
//! Command-line interface for the linkferry library.
//! Queues links, downloads the files behind them and copies them into a
//! local storage folder, one job at a time.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use linkferry::core::destination::DEFAULT_FOLDER_NAME;
use linkferry::{Job, LocalFolderStore, Source, TransferConfig};
use log::error;

mod cli;

/// Command-line interface for linkferry
#[derive(Parser, Debug)]
#[command(name = "linkferry")]
#[command(about = "Resolve links, download them with resume and upload them to storage")]
#[command(long_about = "Transfers every given link through a single-worker queue:
  linkferry https://example.com/file.zip          # Download and store one file
  linkferry \"get https://host/page\" URL2          # Free text works, its first link is used
  linkferry --dry-run https://host/share/page     # Only show where a link leads

Files are stored under <dest-dir>/<folder>/, partial downloads resume
from <download-dir>/<name>.part")]
#[command(version = env!("LINKFERRY_VERSION"))]
struct Cli {
    /// Links (or texts containing a link) to transfer
    #[arg(required = true)]
    sources: Vec<String>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for downloads in progress
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Root of the local storage the files are uploaded to
    #[arg(long, default_value = "./data/storage")]
    dest_dir: PathBuf,

    /// Folder created inside the storage root
    #[arg(long, default_value = DEFAULT_FOLDER_NAME)]
    folder: String,

    /// Storage account the jobs belong to
    #[arg(long, default_value = "local")]
    owner: String,

    /// Only resolve each link and print the file it leads to
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("❌ Error: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Returns whether every job succeeded
async fn run() -> anyhow::Result<bool> {
    let cli = Cli::parse();

    // Initialize logging to stderr
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .init();

    if cli.verbose {
        eprintln!("⛴️  Linkferry v{} starting...", env!("LINKFERRY_VERSION"));
    }

    let config = load_config(&cli)?;

    if cli.dry_run {
        return dry_run(&cli.sources, &config).await;
    }

    transfer_all(&cli, config).await
}

/// Build the effective configuration: file first, then flags
fn load_config(cli: &Cli) -> anyhow::Result<TransferConfig> {
    let mut config = match &cli.config {
        Some(path) => TransferConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => TransferConfig::default(),
    };
    if let Some(dir) = &cli.download_dir {
        config.download_dir = dir.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn dry_run(sources: &[String], config: &TransferConfig) -> anyhow::Result<bool> {
    let mut all_ok = true;
    for text in sources {
        let url = match Source::from_text(text) {
            Ok(Source::Url(url)) => url,
            Ok(Source::Attachment(_)) => continue,
            Err(e) => {
                eprintln!("❌ {text}: {e}");
                all_ok = false;
                continue;
            }
        };
        match linkferry::resolve_with_config(&url, config).await {
            Ok(target) => {
                eprintln!("🔍 [DRY RUN] {url}");
                eprintln!("   → {} ({} landing pages)", target.url, target.hops);
                eprintln!("   📄 {}", target.file_name());
                if target.declared_total > 0 {
                    eprintln!("   📦 {} bytes", target.declared_total);
                }
            }
            Err(e) => {
                eprintln!("❌ {url}: {e}");
                all_ok = false;
            }
        }
    }
    Ok(all_ok)
}

async fn transfer_all(cli: &Cli, config: TransferConfig) -> anyhow::Result<bool> {
    std::fs::create_dir_all(&cli.dest_dir)
        .with_context(|| format!("cannot create {}", cli.dest_dir.display()))?;

    let tickets = Arc::new(cli::ConsoleTickets::new());
    let store = Arc::new(LocalFolderStore::with_folder(&cli.dest_dir, &cli.folder));
    let queue = linkferry::transfer_queue(config, store, tickets.clone())
        .context("cannot start the transfer queue")?;

    let mut all_ok = true;
    let mut submissions = Vec::new();
    let mut cancels = Vec::new();
    for text in &cli.sources {
        let source = match Source::from_text(text) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("❌ {text}: {e}");
                all_ok = false;
                continue;
            }
        };
        let ticket = tickets.open(&short_label(source.describe()));
        let job = Job::new(source, cli.owner.clone(), ticket);
        cancels.push(job.cancel.clone());
        submissions.push(queue.enqueue(job).await);
    }

    // Ctrl-C cancels every job; partial downloads are removed by the engine
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            for cancel in &cancels {
                cancel.cancel();
            }
        }
    });

    for submission in submissions {
        let id = submission.id;
        match submission.outcome().await {
            Some(outcome) if outcome.is_success() => {}
            Some(outcome) => {
                if let Err(failure) = &outcome.result {
                    log::error!("Job {id} failed: {failure}");
                }
                all_ok = false;
            }
            None => {
                log::error!("Job {id} was dropped by the queue");
                all_ok = false;
            }
        }
    }

    interrupt.abort();
    tickets.finish_all();
    Ok(all_ok)
}

/// Shorten a source description to fit a progress line prefix
fn short_label(description: &str) -> String {
    const MAX: usize = 40;
    let trimmed = description
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    if trimmed.chars().count() <= MAX {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(MAX - 1).collect();
        format!("{head}…")
    }
}
