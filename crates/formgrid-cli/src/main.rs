use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use formgrid_source::{FormsClient, FormsClientConfig, SubmissionSource, SyncFilters};
use formgrid_store::{HttpTableStore, StoreClientConfig, TableStore};
use formgrid_sync::{run_sync, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "formgrid-cli")]
#[command(about = "Mirror form submissions into a tabular document store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass for a form.
    Sync(SyncArgs),
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "formgrid.yaml")]
    config: PathBuf,

    /// Form to sync; overrides the config file.
    #[arg(long)]
    form_id: Option<i64>,

    /// Only submissions submitted on or after this date (YYYY-MM-DD).
    #[arg(long)]
    submitted_after: Option<NaiveDate>,

    /// Only submissions submitted on or before this date (YYYY-MM-DD).
    #[arg(long)]
    submitted_before: Option<NaiveDate>,

    /// Only submissions in these states; repeatable.
    #[arg(long = "state")]
    states: Vec<String>,

    /// Only submissions visible to these reviewer groups; repeatable.
    #[arg(long = "reviewer-group")]
    reviewer_groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    source: SourceSection,
    store: StoreSection,
    #[serde(default)]
    form_id: Option<i64>,
    #[serde(default = "default_fetch_workers")]
    fetch_workers: usize,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default = "default_section_batch_size")]
    section_batch_size: usize,
    #[serde(default = "default_sync_reviewers")]
    sync_reviewers: bool,
}

#[derive(Debug, Deserialize)]
struct SourceSection {
    base_url: String,
    token: String,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default = "default_fetch_workers")]
    concurrency: usize,
}

#[derive(Debug, Deserialize)]
struct StoreSection {
    base_url: String,
    api_key: String,
    document_id: String,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_fetch_workers() -> usize {
    3
}

fn default_batch_size() -> usize {
    100
}

fn default_section_batch_size() -> usize {
    50
}

fn default_sync_reviewers() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    20
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync(args) => sync_command(args).await,
    }
}

async fn sync_command(args: SyncArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let file: FileConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing {}", args.config.display()))?;

    let form_id = args
        .form_id
        .or(file.form_id)
        .context("no form id given (pass --form-id or set form_id in the config)")?;

    let source = FormsClient::new(FormsClientConfig {
        base_url: file.source.base_url,
        token: file.source.token,
        timeout: Duration::from_secs(file.source.timeout_secs),
        concurrency: file.source.concurrency,
        ..FormsClientConfig::default()
    })?;
    let store = HttpTableStore::new(&StoreClientConfig {
        base_url: file.store.base_url,
        api_key: file.store.api_key,
        document_id: file.store.document_id,
        timeout_secs: file.store.timeout_secs,
    })
    .context("building store client")?;

    let config = SyncConfig {
        fetch_workers: file.fetch_workers,
        batch_size: file.batch_size,
        section_batch_size: file.section_batch_size,
        sync_reviewers: file.sync_reviewers,
        ..SyncConfig::new(form_id)
    };
    let filters = SyncFilters {
        submitted_after: args.submitted_after,
        submitted_before: args.submitted_before,
        states: args.states,
        reviewer_groups: args.reviewer_groups,
    };

    let outcome = run_sync(
        Arc::new(source) as Arc<dyn SubmissionSource>,
        Arc::new(store) as Arc<dyn TableStore>,
        config,
        &filters,
    )
    .await?;

    println!("{}", outcome.message);
    println!(
        "processed={} ok={} failed={}",
        outcome.total_processed, outcome.success_count, outcome.error_count
    );
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}
