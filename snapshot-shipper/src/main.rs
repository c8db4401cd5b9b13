//! Snapshot Shipper - Main entry point
//!
//! Command line front end for the backup and restore pipelines.

use anyhow::{bail, Context, Result};
use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use snapshot_shipper::completion::{self, Completion};
use snapshot_shipper::config::Config;
use snapshot_shipper::daemon::{cancel_on_signal, JobLock};
use snapshot_shipper::inventory::{self, BackupStatus};
use snapshot_shipper::pipeline::{
    BackupJob, PipelineSettings, ReconstructionPipeline, ShardPipeline,
};
use snapshot_shipper::remote::RemoteRegistry;
use snapshot_shipper::transfer::format_bytes;
use snapshot_shipper::transform::{CommandCipher, Compression};
use snapshot_shipper::{stream, utils, PipelineError};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export a snapshot and store it as encrypted shards
    Backup(BackupArgs),
    /// Rebuild a stored backup into a sink
    Restore(RestoreArgs),
    /// Show whether one backup is complete
    Status(PrefixArgs),
    /// List the backups stored under a destination
    List(LocationArgs),
    /// Delete every shard and sidecar of one backup
    Discard(PrefixArgs),
}

#[derive(Args, Debug)]
struct LocationArgs {
    /// Configured remote name
    #[arg(long)]
    remote: String,

    /// Directory on the remote holding the shards
    #[arg(long)]
    dest: String,
}

#[derive(Args, Debug)]
struct PrefixArgs {
    #[command(flatten)]
    location: LocationArgs,

    /// Backup prefix, e.g. full-20240601T120000Z
    #[arg(long)]
    prefix: String,
}

#[derive(Args, Debug)]
struct BackupArgs {
    #[command(flatten)]
    location: LocationArgs,

    /// Snapshot to export
    #[arg(long)]
    snapshot: String,

    /// Base snapshot for an incremental export
    #[arg(long)]
    since: Option<String>,

    /// Lock key; defaults to the snapshot name before '@'
    #[arg(long)]
    dataset: Option<String>,

    /// Reuse this prefix, resuming whatever is stored under it
    #[arg(long, conflicts_with = "resume_latest")]
    prefix: Option<String>,

    /// Resume the newest incomplete backup under the destination
    #[arg(long)]
    resume_latest: bool,

    /// Plaintext bytes per shard (overrides config)
    #[arg(long)]
    shard_size: Option<u64>,

    /// Total attempts on retryable failures
    #[arg(long, default_value_t = 1)]
    attempts: usize,
}

#[derive(Args, Debug)]
struct RestoreArgs {
    #[command(flatten)]
    location: PrefixArgs,

    /// Dataset or file to receive into
    #[arg(long)]
    target: String,

    /// Total attempts on retryable failures
    #[arg(long, default_value_t = 1)]
    attempts: usize,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting snapshot-shipper v{}", env!("CARGO_PKG_VERSION"));

    let remotes = RemoteRegistry::from_config(&config.remotes)?;
    tracing::debug!("Configured remotes: {:?}", remotes.names());

    match cli.command {
        Command::Backup(args) => backup(&config, &remotes, args).await,
        Command::Restore(args) => restore(&config, &remotes, args).await,
        Command::Status(args) => status(&remotes, args).await,
        Command::List(args) => list(&remotes, args).await,
        Command::Discard(args) => discard(&remotes, args).await,
    }
}

fn settings(config: &Config) -> Result<PipelineSettings> {
    std::fs::create_dir_all(&config.agent.work_dir)
        .with_context(|| format!("Failed to create work dir {}", config.agent.work_dir.display()))?;
    Ok(PipelineSettings {
        work_dir: config.agent.work_dir.clone(),
        compression: Compression::from_config(&config.compression)?,
    })
}

/// Run `op` up to `attempts` times, backing off between retryable failures.
async fn with_attempts<T, F, Fut>(attempts: usize, op: F) -> std::result::Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, PipelineError>>,
{
    op.retry(ExponentialBuilder::default().with_max_times(attempts.saturating_sub(1)))
        .when(|e: &PipelineError| e.is_retryable())
        .notify(|e: &PipelineError, delay| {
            tracing::warn!("Attempt failed: {}; retrying in {:?}", e, delay)
        })
        .await
}

async fn backup(config: &Config, remotes: &RemoteRegistry, args: BackupArgs) -> Result<ExitCode> {
    let store = remotes.get(&args.location.remote)?;
    let cipher = CommandCipher::from_config(&config.encryption)?;
    if !cipher.can_encrypt() {
        bail!("Backups need encryption.recipient or encryption.recipients_file");
    }

    let dataset = args
        .dataset
        .clone()
        .unwrap_or_else(|| args.snapshot.split('@').next().unwrap_or_default().to_string());
    let lock = JobLock::acquire(&config.agent.lock_dir, &dataset)?;
    tracing::debug!("Holding {}", lock.path().display());

    let prefix = match (&args.prefix, args.resume_latest) {
        (Some(prefix), _) => prefix.clone(),
        (None, true) => {
            let backups = inventory::discover_backups(store.as_ref(), &args.location.dest).await?;
            match inventory::latest_incomplete(&backups, &args.snapshot, args.since.as_deref()) {
                Some(latest) => {
                    tracing::info!("Resuming {}", latest.prefix);
                    latest.prefix.clone()
                }
                None => BackupJob::derive_prefix(args.since.is_some(), Utc::now()),
            }
        }
        (None, false) => BackupJob::derive_prefix(args.since.is_some(), Utc::now()),
    };

    let job = BackupJob {
        source_identifier: args.snapshot.clone(),
        since_identifier: args.since.clone(),
        backup_prefix: prefix,
        destination_path: args.location.dest.clone(),
    };
    let source = stream::source::from_config(&config.source);
    let shard_size = args.shard_size.or(config.shard.size);

    let cancel = CancellationToken::new();
    let watcher = cancel_on_signal(cancel.clone());
    let pipeline = ShardPipeline::new(store, Arc::new(cipher), settings(config)?, cancel);

    let started = Instant::now();
    let result = with_attempts(args.attempts, || {
        pipeline.run_planned(&job, source.as_ref(), shard_size)
    })
    .await;
    watcher.abort();

    let outcome = result?;
    tracing::info!(
        prefix = %outcome.prefix,
        written = outcome.shards_written,
        total = outcome.total_shards,
        "Backup complete: {} in {} shards after {:.1}s",
        format_bytes(outcome.total_bytes),
        outcome.total_shards,
        started.elapsed().as_secs_f64()
    );
    println!("{}", outcome.prefix);
    Ok(ExitCode::SUCCESS)
}

async fn restore(config: &Config, remotes: &RemoteRegistry, args: RestoreArgs) -> Result<ExitCode> {
    let PrefixArgs { location, prefix } = &args.location;
    let store = remotes.get(&location.remote)?;
    let cipher = CommandCipher::from_config(&config.encryption)?;
    if !cipher.can_decrypt() {
        bail!("Restores need encryption.identity_file");
    }

    let lock = JobLock::acquire(&config.agent.lock_dir, &args.target)?;
    tracing::debug!("Holding {}", lock.path().display());

    let sink = stream::sink::from_config(&config.sink);
    let cancel = CancellationToken::new();
    let watcher = cancel_on_signal(cancel.clone());
    let pipeline = ReconstructionPipeline::new(store, Arc::new(cipher), settings(config)?, cancel);

    let result = with_attempts(args.attempts, || {
        pipeline.run(&location.dest, prefix, sink.as_ref(), &args.target)
    })
    .await;
    watcher.abort();

    let outcome = result?;
    tracing::info!(
        prefix = %outcome.prefix,
        "Restored {} from {} shards into {}",
        format_bytes(outcome.total_bytes),
        outcome.shards,
        args.target
    );
    Ok(ExitCode::SUCCESS)
}

fn describe(completion: &Completion) -> String {
    match completion {
        Completion::Empty => "empty".to_string(),
        Completion::Incomplete {
            shards,
            stored_bytes,
            resumable_from,
        } => format!(
            "incomplete: {} shards, {} stored, resumes at shard {}",
            shards,
            format_bytes(*stored_bytes),
            resumable_from
        ),
        Completion::Complete { shards, total_bytes } => {
            format!("complete: {} shards, {}", shards, format_bytes(*total_bytes))
        }
    }
}

async fn status(remotes: &RemoteRegistry, args: PrefixArgs) -> Result<ExitCode> {
    let store = remotes.get(&args.location.remote)?;
    let shards = inventory::list_shards(store.as_ref(), &args.location.dest, &args.prefix).await?;
    let state = completion::assess(&shards)?;
    println!("{} {}", args.prefix, describe(&state));
    Ok(if state.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn list(remotes: &RemoteRegistry, args: LocationArgs) -> Result<ExitCode> {
    let store = remotes.get(&args.remote)?;
    let backups = inventory::discover_backups(store.as_ref(), &args.dest).await?;
    if backups.is_empty() {
        println!("No backups under {}", args.dest);
    }
    for backup in &backups {
        let state = match &backup.status {
            BackupStatus::Assessed(completion) => describe(completion),
            BackupStatus::Inconsistent(reason) => format!("inconsistent: {}", reason),
        };
        let source = backup.source_identifier.as_deref().unwrap_or("unknown source");
        match &backup.since_identifier {
            Some(since) => println!("{} {} (since {}) {}", backup.prefix, source, since, state),
            None => println!("{} {} {}", backup.prefix, source, state),
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn discard(remotes: &RemoteRegistry, args: PrefixArgs) -> Result<ExitCode> {
    let store = remotes.get(&args.location.remote)?;
    let deleted =
        inventory::discard_backup(store.as_ref(), &args.location.dest, &args.prefix).await?;
    tracing::info!(prefix = %args.prefix, "Deleted {} objects", deleted);
    println!("Deleted {} objects", deleted);
    Ok(ExitCode::SUCCESS)
}
