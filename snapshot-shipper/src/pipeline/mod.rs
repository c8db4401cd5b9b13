//! The backup and restore engines.
//!
//! Both run one shard at a time in a single task. Every await that can block
//! on the outside world races the job's cancellation token.

pub mod backup;
pub mod restore;

use crate::transform::Compression;
use crate::utils::{PipelineError, Result};
use std::future::Future;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

pub use backup::{BackupJob, BackupOutcome, BackupState, ResumePlan, ShardPipeline};
pub use restore::{ReconstructionPipeline, RestoreOutcome, RestoreState};

/// Settings shared by both pipelines.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Where shard temp files live. Needs room for about one shard.
    pub work_dir: PathBuf,
    pub compression: Compression,
}

/// Run `fut` unless `cancel` fires first. Dropping `fut` releases whatever
/// it held: temp files are removed, child processes killed, and unfinished
/// uploads never become visible.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        result = fut => result,
    }
}

/// Create a scoped temp file in `work_dir`, removed when dropped.
pub(crate) fn scratch_file(
    work_dir: &std::path::Path,
    prefix: &str,
) -> Result<(tempfile::NamedTempFile, tokio::fs::File)> {
    let temp = tempfile::Builder::new().prefix(prefix).tempfile_in(work_dir)?;
    let file = tokio::fs::File::from_std(temp.as_file().try_clone()?);
    Ok((temp, file))
}
