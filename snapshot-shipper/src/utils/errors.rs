//! Error types for the shard pipelines.

use crate::remote::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Inconsistent remote state: {0}")]
    InconsistentRemoteState(String),

    #[error("Shard {index} transform failed: {reason}")]
    ShardTransformFailure { index: u64, reason: String },

    #[error("Shard {index} upload failed: {reason}")]
    UploadFailure { index: u64, reason: String },

    #[error("Shard {index} download failed: {reason}")]
    DownloadFailure { index: u64, reason: String },

    #[error("Shard {index} is corrupt: expected {expected} plaintext bytes, decoded {actual}")]
    CorruptShard { index: u64, expected: u64, actual: u64 },

    #[error("Shard {0} is missing")]
    MissingShard(u64),

    #[error("Backup is incomplete: {0}")]
    BackupIncomplete(String),

    #[error("Sink error: {0}")]
    SinkFailure(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether re-invoking the same operation can make progress.
    ///
    /// Corrupt or inconsistent remote state needs an operator; everything
    /// transient leaves state a fresh run resumes from.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::SourceUnavailable(_)
            | PipelineError::ShardTransformFailure { .. }
            | PipelineError::UploadFailure { .. }
            | PipelineError::DownloadFailure { .. }
            | PipelineError::SinkFailure(_)
            | PipelineError::Store(_)
            | PipelineError::Io(_) => true,
            PipelineError::InconsistentRemoteState(_)
            | PipelineError::CorruptShard { .. }
            | PipelineError::MissingShard(_)
            | PipelineError::BackupIncomplete(_)
            | PipelineError::Cancelled
            | PipelineError::Config(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::UploadFailure { index: 3, reason: "timeout".into() }.is_retryable());
        assert!(PipelineError::SourceUnavailable("zfs send exited 1".into()).is_retryable());
        assert!(!PipelineError::MissingShard(3).is_retryable());
        assert!(!PipelineError::InconsistentRemoteState("gap".into()).is_retryable());
        assert!(!PipelineError::CorruptShard { index: 1, expected: 10, actual: 9 }.is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_messages_name_the_shard() {
        let err = PipelineError::CorruptShard { index: 2, expected: 100, actual: 99 };
        assert_eq!(
            err.to_string(),
            "Shard 2 is corrupt: expected 100 plaintext bytes, decoded 99"
        );
        assert_eq!(PipelineError::MissingShard(3).to_string(), "Shard 3 is missing");
    }
}
