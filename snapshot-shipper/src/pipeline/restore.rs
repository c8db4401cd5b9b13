//! Reconstruction pipeline: shard objects in, the original stream out.
//!
//! Nothing reaches the sink until the stored set has been shown complete,
//! and no byte of a shard reaches it before that shard decoded to exactly
//! the length its neighbours say it covers.

use super::{cancellable, scratch_file, PipelineSettings};
use crate::completion::{self, Completion};
use crate::inventory::list_shards;
use crate::remote::{join_key, RemoteStore};
use crate::shard::ShardDescriptor;
use crate::stream::{ImportStream, SnapshotSink};
use crate::transfer::{is_upstream, tag_upstream, CountingWriter, ProgressTracker};
use crate::transform::ShardCipher;
use crate::utils::{PipelineError, Result};
use futures_util::TryStreamExt;
use std::fmt;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncSeekExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Discover,
    Validate,
    StreamDecode,
    Sink,
    Done,
    Aborted,
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreState::Discover => "discover",
            RestoreState::Validate => "validate",
            RestoreState::StreamDecode => "stream-decode",
            RestoreState::Sink => "sink",
            RestoreState::Done => "done",
            RestoreState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub prefix: String,
    pub shards: u64,
    pub total_bytes: u64,
}

pub struct ReconstructionPipeline {
    store: Arc<dyn RemoteStore>,
    cipher: Arc<dyn ShardCipher>,
    settings: PipelineSettings,
    cancel: CancellationToken,
}

impl ReconstructionPipeline {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cipher: Arc<dyn ShardCipher>,
        settings: PipelineSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            cipher,
            settings,
            cancel,
        }
    }

    /// Rebuild the stream stored under `dest`/`prefix` into `target`.
    pub async fn run(
        &self,
        dest: &str,
        prefix: &str,
        sink: &dyn SnapshotSink,
        target: &str,
    ) -> Result<RestoreOutcome> {
        let mut state = RestoreState::Discover;
        let result = self.drive(dest, prefix, sink, target, &mut state).await;
        match &result {
            Ok(outcome) => {
                transition(&mut state, RestoreState::Done, prefix);
                info!(
                    prefix = %prefix,
                    shards = outcome.shards,
                    bytes = outcome.total_bytes,
                    "Restore complete"
                );
            }
            Err(e) => {
                warn!(prefix = %prefix, state = %state, "Restore aborted: {}", e);
                transition(&mut state, RestoreState::Aborted, prefix);
            }
        }
        result
    }

    async fn drive(
        &self,
        dest: &str,
        prefix: &str,
        sink: &dyn SnapshotSink,
        target: &str,
        state: &mut RestoreState,
    ) -> Result<RestoreOutcome> {
        let shards =
            cancellable(&self.cancel, list_shards(self.store.as_ref(), dest, prefix)).await?;

        transition(state, RestoreState::Validate, prefix);
        let total_bytes = self.validate(prefix, &shards)?;

        tokio::fs::create_dir_all(&self.settings.work_dir).await?;
        let mut import = cancellable(&self.cancel, sink.open_import(target)).await?;

        transition(state, RestoreState::StreamDecode, prefix);
        let mut tracker = ProgressTracker::new(Some(total_bytes), 0);
        for (position, shard) in shards.iter().enumerate() {
            let expected = match shards.get(position + 1) {
                Some(next) => next.byte_offset - shard.byte_offset,
                None => shard.plaintext_size().unwrap_or_default(),
            };
            if let Err(e) = self.restore_shard(dest, shard, expected, &mut import).await {
                import.abort().await;
                return Err(e);
            }
            tracker.update(shard.byte_offset + expected);
            info!(prefix = %prefix, index = shard.index, "Shard restored; {}", tracker.summary());
        }

        transition(state, RestoreState::Sink, prefix);
        cancellable(&self.cancel, import.commit()).await?;

        Ok(RestoreOutcome {
            prefix: prefix.to_string(),
            shards: shards.len() as u64,
            total_bytes,
        })
    }

    /// A restorable set is gap-free and complete. Returns its plaintext size.
    fn validate(&self, prefix: &str, shards: &[ShardDescriptor]) -> Result<u64> {
        if shards.is_empty() {
            return Err(PipelineError::MissingShard(1));
        }
        if let Some(missing) = completion::first_gap(shards) {
            return Err(PipelineError::MissingShard(missing));
        }

        let configured = self.settings.compression.label();
        let mismatched = shards
            .iter()
            .filter_map(|s| s.meta.as_ref())
            .find(|m| m.compression != configured);
        if let Some(meta) = mismatched {
            return Err(PipelineError::Config(format!(
                "shard {} uses {} compression but {} is configured",
                meta.index, meta.compression, configured
            )));
        }

        match completion::assess(shards)? {
            Completion::Complete { total_bytes, .. } => Ok(total_bytes),
            Completion::Incomplete {
                shards: count,
                stored_bytes,
                ..
            } => Err(PipelineError::BackupIncomplete(format!(
                "{} has {} shards covering {} bytes and no confirmed final shard",
                prefix, count, stored_bytes
            ))),
            Completion::Empty => Err(PipelineError::MissingShard(1)),
        }
    }

    /// Download, decrypt and decompress one shard into a temp file, check its
    /// length, then hand it to the sink.
    async fn restore_shard(
        &self,
        dest: &str,
        shard: &ShardDescriptor,
        expected: u64,
        import: &mut Box<dyn ImportStream>,
    ) -> Result<()> {
        let index = shard.index;
        let (_temp, mut file) = scratch_file(&self.settings.work_dir, ".restore-")?;
        let count = Arc::new(AtomicU64::new(0));

        let key = join_key(dest, &shard.object_name);
        let download = cancellable(&self.cancel, async {
            self.store.get(&key).await.map_err(|e| PipelineError::DownloadFailure {
                index,
                reason: e.to_string(),
            })
        })
        .await?;
        let ciphertext = StreamReader::new(download.map_err(tag_upstream));
        let plaintext = self
            .settings
            .compression
            .decoder(CountingWriter::new(&mut file, count.clone()));

        cancellable(&self.cancel, async {
            self.cipher
                .decrypt(Box::new(ciphertext), plaintext)
                .await
                .map_err(|e| {
                    if is_upstream(&e) {
                        PipelineError::DownloadFailure {
                            index,
                            reason: e.to_string(),
                        }
                    } else {
                        PipelineError::ShardTransformFailure {
                            index,
                            reason: e.to_string(),
                        }
                    }
                })
        })
        .await?;

        let actual = count.load(Ordering::Relaxed);
        if actual != expected {
            return Err(PipelineError::CorruptShard { index, expected, actual });
        }
        debug!(index, bytes = actual, "Shard decoded");

        file.seek(SeekFrom::Start(0)).await?;
        cancellable(&self.cancel, async {
            tokio::io::copy(&mut file, import)
                .await
                .map_err(|e| PipelineError::SinkFailure(e.to_string()))
        })
        .await?;
        Ok(())
    }
}

fn transition(state: &mut RestoreState, next: RestoreState, prefix: &str) {
    debug!(prefix = %prefix, from = %state, to = %next, "Restore state");
    *state = next;
}
