//! Shard pipeline: snapshot stream in, encrypted shard objects out.
//!
//! The stream is cut into shards of `target` plaintext bytes. Each shard is
//! compressed and encrypted into a temp file, uploaded atomically, verified,
//! and then described by a sidecar. A rerun lists what is already stored and
//! continues after the last confirmed shard, so interrupted jobs resume
//! instead of restarting.

use super::{cancellable, scratch_file, PipelineSettings};
use crate::completion;
use crate::inventory::list_shards;
use crate::remote::{join_key, RemoteStore};
use crate::shard::{self, ShardDescriptor, ShardMeta, ShardName};
use crate::stream::{ExportStream, SnapshotSource};
use crate::transfer::{is_upstream, CountingReader, ProgressCallback, ProgressTracker};
use crate::transform::{shard_ext, ShardCipher};
use crate::utils::{PipelineError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Read-ahead on the export stream.
const SOURCE_BUFFER_SIZE: usize = 1024 * 1024;

/// What to back up and where.
#[derive(Debug, Clone)]
pub struct BackupJob {
    /// Snapshot to export, e.g. `tank/data@2024-06-01`.
    pub source_identifier: String,
    /// Base snapshot for an incremental export.
    pub since_identifier: Option<String>,
    /// Names every shard of this run. Never changes once chosen.
    pub backup_prefix: String,
    /// Directory on the remote holding the shards.
    pub destination_path: String,
}

impl BackupJob {
    /// `full-20240601T120000Z` or `incr-20240601T120000Z`.
    pub fn derive_prefix(incremental: bool, at: DateTime<Utc>) -> String {
        let kind = if incremental { "incr" } else { "full" };
        format!("{}-{}", kind, at.format("%Y%m%dT%H%M%SZ"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Planning,
    Resuming,
    Streaming,
    Buffering,
    FinalizingShard,
    Uploading,
    Done,
    Aborted,
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupState::Planning => "planning",
            BackupState::Resuming => "resuming",
            BackupState::Streaming => "streaming",
            BackupState::Buffering => "buffering",
            BackupState::FinalizingShard => "finalizing-shard",
            BackupState::Uploading => "uploading",
            BackupState::Done => "done",
            BackupState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub prefix: String,
    /// Shards uploaded by this run.
    pub shards_written: u64,
    /// Shards stored in total once this run finished.
    pub total_shards: u64,
    /// Plaintext bytes covered by all stored shards.
    pub total_bytes: u64,
    /// Plaintext bytes skipped because earlier runs stored them.
    pub resumed_from: u64,
}

/// Where a run starts, derived from the stored shards.
#[derive(Debug, Clone)]
pub enum ResumePlan {
    Fresh,
    AlreadyComplete { shards: u64, total_bytes: u64 },
    /// The last stored shard is confirmed and not final.
    Continue { skip: u64, next_index: u64, previous: ShardDescriptor },
    /// The last stored shard has no sidecar; produce it again.
    Redo { skip: u64, next_index: u64 },
}

impl ResumePlan {
    pub fn skip(&self) -> u64 {
        match self {
            ResumePlan::Fresh => 0,
            ResumePlan::AlreadyComplete { total_bytes, .. } => *total_bytes,
            ResumePlan::Continue { skip, .. } | ResumePlan::Redo { skip, .. } => *skip,
        }
    }

    pub fn next_index(&self) -> u64 {
        match self {
            ResumePlan::Fresh => 1,
            ResumePlan::AlreadyComplete { shards, .. } => shards + 1,
            ResumePlan::Continue { next_index, .. } | ResumePlan::Redo { next_index, .. } => {
                *next_index
            }
        }
    }
}

/// Decide where to start from an index-sorted shard list.
pub fn plan_resume(shards: &[ShardDescriptor]) -> Result<ResumePlan> {
    completion::validate_run(shards)?;

    let Some(last) = shards.last() else {
        return Ok(ResumePlan::Fresh);
    };
    Ok(match last.end_offset() {
        Some(end) if last.is_confirmed_final() => ResumePlan::AlreadyComplete {
            shards: last.index,
            total_bytes: end,
        },
        Some(end) => ResumePlan::Continue {
            skip: end,
            next_index: last.index + 1,
            previous: last.clone(),
        },
        None => ResumePlan::Redo {
            skip: last.byte_offset,
            next_index: last.index,
        },
    })
}

/// A transformed shard waiting in a temp file.
struct BufferedShard {
    temp: NamedTempFile,
    plaintext_size: u64,
    ciphertext_size: u64,
}

/// The backup engine. One instance can run many jobs, one at a time.
pub struct ShardPipeline {
    store: Arc<dyn RemoteStore>,
    cipher: Arc<dyn ShardCipher>,
    settings: PipelineSettings,
    cancel: CancellationToken,
    ext: String,
}

impl ShardPipeline {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cipher: Arc<dyn ShardCipher>,
        settings: PipelineSettings,
        cancel: CancellationToken,
    ) -> Self {
        let ext = shard_ext(settings.compression, cipher.as_ref());
        Self {
            store,
            cipher,
            settings,
            cancel,
            ext,
        }
    }

    /// Plan the shard size from the source's reported size, then run.
    pub async fn run_planned(
        &self,
        job: &BackupJob,
        source: &dyn SnapshotSource,
        configured_size: Option<u64>,
    ) -> Result<BackupOutcome> {
        let estimate = source.used_bytes(&job.source_identifier).await;
        let target = shard::plan(estimate, configured_size);
        info!(
            prefix = %job.backup_prefix,
            estimate = ?estimate,
            target,
            "Planned shard size"
        );
        self.execute(job, source, target, estimate).await
    }

    /// Store `job`'s stream as shards of `target` plaintext bytes, resuming
    /// after whatever a previous run already stored.
    pub async fn run(
        &self,
        job: &BackupJob,
        source: &dyn SnapshotSource,
        target: u64,
    ) -> Result<BackupOutcome> {
        self.execute(job, source, target, None).await
    }

    async fn execute(
        &self,
        job: &BackupJob,
        source: &dyn SnapshotSource,
        target: u64,
        estimate: Option<u64>,
    ) -> Result<BackupOutcome> {
        if target == 0 {
            return Err(PipelineError::Config("shard size must be positive".into()));
        }
        let mut state = BackupState::Planning;
        let result = self.drive(job, source, target, estimate, &mut state).await;
        match &result {
            Ok(outcome) => {
                transition(&mut state, BackupState::Done, &job.backup_prefix);
                info!(
                    prefix = %outcome.prefix,
                    written = outcome.shards_written,
                    total = outcome.total_shards,
                    "Backup complete"
                );
            }
            Err(e) => {
                warn!(prefix = %job.backup_prefix, state = %state, "Backup aborted: {}", e);
                transition(&mut state, BackupState::Aborted, &job.backup_prefix);
            }
        }
        result
    }

    async fn drive(
        &self,
        job: &BackupJob,
        source: &dyn SnapshotSource,
        target: u64,
        estimate: Option<u64>,
        state: &mut BackupState,
    ) -> Result<BackupOutcome> {
        let prefix = job.backup_prefix.as_str();
        let dest = job.destination_path.as_str();

        transition(state, BackupState::Resuming, prefix);
        let stored =
            cancellable(&self.cancel, list_shards(self.store.as_ref(), dest, prefix)).await?;
        let plan = plan_resume(&stored)?;
        self.check_compatible(job, &stored)?;

        if let ResumePlan::AlreadyComplete { shards, total_bytes } = plan {
            info!(prefix = %prefix, shards, "Backup already complete; nothing to do");
            return Ok(BackupOutcome {
                prefix: prefix.to_string(),
                shards_written: 0,
                total_shards: shards,
                total_bytes,
                resumed_from: total_bytes,
            });
        }

        let skip = plan.skip();
        let mut index = plan.next_index();
        if skip > 0 {
            info!(
                prefix = %prefix,
                skip,
                next = index,
                "Resuming after {} stored shards",
                stored.len()
            );
        }
        let mut previous: Option<(String, ShardMeta)> = match &plan {
            ResumePlan::Continue { previous, .. } => previous
                .meta
                .clone()
                .map(|meta| (previous.object_name.clone(), meta)),
            _ => None,
        };

        tokio::fs::create_dir_all(&self.settings.work_dir).await?;
        let export = cancellable(
            &self.cancel,
            source.open_export(&job.source_identifier, job.since_identifier.as_deref()),
        )
        .await?;
        let mut reader = BufReader::with_capacity(SOURCE_BUFFER_SIZE, export);

        transition(state, BackupState::Streaming, prefix);
        if skip > 0 {
            let skipped = cancellable(&self.cancel, async {
                tokio::io::copy(&mut (&mut reader).take(skip), &mut tokio::io::sink())
                    .await
                    .map_err(source_error)
            })
            .await?;
            if skipped < skip {
                self.finish_export(&mut reader).await?;
                return Err(PipelineError::InconsistentRemoteState(format!(
                    "source ended at byte {} but stored shards cover {} bytes",
                    skipped, skip
                )));
            }
        }

        let mut tracker = ProgressTracker::new(estimate, skip);
        let mut offset = skip;
        let mut written = 0;

        loop {
            transition(state, BackupState::Buffering, prefix);
            tracker.progress_mut().set_current_shard(index);
            let shard = self.buffer_shard(&mut reader, index, offset, target).await?;

            if shard.plaintext_size == 0 {
                self.finish_export(&mut reader).await?;
                match previous.take() {
                    Some((object_name, meta)) if !meta.is_final => {
                        self.seal(dest, &object_name, meta).await?;
                    }
                    Some(_) => {}
                    // Zero bytes end a stream normally, but a backup with no
                    // shard could never be confirmed complete or restored.
                    None if offset == 0 => {
                        return Err(PipelineError::SourceUnavailable(format!(
                            "{} produced an empty stream; nothing to back up",
                            job.source_identifier
                        )))
                    }
                    None => {
                        return Err(PipelineError::InconsistentRemoteState(format!(
                            "source ended at byte {} where stored shard {} begins",
                            offset, index
                        )))
                    }
                }
                break;
            }

            transition(state, BackupState::FinalizingShard, prefix);
            let is_final = shard.plaintext_size < target || self.at_end(&mut reader).await?;
            if is_final {
                self.finish_export(&mut reader).await?;
            }

            transition(state, BackupState::Uploading, prefix);
            let name = ShardName::new(prefix, index, offset, &self.ext);
            let meta = self.upload_shard(job, &name, &shard, is_final).await?;
            drop(shard);

            offset += meta.plaintext_size;
            written += 1;
            tracker.update(offset);
            tracker.progress_mut().finish_shard();
            info!(
                prefix = %prefix,
                index,
                plaintext = meta.plaintext_size,
                ciphertext = meta.ciphertext_size,
                is_final,
                "Shard stored; {}",
                tracker.summary()
            );

            previous = Some((name.object_name(), meta));
            if is_final {
                break;
            }
            index += 1;
        }

        let total_shards = match &previous {
            Some((_, meta)) => meta.index,
            None => index.saturating_sub(1),
        };
        Ok(BackupOutcome {
            prefix: prefix.to_string(),
            shards_written: written,
            total_shards,
            total_bytes: offset,
            resumed_from: skip,
        })
    }

    /// Refuse to extend a backup of a different export or one produced with
    /// a different compression.
    fn check_compatible(&self, job: &BackupJob, stored: &[ShardDescriptor]) -> Result<()> {
        let since = job.since_identifier.as_deref();
        let configured = self.settings.compression.label();
        for meta in stored.iter().filter_map(|s| s.meta.as_ref()) {
            if !meta.exported_from(&job.source_identifier, since) {
                return Err(PipelineError::Config(format!(
                    "{} holds an export of {} (since {}), not {} (since {})",
                    job.backup_prefix,
                    meta.source_identifier,
                    meta.since_identifier.as_deref().unwrap_or("nothing"),
                    job.source_identifier,
                    since.unwrap_or("nothing")
                )));
            }
            if meta.compression != configured {
                return Err(PipelineError::Config(format!(
                    "stored shards use {} compression but {} is configured",
                    meta.compression, configured
                )));
            }
        }
        Ok(())
    }

    /// Read up to `target` plaintext bytes through compress and encrypt into
    /// a temp file.
    async fn buffer_shard(
        &self,
        reader: &mut BufReader<ExportStream>,
        index: u64,
        offset: u64,
        target: u64,
    ) -> Result<BufferedShard> {
        let (temp, mut file) = scratch_file(&self.settings.work_dir, ".shard-")?;
        let count = Arc::new(AtomicU64::new(0));

        let progress: ProgressCallback =
            Arc::new(move |n| trace!(index, offset = offset + n, "Reading shard"));
        let counted = CountingReader::new((&mut *reader).take(target), count.clone())
            .with_progress(progress);
        let plaintext = self.settings.compression.encoder(BufReader::new(counted));

        cancellable(&self.cancel, async {
            self.cipher
                .encrypt(plaintext, Box::new(&mut file))
                .await
                .map_err(|e| transform_error(index, e))
        })
        .await?;
        drop(file);

        let plaintext_size = count.load(Ordering::Relaxed);
        let ciphertext_size = tokio::fs::metadata(temp.path()).await?.len();
        debug!(index, plaintext_size, ciphertext_size, "Shard buffered");
        Ok(BufferedShard {
            temp,
            plaintext_size,
            ciphertext_size,
        })
    }

    /// Whether the source has no bytes left after a full shard.
    async fn at_end(&self, reader: &mut BufReader<ExportStream>) -> Result<bool> {
        cancellable(&self.cancel, async {
            reader.fill_buf().await.map(|buf| buf.is_empty()).map_err(source_error)
        })
        .await
    }

    async fn finish_export(&self, reader: &mut BufReader<ExportStream>) -> Result<()> {
        cancellable(&self.cancel, reader.get_mut().finish()).await
    }

    /// Upload, verify, then describe. The sidecar goes last so its presence
    /// implies a complete object.
    async fn upload_shard(
        &self,
        job: &BackupJob,
        name: &ShardName,
        shard: &BufferedShard,
        is_final: bool,
    ) -> Result<ShardMeta> {
        let dest = job.destination_path.as_str();
        let index = name.index;
        let key = join_key(dest, &name.object_name());
        let upload_error = |reason: String| PipelineError::UploadFailure { index, reason };

        cancellable(&self.cancel, async {
            self.store
                .put_file(&key, shard.temp.path())
                .await
                .map_err(|e| upload_error(e.to_string()))
        })
        .await?;

        let stored = cancellable(&self.cancel, async {
            self.store.head(&key).await.map_err(|e| upload_error(e.to_string()))
        })
        .await?;
        match stored {
            Some(object) if object.size == shard.ciphertext_size => {}
            Some(object) => {
                return Err(upload_error(format!(
                    "stored {} bytes, expected {}",
                    object.size, shard.ciphertext_size
                )))
            }
            None => return Err(upload_error("object not visible after upload".into())),
        }

        let meta = ShardMeta {
            index,
            byte_offset: name.byte_offset,
            plaintext_size: shard.plaintext_size,
            ciphertext_size: shard.ciphertext_size,
            is_final,
            compression: self.settings.compression.label().to_string(),
            source_identifier: job.source_identifier.clone(),
            since_identifier: job.since_identifier.clone(),
            created_at: Utc::now(),
        };
        self.put_sidecar(&join_key(dest, &name.sidecar_name()), &meta)
            .await?;
        Ok(meta)
    }

    async fn put_sidecar(&self, key: &str, meta: &ShardMeta) -> Result<()> {
        let index = meta.index;
        let body = serde_json::to_vec_pretty(meta).map_err(|e| PipelineError::UploadFailure {
            index,
            reason: e.to_string(),
        })?;
        cancellable(&self.cancel, async {
            self.store
                .put(key, Bytes::from(body))
                .await
                .map_err(|e| PipelineError::UploadFailure {
                    index,
                    reason: e.to_string(),
                })
        })
        .await
    }

    /// The stream ended exactly where the stored shards do: the last stored
    /// shard was final after all. Only its sidecar changes.
    async fn seal(&self, dest: &str, object_name: &str, mut meta: ShardMeta) -> Result<()> {
        meta.is_final = true;
        let key = join_key(dest, &format!("{}{}", object_name, shard::SIDECAR_SUFFIX));
        self.put_sidecar(&key, &meta).await?;
        info!(index = meta.index, "Marked stored shard {} as final", object_name);
        Ok(())
    }
}

fn transition(state: &mut BackupState, next: BackupState, prefix: &str) {
    debug!(prefix = %prefix, from = %state, to = %next, "Backup state");
    *state = next;
}

fn source_error(e: io::Error) -> PipelineError {
    PipelineError::SourceUnavailable(e.to_string())
}

fn transform_error(index: u64, e: io::Error) -> PipelineError {
    if is_upstream(&e) {
        source_error(e)
    } else {
        PipelineError::ShardTransformFailure {
            index,
            reason: e.to_string(),
        }
    }
}
