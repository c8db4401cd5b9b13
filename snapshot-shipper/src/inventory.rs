//! Remote inventory: what a destination already holds.
//!
//! Shard objects are self-describing by name; sidecars add the plaintext
//! facts. Listing results are the only source of truth about remote state.

use crate::completion::{self, Completion};
use crate::remote::{join_key, RemoteStore};
use crate::shard::naming::{classify, parse_any};
use crate::shard::{NameMatch, ShardDescriptor, ShardMeta};
use crate::utils::{PipelineError, Result};
use futures_util::{stream, StreamExt, TryStreamExt};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

/// Sidecar downloads in flight while listing.
const SIDECAR_FETCH_CONCURRENCY: usize = 8;

/// Read a small object fully into memory.
pub async fn read_object(store: &dyn RemoteStore, key: &str) -> Result<Vec<u8>> {
    let mut stream = store.get(key).await?;
    let mut data = Vec::new();
    while let Some(chunk) = stream.try_next().await? {
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

async fn fetch_meta(
    store: &dyn RemoteStore,
    dest: &str,
    shard: &ShardDescriptor,
) -> Result<ShardMeta> {
    let sidecar = format!("{}{}", shard.object_name, crate::shard::SIDECAR_SUFFIX);
    let bytes = read_object(store, &join_key(dest, &sidecar)).await?;
    let meta: ShardMeta = serde_json::from_slice(&bytes).map_err(|e| {
        PipelineError::InconsistentRemoteState(format!("unreadable sidecar {}: {}", sidecar, e))
    })?;

    if meta.index != shard.index || meta.byte_offset != shard.byte_offset {
        return Err(PipelineError::InconsistentRemoteState(format!(
            "sidecar {} describes shard {} at offset {}",
            sidecar, meta.index, meta.byte_offset
        )));
    }
    if meta.ciphertext_size != shard.ciphertext_size {
        return Err(PipelineError::InconsistentRemoteState(format!(
            "{} holds {} bytes but its sidecar recorded {}",
            shard.object_name, shard.ciphertext_size, meta.ciphertext_size
        )));
    }
    Ok(meta)
}

/// Shards of `prefix` under `dest`, sorted by index, with sidecars attached.
///
/// Malformed names and duplicate indices are reported rather than skipped:
/// either would make resume or restore silently wrong.
pub async fn list_shards(
    store: &dyn RemoteStore,
    dest: &str,
    prefix: &str,
) -> Result<Vec<ShardDescriptor>> {
    let objects = store.list(dest).await?;

    let mut shards = Vec::new();
    let mut sidecars = HashSet::new();
    for object in objects {
        match classify(prefix, &object.name) {
            NameMatch::Shard(name) => shards.push(ShardDescriptor {
                index: name.index,
                byte_offset: name.byte_offset,
                object_name: object.name,
                ciphertext_size: object.size,
                meta: None,
            }),
            NameMatch::Sidecar(name) => {
                sidecars.insert(name.object_name());
            }
            NameMatch::Malformed(reason) => {
                return Err(PipelineError::InconsistentRemoteState(format!(
                    "malformed shard name {}",
                    reason
                )))
            }
            NameMatch::Unrelated => {}
        }
    }

    shards.sort_by_key(|s| s.index);
    if let Some(pair) = shards.windows(2).find(|w| w[0].index == w[1].index) {
        return Err(PipelineError::InconsistentRemoteState(format!(
            "shard {} stored twice: {} and {}",
            pair[0].index, pair[0].object_name, pair[1].object_name
        )));
    }

    let shard_names: HashSet<&str> = shards.iter().map(|s| s.object_name.as_str()).collect();
    for orphan in sidecars.iter().filter(|n| !shard_names.contains(n.as_str())) {
        warn!(prefix = %prefix, "Ignoring sidecar without shard: {}", orphan);
    }

    let shards: Vec<ShardDescriptor> = stream::iter(shards)
        .map(|mut shard| {
            let has_sidecar = sidecars.contains(&shard.object_name);
            async move {
                if has_sidecar {
                    shard.meta = Some(fetch_meta(store, dest, &shard).await?);
                }
                Ok::<_, PipelineError>(shard)
            }
        })
        .buffered(SIDECAR_FETCH_CONCURRENCY)
        .try_collect()
        .await?;

    debug!(prefix = %prefix, dest = %dest, "Found {} stored shards", shards.len());
    Ok(shards)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupStatus {
    Assessed(Completion),
    /// The stored shards cannot be resumed or restored as they are.
    Inconsistent(String),
}

/// One backup run found under a destination.
#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub prefix: String,
    pub status: BackupStatus,
    /// Export recorded by the first sidecar; unknown without one.
    pub source_identifier: Option<String>,
    pub since_identifier: Option<String>,
}

impl BackupSummary {
    pub fn is_incomplete(&self) -> bool {
        matches!(self.status, BackupStatus::Assessed(Completion::Incomplete { .. }))
    }

    /// True only when a sidecar proves this run exports `source` since `since`.
    pub fn exports(&self, source: &str, since: Option<&str>) -> bool {
        self.source_identifier.as_deref() == Some(source)
            && self.since_identifier.as_deref() == since
    }
}

/// Chronological sort key for a `<kind>-<timestamp>` prefix.
fn prefix_order(prefix: &str) -> (&str, &str) {
    let stamp = prefix.split_once('-').map(|(_, rest)| rest).unwrap_or(prefix);
    (stamp, prefix)
}

/// Every backup run with at least one shard under `dest`, oldest first.
pub async fn discover_backups(store: &dyn RemoteStore, dest: &str) -> Result<Vec<BackupSummary>> {
    let objects = store.list(dest).await?;
    let prefixes: BTreeSet<String> = objects
        .iter()
        .filter_map(|object| match parse_any(&object.name) {
            Some(NameMatch::Shard(name)) => Some(name.prefix),
            _ => None,
        })
        .collect();

    let mut summaries = Vec::with_capacity(prefixes.len());
    for prefix in prefixes {
        let shards = match list_shards(store, dest, &prefix).await {
            Ok(shards) => shards,
            Err(e @ PipelineError::InconsistentRemoteState(_)) => {
                summaries.push(BackupSummary {
                    prefix,
                    status: BackupStatus::Inconsistent(e.to_string()),
                    source_identifier: None,
                    since_identifier: None,
                });
                continue;
            }
            Err(e) => return Err(e),
        };

        let status = match completion::assess(&shards) {
            Ok(state) => BackupStatus::Assessed(state),
            Err(e) => BackupStatus::Inconsistent(e.to_string()),
        };
        let first = shards.iter().find_map(|s| s.meta.as_ref());
        summaries.push(BackupSummary {
            prefix,
            status,
            source_identifier: first.map(|m| m.source_identifier.clone()),
            since_identifier: first.and_then(|m| m.since_identifier.clone()),
        });
    }

    summaries.sort_by(|a, b| prefix_order(&a.prefix).cmp(&prefix_order(&b.prefix)));
    Ok(summaries)
}

/// The newest resumable backup of the export of `source` since `since`.
/// Runs without any sidecar cannot prove what they hold and are skipped.
pub fn latest_incomplete<'a>(
    summaries: &'a [BackupSummary],
    source: &str,
    since: Option<&str>,
) -> Option<&'a BackupSummary> {
    summaries
        .iter()
        .rev()
        .find(|s| s.is_incomplete() && s.exports(source, since))
}

/// Delete every shard object and sidecar belonging to `prefix`, including
/// malformed names. Sidecars go first so a partial discard never leaves a
/// shard that looks confirmed. Returns the number of deleted objects.
pub async fn discard_backup(store: &dyn RemoteStore, dest: &str, prefix: &str) -> Result<usize> {
    let objects = store.list(dest).await?;

    let mut sidecars = Vec::new();
    let mut shards = Vec::new();
    for object in objects {
        match classify(prefix, &object.name) {
            NameMatch::Sidecar(_) => sidecars.push(object.name),
            NameMatch::Shard(_) | NameMatch::Malformed(_) => shards.push(object.name),
            NameMatch::Unrelated => {}
        }
    }

    let mut deleted = 0;
    for name in sidecars.into_iter().chain(shards) {
        store.delete(&join_key(dest, &name)).await?;
        debug!("Deleted {}", name);
        deleted += 1;
    }
    info!(prefix = %prefix, dest = %dest, "Discarded {} objects", deleted);
    Ok(deleted)
}
