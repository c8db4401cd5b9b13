//! Shard model: names, per-shard metadata, and size planning.

pub mod naming;
pub mod planner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use naming::{NameMatch, ShardName, SIDECAR_SUFFIX};
pub use planner::plan;

/// Plaintext facts captured when a shard was produced.
///
/// Serialized as the shard's `.meta.json` sidecar and uploaded after the shard
/// object itself, so its presence implies the shard object is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMeta {
    pub index: u64,
    pub byte_offset: u64,
    pub plaintext_size: u64,
    pub ciphertext_size: u64,
    pub is_final: bool,
    pub compression: String,
    /// Snapshot the stream was exported from.
    pub source_identifier: String,
    /// Base snapshot of an incremental export.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_identifier: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ShardMeta {
    /// Whether this shard came from the export of `source` since `since`.
    pub fn exported_from(&self, source: &str, since: Option<&str>) -> bool {
        self.source_identifier == source && self.since_identifier.as_deref() == since
    }
}

/// A shard discovered in the remote store.
#[derive(Debug, Clone)]
pub struct ShardDescriptor {
    pub index: u64,
    pub byte_offset: u64,
    pub object_name: String,
    pub ciphertext_size: u64,
    /// Sidecar metadata, absent if the run died between the two uploads.
    pub meta: Option<ShardMeta>,
}

impl ShardDescriptor {
    pub fn plaintext_size(&self) -> Option<u64> {
        self.meta.as_ref().map(|m| m.plaintext_size)
    }

    /// True only when the sidecar recorded this shard as the last one.
    pub fn is_confirmed_final(&self) -> bool {
        self.meta.as_ref().is_some_and(|m| m.is_final)
    }

    /// Offset one past this shard's last plaintext byte, when known.
    pub fn end_offset(&self) -> Option<u64> {
        self.plaintext_size().map(|size| self.byte_offset + size)
    }
}
