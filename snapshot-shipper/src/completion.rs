//! Completion detection from the remote inventory alone.
//!
//! A backup is complete when its shards form an unbroken run `1..=N` and
//! shard `N` is confirmed final by its sidecar. Finality is a plaintext fact
//! recorded when the shard was produced; ciphertext sizes say nothing about it.

use crate::shard::ShardDescriptor;
use crate::utils::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// No shards stored.
    Empty,
    /// Shards `1..=shards` exist but the last is not confirmed final.
    Incomplete {
        shards: u64,
        /// Plaintext bytes a resumed run can skip.
        stored_bytes: u64,
        /// Index of the shard a resumed run produces first. Equal to `shards`
        /// when the last shard has no sidecar and must be redone.
        resumable_from: u64,
    },
    Complete { shards: u64, total_bytes: u64 },
}

impl Completion {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completion::Complete { .. })
    }
}

/// First index missing from an index-sorted shard list, if any.
pub fn first_gap(shards: &[ShardDescriptor]) -> Option<u64> {
    let mut expected = 1;
    for shard in shards {
        if shard.index > expected {
            return Some(expected);
        }
        expected = expected.max(shard.index + 1);
    }
    None
}

/// Check that an index-sorted shard list is a structurally valid run:
/// indices `1..=N` without gaps or duplicates, offsets starting at zero and
/// agreeing with sidecar sizes, no final shard before the last, and every
/// sidecar naming the same export.
pub fn validate_run(shards: &[ShardDescriptor]) -> Result<()> {
    if let Some(missing) = first_gap(shards) {
        return Err(PipelineError::InconsistentRemoteState(format!(
            "shard {} is missing",
            missing
        )));
    }

    let mut sidecars = shards.iter().filter_map(|s| s.meta.as_ref());
    if let Some(first) = sidecars.next() {
        let source = first.source_identifier.as_str();
        let since = first.since_identifier.as_deref();
        if let Some(other) = sidecars.find(|m| !m.exported_from(source, since)) {
            return Err(PipelineError::InconsistentRemoteState(format!(
                "shard {} was exported from {} but shard {} from {}",
                other.index, other.source_identifier, first.index, source
            )));
        }
    }

    for (position, shard) in shards.iter().enumerate() {
        let expected_index = position as u64 + 1;
        if shard.index != expected_index {
            return Err(PipelineError::InconsistentRemoteState(format!(
                "duplicate shard index {}",
                shard.index
            )));
        }
        if position == 0 && shard.byte_offset != 0 {
            return Err(PipelineError::InconsistentRemoteState(format!(
                "first shard starts at offset {}",
                shard.byte_offset
            )));
        }

        let Some(next) = shards.get(position + 1) else {
            continue;
        };
        if next.byte_offset <= shard.byte_offset {
            return Err(PipelineError::InconsistentRemoteState(format!(
                "shard {} offset {} does not follow shard {} offset {}",
                next.index, next.byte_offset, shard.index, shard.byte_offset
            )));
        }
        if shard.is_confirmed_final() {
            return Err(PipelineError::InconsistentRemoteState(format!(
                "shard {} is marked final but shard {} exists",
                shard.index, next.index
            )));
        }
        if let Some(end) = shard.end_offset() {
            if end != next.byte_offset {
                return Err(PipelineError::InconsistentRemoteState(format!(
                    "shard {} ends at offset {} but shard {} starts at {}",
                    shard.index, end, next.index, next.byte_offset
                )));
            }
        }
    }
    Ok(())
}

/// Classify a validated, index-sorted shard list.
pub fn assess(shards: &[ShardDescriptor]) -> Result<Completion> {
    validate_run(shards)?;

    let Some(last) = shards.last() else {
        return Ok(Completion::Empty);
    };
    let count = shards.len() as u64;

    match last.end_offset() {
        Some(end) if last.is_confirmed_final() => Ok(Completion::Complete {
            shards: count,
            total_bytes: end,
        }),
        Some(end) => Ok(Completion::Incomplete {
            shards: count,
            stored_bytes: end,
            resumable_from: last.index + 1,
        }),
        None => Ok(Completion::Incomplete {
            shards: count,
            stored_bytes: last.byte_offset,
            resumable_from: last.index,
        }),
    }
}

/// True only for a valid run whose last shard is confirmed final.
pub fn is_complete(shards: &[ShardDescriptor]) -> bool {
    matches!(assess(shards), Ok(Completion::Complete { .. }))
}
