//! Shard size policy.

/// Smallest automatically planned shard.
pub const MIN_SHARD_SIZE: u64 = 10 * 1024 * 1024;

/// Largest automatically planned shard.
pub const MAX_SHARD_SIZE: u64 = 50 * 1024 * 1024 * 1024;

/// Used when the dataset size cannot be read.
pub const DEFAULT_SHARD_SIZE: u64 = 1024 * 1024 * 1024;

/// Number of shards an automatically planned backup aims for.
const TARGET_SHARD_COUNT: u64 = 100;

/// Plaintext bytes per shard for a dataset of `dataset_used_bytes`.
///
/// An explicit `configured` size always wins, unclamped.
pub fn plan(dataset_used_bytes: Option<u64>, configured: Option<u64>) -> u64 {
    if let Some(size) = configured {
        return size;
    }

    match dataset_used_bytes {
        Some(used) => (used / TARGET_SHARD_COUNT).clamp(MIN_SHARD_SIZE, MAX_SHARD_SIZE),
        None => DEFAULT_SHARD_SIZE,
    }
}
