//! Snapshot Shipper Library
//!
//! Ships filesystem snapshot streams to object storage as numbered,
//! compressed and encrypted shards, resumes interrupted runs from whatever
//! is already stored, and rebuilds the stream on restore.

pub mod completion;
pub mod config;
pub mod daemon;
pub mod inventory;
pub mod pipeline;
pub mod remote;
pub mod shard;
pub mod stream;
pub mod transfer;
pub mod transform;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::PipelineError;
pub use utils::errors::Result;
