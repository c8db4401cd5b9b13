//! Byte accounting for data moving through the pipelines.

pub mod counting;
pub mod progress;

pub use counting::{is_upstream, tag_upstream, CountingReader, CountingWriter, ProgressCallback};
pub use progress::{format_bytes, format_duration, format_speed, ProgressTracker};
