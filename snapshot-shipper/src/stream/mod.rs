//! Snapshot stream adapters.

pub mod sink;
pub mod source;

pub use sink::{ChildImport, FileSink, ImportStream, SnapshotSink, ZfsSink};
pub use source::{ExportStream, FileSource, SnapshotSource, ZfsSource};
