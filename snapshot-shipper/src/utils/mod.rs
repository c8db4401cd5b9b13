//! Utility modules for the snapshot shipper.

pub mod errors;
pub mod logger;

pub use errors::{PipelineError, Result};
