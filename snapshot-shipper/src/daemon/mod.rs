//! Process-level concerns: job locks and signal handling.

pub mod lock;
pub mod shutdown;

pub use lock::{JobLock, LockError};
pub use shutdown::cancel_on_signal;
