//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the running job's token. The pipelines then drop the
//! shard in flight: its temp file is removed, child processes are killed and
//! an unfinished upload never becomes visible, so the next run resumes.

use std::io;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for SIGINT or SIGTERM and return the signal's name.
#[cfg(unix)]
pub async fn wait_for_signal() -> io::Result<&'static str> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> io::Result<&'static str> {
    signal::ctrl_c().await.map(|_| "SIGINT")
}

/// Cancel `token` on the first SIGINT or SIGTERM. The watcher exits quietly
/// if the token is cancelled some other way first.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            received = wait_for_signal() => match received {
                Ok(name) => {
                    info!("Received {}, stopping after cleanup of the current shard", name);
                    token.cancel();
                }
                Err(e) => warn!("Failed to install signal handlers: {}", e),
            },
        }
    })
}
