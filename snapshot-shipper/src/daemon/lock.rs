//! Cross-process job locks.
//!
//! Two runs against the same dataset or backup prefix would race on the same
//! shard names. Each job holds an exclusive `flock` on a per-resource file
//! for its whole lifetime; the kernel drops it if the process dies.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{resource} is locked by another run ({holder})")]
    Busy { resource: String, holder: String },

    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held for as long as the job runs. Dropping it releases the lock.
pub struct JobLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl JobLock {
    /// Take the lock for `resource` (e.g. `tank/data`) without waiting.
    pub fn acquire(lock_dir: &Path, resource: &str) -> Result<Self, LockError> {
        let path = lock_dir.join(format!("{}.lock", sanitize(resource)));
        let io_error = |source: io::Error| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(lock_dir).map_err(io_error)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((mut file, Errno::EWOULDBLOCK)) => {
                let mut holder = String::new();
                let _ = file.read_to_string(&mut holder);
                return Err(LockError::Busy {
                    resource: resource.to_string(),
                    holder: holder.trim().to_string(),
                });
            }
            Err((_, errno)) => return Err(io_error(io::Error::from(errno))),
        };

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        lock.set_len(0).map_err(io_error)?;
        lock.seek(SeekFrom::Start(0)).map_err(io_error)?;
        writeln!(lock, "{} pid {}", host, std::process::id()).map_err(io_error)?;

        debug!(path = %path.display(), "Acquired job lock");
        Ok(Self { _lock: lock, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sanitize(resource: &str) -> String {
    resource
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}
