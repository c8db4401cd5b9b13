//! Snapshot import side: where a restored stream goes.
//!
//! A sink either takes the whole stream or nothing: the restore pipeline
//! commits only after every shard verified, and aborts on any error.

use crate::config::{SinkConfig, StreamKind};
use crate::utils::{PipelineError, Result};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tempfile::NamedTempFile;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

#[async_trait]
pub trait ImportStream: AsyncWrite + Send + Unpin {
    /// Make the imported stream visible. Consumes the import.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn open_import(&self, dest: &str) -> Result<Box<dyn ImportStream>>;
}

/// Import into a child process's stdin. The process decides what a failed
/// import leaves behind; `zfs receive` discards partial streams.
pub struct ChildImport {
    stdin: ChildStdin,
    child: Child,
    label: String,
}

impl ChildImport {
    pub fn spawn(mut command: Command, label: &str) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::SinkFailure(format!("failed to start {}: {}", label, e)))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            PipelineError::SinkFailure(format!("failed to capture {} stdin", label))
        })?;

        Ok(Self {
            stdin,
            child,
            label: label.to_string(),
        })
    }
}

impl AsyncWrite for ChildImport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

#[async_trait]
impl ImportStream for ChildImport {
    async fn commit(self: Box<Self>) -> Result<()> {
        let ChildImport { mut stdin, mut child, label } = *self;
        stdin
            .shutdown()
            .await
            .map_err(|e| PipelineError::SinkFailure(format!("{}: {}", label, e)))?;
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| PipelineError::SinkFailure(format!("{}: {}", label, e)))?;
        if !status.success() {
            return Err(PipelineError::SinkFailure(format!("{} exited with {}", label, status)));
        }
        debug!("{} committed", label);
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        let ChildImport { stdin, mut child, label } = *self;
        drop(stdin);
        if let Err(e) = child.start_kill() {
            debug!("{} already exited: {}", label, e);
        }
        if let Err(e) = child.wait().await {
            warn!("Failed to reap {}: {}", label, e);
        }
    }
}

/// `zfs receive` import.
pub struct ZfsSink {
    program: String,
    force: bool,
}

impl ZfsSink {
    pub fn new(program: &str, force: bool) -> Self {
        Self {
            program: program.to_string(),
            force,
        }
    }

    fn receive_args(dest: &str, force: bool) -> Vec<String> {
        let mut args = vec!["receive".to_string()];
        if force {
            args.push("-F".to_string());
        }
        args.push(dest.to_string());
        args
    }
}

#[async_trait]
impl SnapshotSink for ZfsSink {
    async fn open_import(&self, dest: &str) -> Result<Box<dyn ImportStream>> {
        let mut command = Command::new(&self.program);
        command.args(Self::receive_args(dest, self.force));
        let import = ChildImport::spawn(command, &format!("{} receive {}", self.program, dest))?;
        Ok(Box::new(import))
    }
}

/// Import into a local file, created only on commit.
pub struct FileImport {
    file: tokio::fs::File,
    temp: NamedTempFile,
    dest: PathBuf,
}

impl AsyncWrite for FileImport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait]
impl ImportStream for FileImport {
    async fn commit(self: Box<Self>) -> Result<()> {
        let FileImport { mut file, temp, dest } = *self;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        temp.persist_noclobber(&dest).map_err(|e| {
            PipelineError::SinkFailure(format!("{}: {}", dest.display(), e.error))
        })?;
        debug!(dest = %dest.display(), "Restored stream written");
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        // Dropping the temp file removes it.
        debug!(dest = %self.dest.display(), "Discarding partial restore");
    }
}

#[derive(Default)]
pub struct FileSink;

#[async_trait]
impl SnapshotSink for FileSink {
    async fn open_import(&self, dest: &str) -> Result<Box<dyn ImportStream>> {
        let dest = PathBuf::from(dest);
        if tokio::fs::try_exists(&dest).await? {
            return Err(PipelineError::SinkFailure(format!(
                "{} already exists; refusing to overwrite",
                dest.display()
            )));
        }
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => Path::new(".").to_path_buf(),
        };

        let temp = tempfile::Builder::new()
            .prefix(".restore-")
            .tempfile_in(&parent)
            .map_err(|e| PipelineError::SinkFailure(format!("{}: {}", parent.display(), e)))?;
        let file = tokio::fs::File::from_std(temp.as_file().try_clone()?);

        Ok(Box::new(FileImport { file, temp, dest }))
    }
}

pub fn from_config(config: &SinkConfig) -> Box<dyn SnapshotSink> {
    match config.kind {
        StreamKind::Zfs => Box::new(ZfsSink::new(&config.program, config.force)),
        StreamKind::File => Box::new(FileSink),
    }
}
