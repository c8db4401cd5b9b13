//! Snapshot export side: where the plaintext stream comes from.

use crate::config::{SourceConfig, StreamKind};
use crate::utils::{PipelineError, Result};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Produces a deterministic byte stream for a snapshot.
///
/// Opening the same `(source, since)` twice must yield identical bytes;
/// resume depends on it.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn open_export(&self, source: &str, since: Option<&str>) -> Result<ExportStream>;

    /// Approximate stream size, used for shard planning and progress only.
    async fn used_bytes(&self, source: &str) -> Option<u64>;
}

/// An open export, optionally backed by a child process.
pub struct ExportStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    child: Option<Child>,
    label: String,
}

impl ExportStream {
    pub fn from_reader(label: &str, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            child: None,
            label: label.to_string(),
        }
    }

    /// Spawn `command` and stream its stdout. The child is killed if the
    /// stream is dropped before [`ExportStream::finish`].
    pub fn spawn(mut command: Command, label: &str) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PipelineError::SourceUnavailable(format!("failed to start {}: {}", label, e))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            PipelineError::SourceUnavailable(format!("failed to capture {} stdout", label))
        })?;

        Ok(Self {
            reader: Box::new(stdout),
            child: Some(child),
            label: label.to_string(),
        })
    }

    /// Confirm the producer exited cleanly. Call after reading to EOF; a
    /// truncated stream from a failed export must never be stored as final.
    pub async fn finish(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .await
            .map_err(|e| PipelineError::SourceUnavailable(format!("{}: {}", self.label, e)))?;
        if !status.success() {
            return Err(PipelineError::SourceUnavailable(format!(
                "{} exited with {}",
                self.label, status
            )));
        }
        debug!("{} finished", self.label);
        Ok(())
    }
}

impl AsyncRead for ExportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

/// `zfs send` export.
pub struct ZfsSource {
    program: String,
}

impl ZfsSource {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    fn send_args(snapshot: &str, since: Option<&str>) -> Vec<String> {
        let mut args = vec!["send".to_string()];
        if let Some(base) = since {
            args.push("-i".to_string());
            args.push(base.to_string());
        }
        args.push(snapshot.to_string());
        args
    }
}

#[async_trait]
impl SnapshotSource for ZfsSource {
    async fn open_export(&self, source: &str, since: Option<&str>) -> Result<ExportStream> {
        let mut command = Command::new(&self.program);
        command.args(Self::send_args(source, since));
        ExportStream::spawn(command, &format!("{} send {}", self.program, source))
    }

    async fn used_bytes(&self, source: &str) -> Option<u64> {
        let dataset = source.split('@').next().unwrap_or(source);
        let output = Command::new(&self.program)
            .args(["get", "-Hp", "-o", "value", "used", dataset])
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                let text = String::from_utf8_lossy(&out.stdout);
                let parsed = text.trim().parse::<u64>().ok();
                if parsed.is_none() {
                    warn!(dataset = %dataset, "Unexpected `used` value: {}", text.trim());
                }
                parsed
            }
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                warn!(dataset = %dataset, "Could not read dataset size: {}", stderr.trim());
                None
            }
            Err(e) => {
                warn!(dataset = %dataset, "Could not run {}: {}", self.program, e);
                None
            }
        }
    }
}

/// A pre-exported stream stored in a local file.
#[derive(Default)]
pub struct FileSource;

#[async_trait]
impl SnapshotSource for FileSource {
    async fn open_export(&self, source: &str, since: Option<&str>) -> Result<ExportStream> {
        if since.is_some() {
            return Err(PipelineError::Config(
                "file sources hold a complete stream; --since does not apply".into(),
            ));
        }
        let file = tokio::fs::File::open(PathBuf::from(source))
            .await
            .map_err(|e| PipelineError::SourceUnavailable(format!("{}: {}", source, e)))?;
        Ok(ExportStream::from_reader(source, file))
    }

    async fn used_bytes(&self, source: &str) -> Option<u64> {
        tokio::fs::metadata(source).await.ok().map(|m| m.len())
    }
}

pub fn from_config(config: &SourceConfig) -> Box<dyn SnapshotSource> {
    match config.kind {
        StreamKind::Zfs => Box::new(ZfsSource::new(&config.program)),
        StreamKind::File => Box::new(FileSource),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_send_args() {
        assert_eq!(ZfsSource::send_args("tank/data@b", None), vec!["send", "tank/data@b"]);
        assert_eq!(
            ZfsSource::send_args("tank/data@b", Some("tank/data@a")),
            vec!["send", "-i", "tank/data@a", "tank/data@b"]
        );
    }

    #[tokio::test]
    async fn test_file_source_is_deterministic() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i * 31 % 256) as u8).collect();
        file.write_all(&payload).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let source = FileSource;
        assert_eq!(source.used_bytes(&path).await, Some(payload.len() as u64));

        for _ in 0..2 {
            let mut stream = source.open_export(&path, None).await.unwrap();
            let mut out = Vec::new();
            stream.read_to_end(&mut out).await.unwrap();
            stream.finish().await.unwrap();
            assert_eq!(out, payload);
        }
    }

    #[tokio::test]
    async fn test_file_source_rejects_incremental() {
        let result = FileSource.open_export("/dev/null", Some("base")).await;
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let result = FileSource.open_export("/nonexistent/stream.zfs", None).await;
        assert!(matches!(result, Err(PipelineError::SourceUnavailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_export_is_reported_at_finish() {
        let mut command = Command::new("sh");
        command.args(["-c", "printf partial; exit 3"]);
        let mut stream = ExportStream::spawn(command, "sh export").unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"partial");
        assert!(matches!(stream.finish().await, Err(PipelineError::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let source = ZfsSource::new("definitely-not-zfs");
        assert!(matches!(
            source.open_export("tank@a", None).await,
            Err(PipelineError::SourceUnavailable(_))
        ));
        assert_eq!(source.used_bytes("tank@a").await, None);
    }
}
