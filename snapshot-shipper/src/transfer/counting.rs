//! Byte-counting I/O wrappers.
//!
//! The pipelines need to know exactly how many plaintext bytes went into or
//! came out of a transform chain, and whether an error raised inside that
//! chain originated upstream (source or download) or in the transform itself.
//! Errors from a wrapped reader are tagged with [`UpstreamError`] so the
//! caller can tell them apart after they have passed through the cipher.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Duration, Instant};

/// Callback for progress updates, called with the running byte count.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Marks an I/O error as coming from the data producer rather than a transform.
#[derive(Debug)]
pub struct UpstreamError(io::Error);

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl StdError for UpstreamError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.0)
    }
}

pub fn tag_upstream(err: io::Error) -> io::Error {
    if is_upstream(&err) {
        return err;
    }
    io::Error::new(err.kind(), UpstreamError(err))
}

pub fn is_upstream(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<UpstreamError>())
}

/// Counts bytes read through it and tags read errors as upstream.
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
    progress: Option<ProgressCallback>,
    last_update: Instant,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, count: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            count,
            progress: None,
            last_update: Instant::now(),
        }
    }

    /// Report the running count at most four times a second.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                let total = self.count.fetch_add(n, Ordering::Relaxed) + n;

                if let Some(callback) = &self.progress {
                    let now = Instant::now();
                    if n == 0 || now.duration_since(self.last_update) >= PROGRESS_INTERVAL {
                        callback(total);
                        self.last_update = now;
                    }
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(tag_upstream(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Counts bytes accepted by the wrapped writer.
pub struct CountingWriter<W> {
    inner: W,
    count: Arc<AtomicU64>,
}

impl<W> CountingWriter<W> {
    pub fn new(inner: W, count: Arc<AtomicU64>) -> Self {
        Self { inner, count }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let polled = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &polled {
            self.count.fetch_add(*n as u64, Ordering::Relaxed);
        }
        polled
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "source went away")))
        }
    }

    #[tokio::test]
    async fn test_reader_counts_bytes() {
        let count = Arc::new(AtomicU64::new(0));
        let data = vec![7u8; 10_000];
        let mut reader = CountingReader::new(&data[..], count.clone());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 10_000);
        assert_eq!(count.load(Ordering::Relaxed), 10_000);
    }

    #[tokio::test]
    async fn test_reader_reports_final_progress() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |n| sink.lock().unwrap().push(n));

        let data = vec![1u8; 4096];
        let mut reader =
            CountingReader::new(&data[..], Arc::new(AtomicU64::new(0))).with_progress(callback);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(seen.lock().unwrap().last(), Some(&4096));
    }

    #[tokio::test]
    async fn test_reader_tags_errors_as_upstream() {
        let mut reader = CountingReader::new(FailingReader, Arc::new(AtomicU64::new(0)));
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert!(is_upstream(&err));
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(err.to_string().contains("source went away"));
    }

    #[test]
    fn test_tagging_is_idempotent_and_specific() {
        let plain = io::Error::new(io::ErrorKind::Other, "cipher failed");
        assert!(!is_upstream(&plain));

        let tagged = tag_upstream(tag_upstream(io::Error::new(io::ErrorKind::Other, "x")));
        assert!(is_upstream(&tagged));
        let inner = tagged.get_ref().unwrap().downcast_ref::<UpstreamError>().unwrap();
        assert!(!is_upstream(&inner.0));
    }

    #[tokio::test]
    async fn test_writer_counts_bytes() {
        let count = Arc::new(AtomicU64::new(0));
        let mut out = Vec::new();
        {
            let mut writer = CountingWriter::new(&mut out, count.clone());
            writer.write_all(b"hello ").await.unwrap();
            writer.write_all(b"world").await.unwrap();
            writer.shutdown().await.unwrap();
        }
        assert_eq!(out, b"hello world");
        assert_eq!(count.load(Ordering::Relaxed), 11);
    }
}
