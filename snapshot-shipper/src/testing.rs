//! In-memory collaborators for pipeline tests.

use crate::remote::{
    ByteStream, ObjectStoreRemote, RemoteObject, RemoteStore, StoreError, StoreResult,
};
use crate::shard::SIDECAR_SUFFIX;
use crate::stream::{ExportStream, ImportStream, SnapshotSink, SnapshotSource};
use crate::transform::{BoxedReader, BoxedWriter, ShardCipher};
use crate::utils::{PipelineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

pub const MIB: u64 = 1024 * 1024;

/// Deterministic, poorly compressible bytes.
pub fn pattern(len: u64) -> Vec<u8> {
    let mut state: u32 = 0x9e37_79b9;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// Source serving fixed streams by name; counts opens.
#[derive(Default)]
pub struct MemorySource {
    streams: HashMap<String, Arc<Vec<u8>>>,
    opens: AtomicUsize,
}

impl MemorySource {
    pub fn with(name: &str, data: Vec<u8>) -> Self {
        let mut source = Self::default();
        source.streams.insert(name.to_string(), Arc::new(data));
        source
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for MemorySource {
    async fn open_export(&self, source: &str, _since: Option<&str>) -> Result<ExportStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let data = self.streams.get(source).ok_or_else(|| {
            PipelineError::SourceUnavailable(format!("no stream named {}", source))
        })?;
        Ok(ExportStream::from_reader(source, io::Cursor::new(data.as_ref().clone())))
    }

    async fn used_bytes(&self, source: &str) -> Option<u64> {
        self.streams.get(source).map(|d| d.len() as u64)
    }
}

#[derive(Debug, Default)]
pub struct SinkRecord {
    pub committed: Vec<Vec<u8>>,
    pub aborted: usize,
}

/// Sink collecting committed streams in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    pub record: Arc<Mutex<SinkRecord>>,
}

impl MemorySink {
    pub fn committed(&self) -> Vec<Vec<u8>> {
        self.record.lock().unwrap().committed.clone()
    }

    pub fn aborted(&self) -> usize {
        self.record.lock().unwrap().aborted
    }
}

struct MemoryImport {
    buffer: Vec<u8>,
    record: Arc<Mutex<SinkRecord>>,
}

impl AsyncWrite for MemoryImport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ImportStream for MemoryImport {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.record.lock().unwrap().committed.push(self.buffer);
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        self.record.lock().unwrap().aborted += 1;
    }
}

#[async_trait]
impl SnapshotSink for MemorySink {
    async fn open_import(&self, _dest: &str) -> Result<Box<dyn ImportStream>> {
        Ok(Box::new(MemoryImport {
            buffer: Vec::new(),
            record: self.record.clone(),
        }))
    }
}

const XOR_MAGIC: &[u8; 4] = b"XOR1";

/// Toy cipher: a header followed by every byte XORed with a key.
/// Decryption rejects input without the header.
pub struct XorCipher {
    pub key: u8,
}

impl XorCipher {
    async fn apply<'a>(
        &self,
        mut input: BoxedReader<'a>,
        mut output: BoxedWriter<'a>,
        header_in: bool,
    ) -> io::Result<()> {
        if header_in {
            let mut magic = [0u8; 4];
            input.read_exact(&mut magic).await?;
            if &magic != XOR_MAGIC {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "not XOR1 ciphertext"));
            }
        } else {
            output.write_all(XOR_MAGIC).await?;
        }

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            for byte in &mut buf[..n] {
                *byte ^= self.key;
            }
            output.write_all(&buf[..n]).await?;
        }
        output.shutdown().await
    }
}

#[async_trait]
impl ShardCipher for XorCipher {
    fn suffix(&self) -> &str {
        "xor"
    }

    async fn encrypt<'a>(
        &self,
        plaintext: BoxedReader<'a>,
        ciphertext: BoxedWriter<'a>,
    ) -> io::Result<()> {
        self.apply(plaintext, ciphertext, false).await
    }

    async fn decrypt<'a>(
        &self,
        ciphertext: BoxedReader<'a>,
        plaintext: BoxedWriter<'a>,
    ) -> io::Result<()> {
        self.apply(ciphertext, plaintext, true).await
    }
}

/// Wraps an in-memory store and fails chosen writes.
pub struct FlakyStore {
    pub inner: ObjectStoreRemote,
    /// 1-based: fail the Nth `put_file` call.
    pub fail_put_file_at: Mutex<Option<usize>>,
    /// 1-based: fail the Nth `put` call.
    pub fail_put_at: Mutex<Option<usize>>,
    put_files: AtomicUsize,
    puts: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: ObjectStoreRemote::in_memory("flaky"),
            fail_put_file_at: Mutex::new(None),
            fail_put_at: Mutex::new(None),
            put_files: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }

    /// Stop injecting faults and reset the counters.
    pub fn heal(&self) {
        *self.fail_put_file_at.lock().unwrap() = None;
        *self.fail_put_at.lock().unwrap() = None;
        self.put_files.store(0, Ordering::SeqCst);
        self.puts.store(0, Ordering::SeqCst);
    }

    fn injected(what: &str) -> StoreError {
        let message = format!("injected {} failure", what);
        StoreError::Io(io::Error::new(io::ErrorKind::ConnectionReset, message))
    }
}

#[async_trait]
impl RemoteStore for FlakyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, key: &str, data: Bytes) -> StoreResult<()> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_put_at.lock().unwrap() == Some(n) {
            return Err(Self::injected("put"));
        }
        self.inner.put(key, data).await
    }

    async fn put_file(&self, key: &str, path: &Path) -> StoreResult<u64> {
        let n = self.put_files.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_put_file_at.lock().unwrap() == Some(n) {
            return Err(Self::injected("upload"));
        }
        self.inner.put_file(key, path).await
    }

    async fn head(&self, key: &str) -> StoreResult<Option<RemoteObject>> {
        self.inner.head(key).await
    }

    async fn list(&self, dir: &str) -> StoreResult<Vec<RemoteObject>> {
        self.inner.list(dir).await
    }

    async fn get(&self, key: &str) -> StoreResult<ByteStream> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }
}

/// Source whose stream fires `cancel` and stalls once `after` bytes are read,
/// like a signal arriving mid-shard.
pub struct CancellingSource {
    data: Arc<Vec<u8>>,
    after: usize,
    cancel: CancellationToken,
}

impl CancellingSource {
    pub fn new(data: Vec<u8>, after: usize, cancel: CancellationToken) -> Self {
        Self {
            data: Arc::new(data),
            after,
            cancel,
        }
    }
}

struct CancellingReader {
    data: Arc<Vec<u8>>,
    position: usize,
    after: usize,
    cancel: CancellationToken,
}

impl AsyncRead for CancellingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.position >= self.after {
            // Cancelling wakes this task through the pipeline's token.
            self.cancel.cancel();
            return Poll::Pending;
        }
        let end = self.after.min(self.data.len());
        let n = end.saturating_sub(self.position).min(buf.remaining());
        let start = self.position;
        buf.put_slice(&self.data[start..start + n]);
        self.position += n;
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl SnapshotSource for CancellingSource {
    async fn open_export(&self, source: &str, _since: Option<&str>) -> Result<ExportStream> {
        let reader = CancellingReader {
            data: self.data.clone(),
            position: 0,
            after: self.after,
            cancel: self.cancel.clone(),
        };
        Ok(ExportStream::from_reader(source, reader))
    }

    async fn used_bytes(&self, _source: &str) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Wraps an in-memory store; the chosen call fires `cancel` and never returns.
pub struct StallingStore {
    pub inner: ObjectStoreRemote,
    cancel: CancellationToken,
    /// 1-based: stall the Nth `put_file` call.
    put_file_at: Option<usize>,
    /// 1-based: stall the Nth `get` of a shard object. Sidecars are not counted.
    get_at: Option<usize>,
    put_files: AtomicUsize,
    gets: AtomicUsize,
}

impl StallingStore {
    fn new(put_file_at: Option<usize>, get_at: Option<usize>, cancel: CancellationToken) -> Self {
        Self {
            inner: ObjectStoreRemote::in_memory("stalling"),
            cancel,
            put_file_at,
            get_at,
            put_files: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        }
    }

    pub fn on_put_file(n: usize, cancel: CancellationToken) -> Self {
        Self::new(Some(n), None, cancel)
    }

    pub fn on_get(n: usize, cancel: CancellationToken) -> Self {
        Self::new(None, Some(n), cancel)
    }

    async fn stall(&self) {
        self.cancel.cancel();
        std::future::pending::<()>().await
    }
}

#[async_trait]
impl RemoteStore for StallingStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, key: &str, data: Bytes) -> StoreResult<()> {
        self.inner.put(key, data).await
    }

    async fn put_file(&self, key: &str, path: &Path) -> StoreResult<u64> {
        let n = self.put_files.fetch_add(1, Ordering::SeqCst) + 1;
        if self.put_file_at == Some(n) {
            self.stall().await;
        }
        self.inner.put_file(key, path).await
    }

    async fn head(&self, key: &str) -> StoreResult<Option<RemoteObject>> {
        self.inner.head(key).await
    }

    async fn list(&self, dir: &str) -> StoreResult<Vec<RemoteObject>> {
        self.inner.list(dir).await
    }

    async fn get(&self, key: &str) -> StoreResult<ByteStream> {
        if !key.ends_with(SIDECAR_SUFFIX) {
            let n = self.gets.fetch_add(1, Ordering::SeqCst) + 1;
            if self.get_at == Some(n) {
                self.stall().await;
            }
        }
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }
}
