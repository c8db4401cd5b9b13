//! `RemoteStore` backed by the `object_store` crate.
//!
//! Covers `file://`, `memory://` and `s3://` URLs. Large objects go through a
//! multipart upload, which only becomes visible once completed; aborting or
//! dropping it never exposes a partial object.

use super::{ByteStream, RemoteObject, RemoteStore, StoreError, StoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use object_store::memory::InMemory;
use object_store::path::{Path as ObjectPath, PathPart};
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use url::Url;

/// Read size when streaming a local file into a multipart upload.
const UPLOAD_BUFFER_SIZE: usize = 1024 * 1024;

/// Parts allowed in flight per upload.
const UPLOAD_CONCURRENCY: usize = 4;

pub struct ObjectStoreRemote {
    name: String,
    inner: Arc<dyn ObjectStore>,
    root: ObjectPath,
}

impl ObjectStoreRemote {
    pub fn new(name: &str, inner: Arc<dyn ObjectStore>, root: ObjectPath) -> Self {
        Self {
            name: name.to_string(),
            inner,
            root,
        }
    }

    /// Build a remote from a URL such as `s3://bucket/base` or `file:///srv/backups`.
    pub fn from_url(name: &str, url: &str, options: &HashMap<String, String>) -> StoreResult<Self> {
        let parsed =
            Url::parse(url).map_err(|e| StoreError::InvalidUrl(format!("{}: {}", url, e)))?;
        let (store, root) = object_store::parse_url_opts(&parsed, options.iter())?;
        debug!(remote = %name, url = %url, root = %root, "Configured remote");
        Ok(Self::new(name, Arc::from(store), root))
    }

    /// A process-local remote, mostly for tests and dry runs.
    pub fn in_memory(name: &str) -> Self {
        Self::new(name, Arc::new(InMemory::new()), ObjectPath::default())
    }

    fn location(&self, key: &str) -> ObjectPath {
        let key_path = ObjectPath::from(key);
        let parts: Vec<PathPart<'_>> = self.root.parts().chain(key_path.parts()).collect();
        ObjectPath::from_iter(parts)
    }

    async fn stream_file(
        &self,
        file: &mut tokio::fs::File,
        writer: &mut WriteMultipart,
    ) -> StoreResult<u64> {
        let mut buf = vec![0u8; UPLOAD_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.wait_for_capacity(UPLOAD_CONCURRENCY).await?;
            writer.write(&buf[..n]);
            total += n as u64;
        }
        Ok(total)
    }
}

fn not_found_as(key: &str, err: object_store::Error) -> StoreError {
    match err {
        object_store::Error::NotFound { .. } => StoreError::NotFound(key.to_string()),
        other => StoreError::ObjectStore(other),
    }
}

#[async_trait]
impl RemoteStore for ObjectStoreRemote {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, data: Bytes) -> StoreResult<()> {
        self.inner
            .put(&self.location(key), PutPayload::from(data))
            .await?;
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> StoreResult<u64> {
        let mut file = tokio::fs::File::open(path).await?;
        let upload = self.inner.put_multipart(&self.location(key)).await?;
        let mut writer = WriteMultipart::new(upload);

        match self.stream_file(&mut file, &mut writer).await {
            Ok(total) => {
                writer.finish().await?;
                Ok(total)
            }
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    warn!(
                        remote = %self.name,
                        key = %key,
                        "Failed to abort multipart upload: {}",
                        abort_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn head(&self, key: &str) -> StoreResult<Option<RemoteObject>> {
        match self.inner.head(&self.location(key)).await {
            Ok(meta) => Ok(Some(RemoteObject {
                name: meta.location.filename().unwrap_or_default().to_string(),
                size: meta.size,
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, dir: &str) -> StoreResult<Vec<RemoteObject>> {
        let prefix = self.location(dir);
        let listing = self.inner.list_with_delimiter(Some(&prefix)).await?;
        Ok(listing
            .objects
            .into_iter()
            .filter_map(|meta| {
                meta.location.filename().map(|name| RemoteObject {
                    name: name.to_string(),
                    size: meta.size,
                })
            })
            .collect())
    }

    async fn get(&self, key: &str) -> StoreResult<ByteStream> {
        let result = self
            .inner
            .get(&self.location(key))
            .await
            .map_err(|e| not_found_as(key, e))?;
        let stream = result
            .into_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(stream.boxed())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner
            .delete(&self.location(key))
            .await
            .map_err(|e| not_found_as(key, e))
    }
}
