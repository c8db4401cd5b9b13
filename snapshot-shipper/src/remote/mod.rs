//! Remote object storage seam.
//!
//! The pipelines only need atomic puts, listing, streaming gets and deletes.
//! Every configured remote is built once at startup into a [`RemoteRegistry`]
//! and looked up by name afterwards.

mod backend;
pub mod error;

use crate::config::RemoteConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

pub use backend::ObjectStoreRemote;
pub use error::{StoreError, StoreResult};

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// An object as seen by a listing or head request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Final path segment of the key.
    pub name: String,
    pub size: u64,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Remote name for logs.
    fn name(&self) -> &str;

    /// Store a small object. Visible all at once or not at all.
    async fn put(&self, key: &str, data: Bytes) -> StoreResult<()>;

    /// Stream a local file into an object. Visible all at once or not at all;
    /// an interrupted upload leaves nothing behind that `list` would return.
    async fn put_file(&self, key: &str, path: &Path) -> StoreResult<u64>;

    async fn head(&self, key: &str) -> StoreResult<Option<RemoteObject>>;

    /// Objects directly under `dir`. Listed objects are always complete.
    async fn list(&self, dir: &str) -> StoreResult<Vec<RemoteObject>>;

    async fn get(&self, key: &str) -> StoreResult<ByteStream>;

    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Join a destination directory and an object name into a key.
pub fn join_key(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Configured remotes, resolved by name.
#[derive(Clone, Default)]
pub struct RemoteRegistry {
    remotes: HashMap<String, Arc<dyn RemoteStore>>,
}

impl RemoteRegistry {
    /// Build every configured remote.
    pub fn from_config(remotes: &HashMap<String, RemoteConfig>) -> StoreResult<Self> {
        let mut registry = Self::default();
        for (name, remote) in remotes {
            let store = ObjectStoreRemote::from_url(name, &remote.url, &remote.options)?;
            registry.insert(name, Arc::new(store));
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: &str, store: Arc<dyn RemoteStore>) {
        self.remotes.insert(name.to_string(), store);
    }

    pub fn get(&self, name: &str) -> StoreResult<Arc<dyn RemoteStore>> {
        self.remotes
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownRemote(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.remotes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
