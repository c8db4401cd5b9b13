//! Configuration management for the snapshot shipper.
//!
//! Loads configuration from a TOML file. Every section is optional; CLI flags
//! override individual values at the call site.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub log: LogConfig,
    pub shard: ShardConfig,
    pub compression: CompressionConfig,
    pub encryption: EncryptionConfig,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    /// Named remotes, e.g. `[remotes.offsite]`
    pub remotes: HashMap<String, RemoteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Directory for shard temp files; needs room for about one shard
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Directory for per-dataset lock files
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Plaintext bytes per shard. Planned from the dataset size when unset.
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Compression algorithm (zstd, none)
    #[serde(default = "default_compression")]
    pub algorithm: String,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Cipher program, `age` compatible
    #[serde(default = "default_cipher_program")]
    pub program: String,

    /// Public key to encrypt to
    #[serde(default)]
    pub recipient: Option<String>,

    /// File of public keys to encrypt to
    #[serde(default)]
    pub recipients_file: Option<PathBuf>,

    /// Private key file, needed for restore only
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

/// Which snapshot adapter a source or sink uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    #[default]
    Zfs,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: StreamKind,

    /// Path to the zfs binary
    #[serde(default = "default_zfs_program")]
    pub program: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: StreamKind,

    /// Path to the zfs binary
    #[serde(default = "default_zfs_program")]
    pub program: String,

    /// Pass `-F` to `zfs receive`
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Object store URL, e.g. `s3://bucket/prefix` or `file:///srv/backups`
    pub url: String,

    /// Backend options passed through to the object store builder
    #[serde(default)]
    pub options: HashMap<String, String>,
}

// Default values
fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("snapshot-shipper")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/run/lock/snapshot-shipper")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_compression() -> String {
    "zstd".to_string()
}

fn default_compression_level() -> i32 {
    3
}

fn default_cipher_program() -> String {
    "age".to_string()
}

fn default_zfs_program() -> String {
    "zfs".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            lock_dir: default_lock_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_compression(),
            level: default_compression_level(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            program: default_cipher_program(),
            recipient: None,
            recipients_file: None,
            identity_file: None,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: StreamKind::default(),
            program: default_zfs_program(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: StreamKind::default(),
            program: default_zfs_program(),
            force: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
