//! Per-shard transforms: compress, then encrypt.

pub mod cipher;
pub mod compression;

pub use cipher::{CommandCipher, ShardCipher};
pub use compression::{BoxedReader, BoxedWriter, Compression};

/// Object name extension for shards produced with this transform chain,
/// e.g. `zst.age`.
pub fn shard_ext(compression: Compression, cipher: &dyn ShardCipher) -> String {
    match compression.suffix() {
        Some(suffix) => format!("{}.{}", suffix, cipher.suffix()),
        None => cipher.suffix().to_string(),
    }
}
