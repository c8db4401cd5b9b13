//! Reversible compression applied to shard plaintext before encryption.

use crate::config::CompressionConfig;
use crate::utils::{PipelineError, Result};
use async_compression::tokio::bufread::ZstdEncoder;
use async_compression::tokio::write::ZstdDecoder;
use async_compression::Level;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite};

pub type BoxedReader<'a> = Box<dyn AsyncRead + Send + Unpin + 'a>;
pub type BoxedWriter<'a> = Box<dyn AsyncWrite + Send + Unpin + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd { level: i32 },
}

impl Compression {
    pub fn from_config(config: &CompressionConfig) -> Result<Self> {
        match config.algorithm.as_str() {
            "zstd" => Ok(Compression::Zstd { level: config.level }),
            "none" => Ok(Compression::None),
            other => Err(PipelineError::Config(format!(
                "unsupported compression algorithm: {}",
                other
            ))),
        }
    }

    /// Name-suffix component, if any.
    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Zstd { .. } => Some("zst"),
        }
    }

    /// Algorithm name recorded in shard metadata.
    pub fn label(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd { .. } => "zstd",
        }
    }

    /// Wrap a plaintext reader so reading yields compressed bytes.
    pub fn encoder<'a, R>(&self, reader: R) -> BoxedReader<'a>
    where
        R: AsyncBufRead + Send + Unpin + 'a,
    {
        match *self {
            Compression::None => Box::new(reader),
            Compression::Zstd { level } => {
                Box::new(ZstdEncoder::with_quality(reader, Level::Precise(level)))
            }
        }
    }

    /// Wrap a plaintext writer so compressed bytes written to it come out
    /// decompressed. Must be shut down to flush the final frame.
    pub fn decoder<'a, W>(&self, writer: W) -> BoxedWriter<'a>
    where
        W: AsyncWrite + Send + Unpin + 'a,
    {
        match self {
            Compression::None => Box::new(writer),
            Compression::Zstd { .. } => Box::new(ZstdDecoder::new(writer)),
        }
    }
}
