//! Pluggable block codecs.
//!
//! The pipeline treats a codec as a pair of pure functions over whole blocks.
//! Codecs are shared by every worker, so implementations must be `Sync` and
//! keep no per-call state in `self`.
//!
//! Decoders stop at a configurable output cap (by default
//! [`MAX_BLOCK_SIZE`]), so a small crafted record cannot inflate without
//! bound.

use crate::error::CodecError;
use crate::format::MAX_BLOCK_SIZE;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::sync::Arc;

/// Transforms one block at a time.
pub trait BlockCodec: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &'static str;

    fn compress(&self, block: &[u8]) -> Result<Vec<u8>, CodecError>;

    fn decompress(&self, block: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Reads a decoder to its end, failing once it yields more than `limit`
/// bytes.
fn read_capped<R: Read>(
    decoder: R,
    codec: &'static str,
    size_hint: usize,
    limit: usize,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(size_hint.min(limit));
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|source| CodecError::Decompress { codec, source })?;
    if out.len() > limit {
        return Err(CodecError::OutputTooLarge { codec, limit });
    }
    Ok(out)
}

/// One gzip member per block.
#[derive(Debug, Clone, Copy)]
pub struct GzipCodec {
    level: flate2::Compression,
    max_output: usize,
}

impl GzipCodec {
    /// `level` is clamped to 0..=9.
    pub fn new(level: u32) -> Self {
        Self {
            level: flate2::Compression::new(level.min(9)),
            max_output: MAX_BLOCK_SIZE,
        }
    }

    /// Caps the size of a decompressed block.
    pub fn max_output(mut self, limit: usize) -> Self {
        self.max_output = limit;
        self
    }
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self {
            level: flate2::Compression::default(),
            max_output: MAX_BLOCK_SIZE,
        }
    }
}

impl BlockCodec for GzipCodec {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, block: &[u8]) -> Result<Vec<u8>, CodecError> {
        let encode = || -> io::Result<Vec<u8>> {
            let mut encoder = GzEncoder::new(Vec::with_capacity(block.len() / 2), self.level);
            encoder.write_all(block)?;
            encoder.finish()
        };
        encode().map_err(|source| CodecError::Compress {
            codec: self.name(),
            source,
        })
    }

    fn decompress(&self, block: &[u8]) -> Result<Vec<u8>, CodecError> {
        read_capped(
            GzDecoder::new(block),
            self.name(),
            block.len().saturating_mul(2),
            self.max_output,
        )
    }
}

/// One zstd frame per block.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
    max_output: usize,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self {
            level,
            max_output: MAX_BLOCK_SIZE,
        }
    }

    /// Caps the size of a decompressed block.
    pub fn max_output(mut self, limit: usize) -> Self {
        self.max_output = limit;
        self
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new(3)
    }
}

impl BlockCodec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, block: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::bulk::compress(block, self.level).map_err(|source| CodecError::Compress {
            codec: self.name(),
            source,
        })
    }

    fn decompress(&self, block: &[u8]) -> Result<Vec<u8>, CodecError> {
        let decoder = zstd::stream::read::Decoder::with_buffer(block).map_err(|source| {
            CodecError::Decompress {
                codec: self.name(),
                source,
            }
        })?;
        read_capped(
            decoder,
            self.name(),
            block.len().saturating_mul(3),
            self.max_output,
        )
    }
}

/// One bzip2 stream per block.
#[derive(Debug, Clone, Copy)]
pub struct Bzip2Codec {
    level: u32,
    max_output: usize,
}

impl Bzip2Codec {
    /// `level` is clamped to 1..=9.
    pub fn new(level: u32) -> Self {
        Self {
            level: level.clamp(1, 9),
            max_output: MAX_BLOCK_SIZE,
        }
    }

    /// Caps the size of a decompressed block.
    pub fn max_output(mut self, limit: usize) -> Self {
        self.max_output = limit;
        self
    }
}

impl Default for Bzip2Codec {
    fn default() -> Self {
        Self::new(9)
    }
}

impl BlockCodec for Bzip2Codec {
    fn name(&self) -> &'static str {
        "bzip2"
    }

    fn compress(&self, block: &[u8]) -> Result<Vec<u8>, CodecError> {
        let encode = || -> io::Result<Vec<u8>> {
            let mut encoder = BzEncoder::new(
                Vec::with_capacity(block.len() / 2),
                bzip2::Compression::new(self.level),
            );
            encoder.write_all(block)?;
            encoder.finish()
        };
        encode().map_err(|source| CodecError::Compress {
            codec: self.name(),
            source,
        })
    }

    fn decompress(&self, block: &[u8]) -> Result<Vec<u8>, CodecError> {
        read_capped(
            BzDecoder::new(block),
            self.name(),
            block.len().saturating_mul(3),
            self.max_output,
        )
    }
}

/// Stores blocks unchanged. Useful for testing the framing on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCodec;

impl BlockCodec for StoreCodec {
    fn name(&self) -> &'static str {
        "store"
    }

    fn compress(&self, block: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(block.to_vec())
    }

    fn decompress(&self, block: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(block.to_vec())
    }
}

/// The built-in codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    #[default]
    Gzip,
    Zstd,
    Bzip2,
    Store,
}

impl CodecKind {
    pub const ALL: [CodecKind; 4] = [Self::Gzip, Self::Zstd, Self::Bzip2, Self::Store];

    /// Builds the codec, using its default level when `level` is `None`.
    pub fn build(self, level: Option<i32>) -> Arc<dyn BlockCodec> {
        let unsigned = |l: i32| l.max(0) as u32;
        match (self, level) {
            (Self::Gzip, Some(l)) => Arc::new(GzipCodec::new(unsigned(l))),
            (Self::Gzip, None) => Arc::new(GzipCodec::default()),
            (Self::Zstd, Some(l)) => Arc::new(ZstdCodec::new(l)),
            (Self::Zstd, None) => Arc::new(ZstdCodec::default()),
            (Self::Bzip2, Some(l)) => Arc::new(Bzip2Codec::new(unsigned(l))),
            (Self::Bzip2, None) => Arc::new(Bzip2Codec::default()),
            (Self::Store, _) => Arc::new(StoreCodec),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Bzip2 => "bzip2",
            Self::Store => "store",
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown codec '{s}' (expected gzip, zstd, bzip2 or store)"))
    }
}
