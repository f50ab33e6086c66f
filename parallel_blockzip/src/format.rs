//! Block framing.
//!
//! A compressed stream is a plain concatenation of records, one per block in
//! original order:
//!
//! ```text
//! [u32 LE payload length][payload]  [u32 LE payload length][payload]  ...
//! ```
//!
//! There is no header, magic number or trailing index. Raw input is split
//! into `block_size` chunks (the last one may be shorter), so compression
//! offsets are known up front. Decompression recovers the boundaries with a
//! sequential pass over the length prefixes.

use crate::error::FormatError;
use std::io::{self, Read, Seek, SeekFrom};

/// Size of the length prefix in front of every record.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default uncompressed block size (4 MiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Largest accepted block size (1 GiB).
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024 * 1024;

/// Location of one block inside the input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    /// 0-based, dense sequence number.
    pub seq: u64,
    /// Byte offset of the block (or record payload) in the input.
    pub offset: u64,
    /// Bytes to read at `offset`.
    pub len: usize,
}

/// Number of blocks needed for `total_len` bytes: `ceil(total_len / block_size)`.
///
/// # Panics
///
/// Panics if `block_size` is 0.
pub fn block_count(total_len: u64, block_size: usize) -> u64 {
    assert!(block_size > 0, "block size must be at least 1 byte");
    total_len.div_ceil(block_size as u64)
}

/// Splits `total_len` bytes of raw input into fixed-size blocks.
///
/// # Panics
///
/// Panics if `block_size` is 0. [`PipelineConfig::validate`] rejects such
/// a configuration before a run starts.
///
/// [`PipelineConfig::validate`]: crate::PipelineConfig::validate
pub fn partition(total_len: u64, block_size: usize) -> Vec<BlockDescriptor> {
    let block_size = block_size as u64;
    (0..block_count(total_len, block_size as usize))
        .map(|seq| {
            let offset = seq * block_size;
            BlockDescriptor {
                seq,
                offset,
                len: (total_len - offset).min(block_size) as usize,
            }
        })
        .collect()
}

/// Returns the length of a seekable stream and rewinds it to the start.
pub fn stream_len<S: Seek + ?Sized>(stream: &mut S) -> io::Result<u64> {
    let len = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(0))?;
    Ok(len)
}

/// Scans the length prefixes of a compressed stream and returns the payload
/// location of every record. The stream is rewound afterwards.
pub fn scan_index<R: Read + Seek + ?Sized>(
    input: &mut R,
) -> Result<Vec<BlockDescriptor>, FormatError> {
    let total = stream_len(input)?;
    let mut blocks = Vec::new();
    let mut pos = 0u64;

    while pos < total {
        if total - pos < LENGTH_PREFIX_SIZE as u64 {
            return Err(FormatError::TruncatedHeader { offset: pos });
        }
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        input.read_exact(&mut prefix)?;
        let declared = u32::from_le_bytes(prefix);

        let seq = blocks.len() as u64;
        let payload_at = pos + LENGTH_PREFIX_SIZE as u64;
        let available = total - payload_at;
        if u64::from(declared) > available {
            return Err(FormatError::TruncatedBlock {
                seq,
                offset: pos,
                declared,
                available,
            });
        }

        blocks.push(BlockDescriptor {
            seq,
            offset: payload_at,
            len: declared as usize,
        });
        pos = payload_at + u64::from(declared);
        input.seek(SeekFrom::Start(pos))?;
    }

    input.seek(SeekFrom::Start(0))?;
    Ok(blocks)
}

/// Encodes the length prefix for a record payload of `len` bytes.
pub fn encode_prefix(seq: u64, len: usize) -> Result<[u8; LENGTH_PREFIX_SIZE], FormatError> {
    u32::try_from(len)
        .map(u32::to_le_bytes)
        .map_err(|_| FormatError::BlockTooLarge { seq, len })
}

/// Reads exactly the bytes described by `block`.
pub fn read_block<R: Read + Seek + ?Sized>(
    input: &mut R,
    block: &BlockDescriptor,
) -> io::Result<Vec<u8>> {
    input.seek(SeekFrom::Start(block.offset))?;
    let mut buf = vec![0u8; block.len];
    input.read_exact(&mut buf)?;
    Ok(buf)
}
