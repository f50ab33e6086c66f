//! Error types for the worker pool, the block format and the pipeline.
//!
//! Each layer has its own enum so callers can match on the failure they care
//! about; [`PipelineError`] wraps the lower layers and adds the block sequence
//! number where one is known.

use std::io;
use thiserror::Error;

/// Invalid pool or pipeline configuration, reported before any work starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error("worker ceiling {max} is below the initial worker count {initial}")]
    WorkerCeiling { initial: usize, max: usize },

    #[error("block size must be between 1 and {max} bytes, got {got}")]
    BlockSize { got: usize, max: usize },

    #[error("in-flight block limit must be at least 1")]
    NoInFlight,
}

/// Errors returned by [`WorkerPool`](crate::WorkerPool) operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shutting down")]
    ShuttingDown,

    #[error("worker pool has been disposed")]
    Disposed,

    #[error("failed to spawn worker thread")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A failure captured at the task boundary and handed to
/// [`TaskHandle::wait`](crate::TaskHandle::wait).
#[derive(Debug, Error)]
pub enum TaskError {
    /// The computation returned an error.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    /// The computation panicked; the payload message is preserved.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was dropped without running, because the pool was disposed
    /// while it was still queued.
    #[error("task was dropped before it ran")]
    Abandoned,
}

/// Returned by [`SequenceGate::acquire`](crate::SequenceGate::acquire) when a
/// turn can never be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("sequencing gate closed while block {seq} was waiting")]
    Closed { seq: u64 },

    #[error("block {seq} already passed the gate (cursor is at {cursor})")]
    AlreadyPassed { seq: u64, cursor: u64 },
}

/// Malformed or unrepresentable block framing.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("truncated length prefix at offset {offset}")]
    TruncatedHeader { offset: u64 },

    #[error(
        "block {seq} at offset {offset} declares {declared} bytes but only {available} remain"
    )]
    TruncatedBlock {
        seq: u64,
        offset: u64,
        declared: u32,
        available: u64,
    },

    #[error("block {seq} compressed to {len} bytes, which does not fit a 32-bit length prefix")]
    BlockTooLarge { seq: u64, len: usize },

    #[error("failed to read block index")]
    Io(#[from] io::Error),
}

/// A codec failed to transform a block.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{codec} compression failed")]
    Compress {
        codec: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{codec} decompression failed")]
    Decompress {
        codec: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{codec} block decompresses to more than {limit} bytes")]
    OutputTooLarge { codec: &'static str, limit: usize },
}

/// Errors that terminate a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),

    #[error("worker pool error")]
    Pool(#[from] PoolError),

    #[error("malformed block stream")]
    Format(#[from] FormatError),

    #[error("I/O error while {stage}")]
    Stream {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on block {seq}")]
    Io {
        seq: u64,
        #[source]
        source: io::Error,
    },

    #[error("block {seq} could not be transformed")]
    Codec {
        seq: u64,
        #[source]
        source: CodecError,
    },

    #[error("block {seq} task failed")]
    Task {
        seq: u64,
        #[source]
        source: TaskError,
    },

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("run aborted after an earlier block failed")]
    Aborted,
}

impl PipelineError {
    /// Returns `true` for errors that are only a consequence of another
    /// block's failure.
    pub fn is_secondary(&self) -> bool {
        matches!(
            self,
            Self::Aborted | Self::Gate(GateError::Closed { .. })
        )
    }

    /// Sequence number of the block that failed, when known.
    pub fn block(&self) -> Option<u64> {
        match self {
            Self::Io { seq, .. } | Self::Codec { seq, .. } | Self::Task { seq, .. } => Some(*seq),
            Self::Format(FormatError::TruncatedBlock { seq, .. })
            | Self::Format(FormatError::BlockTooLarge { seq, .. }) => Some(*seq),
            Self::Gate(GateError::Closed { seq } | GateError::AlreadyPassed { seq, .. }) => {
                Some(*seq)
            }
            _ => None,
        }
    }
}
