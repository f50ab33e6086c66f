pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod gate;
pub mod handle;
pub mod pipeline;
pub mod pool;

pub use codec::{BlockCodec, Bzip2Codec, CodecKind, GzipCodec, StoreCodec, ZstdCodec};
pub use config::{default_parallelism, PipelineConfig, PoolConfig};
pub use error::{
    CodecError, ConfigError, FormatError, GateError, PipelineError, PoolError, TaskError,
};
pub use gate::{SequenceGate, Turn};
pub use handle::TaskHandle;
pub use pipeline::{Mode, Pipeline, Progress, RunOutcome, RunSummary};
pub use pool::{PoolStats, WorkerPool, WorkerState, WorkerStats};

use std::io::Cursor;
use std::sync::Arc;

/// Compresses an in-memory buffer into the block record format.
pub fn compress_bytes(
    data: &[u8],
    config: &PipelineConfig,
    codec: Arc<dyn BlockCodec>,
) -> Result<Vec<u8>, PipelineError> {
    run_bytes(Mode::Compress, data, config, codec)
}

/// Decompresses an in-memory block record stream.
pub fn decompress_bytes(
    data: &[u8],
    config: &PipelineConfig,
    codec: Arc<dyn BlockCodec>,
) -> Result<Vec<u8>, PipelineError> {
    run_bytes(Mode::Decompress, data, config, codec)
}

fn run_bytes(
    mode: Mode,
    data: &[u8],
    config: &PipelineConfig,
    codec: Arc<dyn BlockCodec>,
) -> Result<Vec<u8>, PipelineError> {
    let pipeline = Pipeline::new(config.clone(), codec);
    let outcome = pipeline.execute(mode, Cursor::new(data.to_vec()), Vec::new())?;
    Ok(outcome.output)
}
