//! Parallel block pipeline.
//!
//! A run compresses or decompresses a whole stream:
//!
//! 1. **Initializing**: validate the configuration, split the input into
//!    blocks (or scan the record index when decompressing), create the
//!    per-run worker pool, gate and locks.
//! 2. **Dispatching**: submit one task per block, in order, each holding an
//!    admission permit so at most `max_in_flight` blocks are buffered. A
//!    memory budget is turned into that limit here, from the largest block
//!    found in step 1.
//! 3. **AwaitingCompletion**: block until every block has been written or the
//!    first one has failed.
//! 4. **Finalizing**: flush the output and dispose the pool.
//!
//! Each block task reads its bytes under the input lock, runs the codec with
//! no lock held, waits for its turn at the [`SequenceGate`], then writes under
//! the output lock. Only the writes are ordered; reads and codec work overlap
//! freely across workers.
//!
//! Any block failure is fatal: the gate is closed so waiting blocks give up,
//! nothing more is written, and the first error is returned.

use crate::codec::BlockCodec;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, TaskError};
use crate::format::{self, BlockDescriptor};
use crate::gate::SequenceGate;
use crate::handle::TaskHandle;
use crate::pool::WorkerPool;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io::{Read, Seek, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, debug_span, trace, warn};

/// Direction of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Compress,
    Decompress,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Compress => "compress",
            Self::Decompress => "decompress",
        })
    }
}

/// Progress after a block has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
    /// Input bytes consumed by the written blocks.
    pub bytes_in: u64,
    /// Output bytes written so far, including length prefixes.
    pub bytes_out: u64,
}

impl Progress {
    pub fn percent(&self) -> u64 {
        if self.total == 0 {
            100
        } else {
            self.completed * 100 / self.total
        }
    }
}

type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Totals for a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub mode: Mode,
    pub blocks: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elapsed: Duration,
}

/// A successful run: its summary and the output stream handed back.
#[derive(Debug)]
pub struct RunOutcome<W> {
    pub summary: RunSummary,
    pub output: W,
}

/// Compresses or decompresses streams block by block on a worker pool.
pub struct Pipeline {
    config: PipelineConfig,
    codec: Arc<dyn BlockCodec>,
    progress: Option<ProgressFn>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, codec: Arc<dyn BlockCodec>) -> Self {
        Self {
            config,
            codec,
            progress: None,
        }
    }

    /// Registers an observer called after every block write.
    ///
    /// The observer runs inside the ordered write section, so calls are
    /// serialized and `completed` increases by one each time. Keep it cheap.
    pub fn on_progress<F>(mut self, observer: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(observer));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn codec(&self) -> &dyn BlockCodec {
        self.codec.as_ref()
    }

    /// Runs the whole stream through the pool and blocks until it is done.
    ///
    /// The input is read from offset 0 to its end. On success the output
    /// stream is flushed and returned; on failure it is dropped, possibly
    /// holding a prefix of the output, and the caller should discard it.
    pub fn execute<R, W>(
        &self,
        mode: Mode,
        mut input: R,
        output: W,
    ) -> Result<RunOutcome<W>, PipelineError>
    where
        R: Read + Seek + Send + 'static,
        W: Write + Send + 'static,
    {
        let started = Instant::now();
        let span = debug_span!("run", %mode, codec = self.codec.name());
        let _enter = span.enter();

        debug!(state = "initializing");
        self.config.validate()?;
        let blocks = match mode {
            Mode::Compress => {
                let len = format::stream_len(&mut input).map_err(|source| {
                    PipelineError::Stream {
                        stage: "measuring input",
                        source,
                    }
                })?;
                format::partition(len, self.config.block_size)
            }
            Mode::Decompress => format::scan_index(&mut input)?,
        };

        let run = Arc::new(Run::new(
            mode,
            blocks.len() as u64,
            input,
            output,
            Arc::clone(&self.codec),
            self.progress.clone(),
        ));
        if !blocks.is_empty() {
            self.dispatch(&run, blocks)?;
        }

        debug!(state = "finalizing");
        let mut sink = run.output.lock();
        let Some(mut output) = sink.stream.take() else {
            return Err(PipelineError::Aborted);
        };
        output.flush().map_err(|source| PipelineError::Stream {
            stage: "flushing output",
            source,
        })?;

        let summary = RunSummary {
            mode,
            blocks: sink.completed,
            bytes_in: sink.bytes_in,
            bytes_out: sink.bytes_out,
            elapsed: started.elapsed(),
        };
        debug!(
            blocks = summary.blocks,
            bytes_in = summary.bytes_in,
            bytes_out = summary.bytes_out,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "run complete"
        );
        Ok(RunOutcome { summary, output })
    }

    fn dispatch<R, W>(
        &self,
        run: &Arc<Run<R, W>>,
        blocks: Vec<BlockDescriptor>,
    ) -> Result<(), PipelineError>
    where
        R: Read + Seek + Send + 'static,
        W: Write + Send + 'static,
    {
        let largest = blocks.iter().map(|block| block.len).max().unwrap_or(0);
        let in_flight = self.config.in_flight_for(largest);
        let pool = WorkerPool::new(self.config.pool.clone())?;
        let admission = Admission::new(in_flight);
        let mut handles: Vec<(u64, TaskHandle<()>)> = Vec::with_capacity(blocks.len());

        debug!(
            state = "dispatching",
            blocks = blocks.len(),
            largest,
            workers = pool.worker_count(),
            in_flight
        );
        for block in blocks {
            let permit = admission.acquire();
            if run.failed() {
                break;
            }
            let task_run = Arc::clone(run);
            let submitted = pool.submit_for_result(move || {
                let _permit = permit;
                task_run.process(block)
            });
            match submitted {
                Ok(handle) => handles.push((block.seq, handle)),
                Err(err) => {
                    run.abort(block.seq, &err);
                    return Err(err.into());
                }
            }
        }

        debug!(state = "awaiting completion");
        run.done.wait();

        let mut first: Option<PipelineError> = None;
        for (seq, handle) in handles {
            let Err(err) = handle.wait() else {
                continue;
            };
            let err = match err {
                TaskError::Failed(inner) => inner
                    .downcast::<PipelineError>()
                    .unwrap_or_else(|other| PipelineError::Task {
                        seq,
                        source: TaskError::Failed(other),
                    }),
                other => PipelineError::Task { seq, source: other },
            };
            // Prefer the root cause over the aborts it triggered.
            let replace = first
                .as_ref()
                .map_or(true, |kept| kept.is_secondary() && !err.is_secondary());
            if replace {
                first = Some(err);
            }
        }
        pool.dispose();

        match first {
            Some(err) => Err(err),
            None if run.failed() => Err(PipelineError::Aborted),
            None => Ok(()),
        }
    }
}

/// Bounded semaphore capping the blocks buffered at once, built from a
/// pre-filled bounded channel of tokens.
struct Admission {
    tokens: Sender<()>,
    available: Receiver<()>,
}

impl Admission {
    fn new(limit: usize) -> Self {
        let (tokens, available) = bounded(limit);
        for _ in 0..limit {
            // Cannot fail: the channel has room for `limit` tokens and we hold
            // the receiver.
            let _ = tokens.try_send(());
        }
        Self { tokens, available }
    }

    /// Blocks until a token is free.
    fn acquire(&self) -> Permit {
        // Both ends are owned here, so the channel never disconnects.
        let _ = self.available.recv();
        Permit {
            tokens: self.tokens.clone(),
        }
    }
}

/// Returns its token when dropped.
struct Permit {
    tokens: Sender<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.tokens.try_send(());
    }
}

/// One-shot completion signal the orchestrating thread waits on.
struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }
}

/// Output side of a run, guarded by the write lock.
struct Sink<W> {
    stream: Option<W>,
    completed: u64,
    bytes_in: u64,
    bytes_out: u64,
}

/// State shared by every block task of one run.
struct Run<R, W> {
    mode: Mode,
    total: u64,
    codec: Arc<dyn BlockCodec>,
    progress: Option<ProgressFn>,
    input: Mutex<R>,
    output: Mutex<Sink<W>>,
    gate: SequenceGate,
    failed: AtomicBool,
    done: Latch,
}

impl<R, W> Run<R, W>
where
    R: Read + Seek,
    W: Write,
{
    fn new(
        mode: Mode,
        total: u64,
        input: R,
        output: W,
        codec: Arc<dyn BlockCodec>,
        progress: Option<ProgressFn>,
    ) -> Self {
        Self {
            mode,
            total,
            codec,
            progress,
            input: Mutex::new(input),
            output: Mutex::new(Sink {
                stream: Some(output),
                completed: 0,
                bytes_in: 0,
                bytes_out: 0,
            }),
            gate: SequenceGate::new(),
            failed: AtomicBool::new(false),
            done: Latch::new(),
        }
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Marks the run failed, releases every waiter and wakes the orchestrator.
    fn abort(&self, seq: u64, reason: &dyn fmt::Display) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            warn!(seq, error = %reason, "block failed, aborting run");
        }
        self.gate.close();
        self.done.set();
    }

    fn process(&self, block: BlockDescriptor) -> Result<(), PipelineError> {
        if self.failed() {
            return Err(PipelineError::Aborted);
        }
        let _unwind = AbortOnUnwind {
            run: self,
            seq: block.seq,
        };
        let result = self.transfer(block);
        if let Err(err) = &result {
            self.abort(block.seq, err);
        }
        result
    }

    fn transfer(&self, block: BlockDescriptor) -> Result<(), PipelineError> {
        let seq = block.seq;
        let source = {
            let mut input = self.input.lock();
            format::read_block(&mut *input, &block)
                .map_err(|source| PipelineError::Io { seq, source })?
        };

        let payload = match self.mode {
            Mode::Compress => self.codec.compress(&source),
            Mode::Decompress => self.codec.decompress(&source),
        }
        .map_err(|source| PipelineError::Codec { seq, source })?;
        let prefix = match self.mode {
            Mode::Compress => Some(format::encode_prefix(seq, payload.len())?),
            Mode::Decompress => None,
        };
        trace!(seq, read = source.len(), produced = payload.len(), "block transformed");

        let turn = self.gate.acquire(seq)?;
        let mut sink = self.output.lock();
        if self.failed() {
            return Err(PipelineError::Aborted);
        }
        let stream = sink.stream.as_mut().ok_or(PipelineError::Aborted)?;
        let mut written = payload.len() as u64;
        if let Some(prefix) = prefix {
            stream
                .write_all(&prefix)
                .map_err(|source| PipelineError::Io { seq, source })?;
            written += prefix.len() as u64;
        }
        stream
            .write_all(&payload)
            .map_err(|source| PipelineError::Io { seq, source })?;

        sink.completed += 1;
        sink.bytes_in += source.len() as u64;
        sink.bytes_out += written;
        let progress = Progress {
            completed: sink.completed,
            total: self.total,
            bytes_in: sink.bytes_in,
            bytes_out: sink.bytes_out,
        };
        if let Some(observer) = &self.progress {
            observer(progress);
        }
        turn.release();
        drop(sink);

        if progress.completed == self.total {
            self.done.set();
        }
        Ok(())
    }
}

/// Aborts the run if a block task unwinds, so the orchestrator and the
/// blocks waiting at the gate are not left hanging.
struct AbortOnUnwind<'a, R, W>
where
    R: Read + Seek,
    W: Write,
{
    run: &'a Run<R, W>,
    seq: u64,
}

impl<R, W> Drop for AbortOnUnwind<'_, R, W>
where
    R: Read + Seek,
    W: Write,
{
    fn drop(&mut self) {
        if thread::panicking() {
            self.run.abort(self.seq, &"block task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StoreCodec;
    use std::io::Cursor;

    #[test]
    fn test_latch() {
        let latch = Arc::new(Latch::new());
        let setter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.set())
        };
        latch.wait();
        setter.join().unwrap();
        latch.wait();
    }

    #[test]
    fn test_admission_caps_permits() {
        let admission = Admission::new(2);
        let first = admission.acquire();
        let _second = admission.acquire();
        assert!(admission.available.try_recv().is_err());
        drop(first);
        assert!(admission.available.try_recv().is_ok());
    }

    #[test]
    fn test_empty_input() {
        let pipeline = Pipeline::new(PipelineConfig::default().workers(2), Arc::new(StoreCodec));
        let outcome = pipeline
            .execute(Mode::Compress, Cursor::new(Vec::new()), Vec::new())
            .unwrap();
        assert!(outcome.output.is_empty());
        assert_eq!(outcome.summary.blocks, 0);

        let outcome = pipeline
            .execute(Mode::Decompress, Cursor::new(Vec::new()), Vec::new())
            .unwrap();
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn test_invalid_config_fails_before_work() {
        let pipeline = Pipeline::new(PipelineConfig::default().block_size(0), Arc::new(StoreCodec));
        let err = pipeline
            .execute(Mode::Compress, Cursor::new(vec![1, 2, 3]), Vec::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_progress_percent() {
        let p = Progress {
            completed: 1,
            total: 3,
            bytes_in: 0,
            bytes_out: 0,
        };
        assert_eq!(p.percent(), 33);
        assert_eq!(Progress { total: 0, ..p }.percent(), 100);
    }
}
