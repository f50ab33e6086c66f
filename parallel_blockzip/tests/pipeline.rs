use parallel_blockzip::{
    compress_bytes, decompress_bytes, BlockCodec, CodecError, CodecKind, FormatError, Mode,
    Pipeline, PipelineConfig, PipelineError, Progress, StoreCodec, TaskError,
};
use parking_lot::Mutex;
use std::io::{self, Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Half text, half noise, so every codec has something to do.
fn sample(len: usize) -> Vec<u8> {
    let text = b"lorem ipsum dolor sit amet, consectetur adipiscing elit ";
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|i| {
            if (i / 512) % 2 == 0 {
                text[i % text.len()]
            } else {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            }
        })
        .collect()
}

/// `blocks` blocks of `block_size` bytes, block `i` filled with byte `i`.
fn tagged(blocks: u8, block_size: usize) -> Vec<u8> {
    (0..blocks)
        .flat_map(|i| std::iter::repeat(i).take(block_size))
        .collect()
}

fn config(block_size: usize, workers: usize) -> PipelineConfig {
    PipelineConfig::default()
        .block_size(block_size)
        .workers(workers)
}

/// Store codec with a hook run on every block before it is copied.
struct Instrumented<F> {
    hook: F,
}

impl<F> BlockCodec for Instrumented<F>
where
    F: Fn(&[u8]) -> io::Result<()> + Send + Sync,
{
    fn name(&self) -> &'static str {
        "instrumented"
    }

    fn compress(&self, block: &[u8]) -> Result<Vec<u8>, CodecError> {
        (self.hook)(block).map_err(|source| CodecError::Compress {
            codec: self.name(),
            source,
        })?;
        Ok(block.to_vec())
    }

    fn decompress(&self, block: &[u8]) -> Result<Vec<u8>, CodecError> {
        (self.hook)(block).map_err(|source| CodecError::Decompress {
            codec: self.name(),
            source,
        })?;
        Ok(block.to_vec())
    }
}

fn instrumented<F>(hook: F) -> Arc<dyn BlockCodec>
where
    F: Fn(&[u8]) -> io::Result<()> + Send + Sync + 'static,
{
    Arc::new(Instrumented { hook })
}

#[test]
fn test_store_framing_is_exact() {
    let config = config(4, 4);
    let packed = compress_bytes(b"AAAABBBBCC", &config, Arc::new(StoreCodec)).unwrap();

    let mut expected = Vec::new();
    expected.extend_from_slice(&[4, 0, 0, 0]);
    expected.extend_from_slice(b"AAAA");
    expected.extend_from_slice(&[4, 0, 0, 0]);
    expected.extend_from_slice(b"BBBB");
    expected.extend_from_slice(&[2, 0, 0, 0]);
    expected.extend_from_slice(b"CC");
    assert_eq!(packed, expected);

    let unpacked = decompress_bytes(&packed, &config, Arc::new(StoreCodec)).unwrap();
    assert_eq!(unpacked, b"AAAABBBBCC");
}

#[test]
fn test_roundtrip_sizes_for_every_codec() {
    const B: usize = 1024;
    for kind in CodecKind::ALL {
        for size in [0, 1, B - 1, B, B + 1, 10 * B] {
            let data = sample(size);
            let config = config(B, 3);
            let packed = compress_bytes(&data, &config, kind.build(None)).unwrap();
            let unpacked = decompress_bytes(&packed, &config, kind.build(None)).unwrap();
            assert_eq!(unpacked, data, "{kind} with {size} bytes");
        }
    }
}

#[test]
fn test_output_matches_serial_order_under_jitter() {
    const BLOCKS: u8 = 24;
    let data = tagged(BLOCKS, 64);
    // Later blocks finish first.
    let codec = instrumented(|block| {
        let tag = u64::from(block[0]);
        thread::sleep(Duration::from_millis((u64::from(BLOCKS) - tag) % 6));
        Ok(())
    });

    let packed = compress_bytes(&data, &config(64, 8), Arc::clone(&codec)).unwrap();
    let serial = compress_bytes(&data, &config(64, 1), Arc::new(StoreCodec)).unwrap();
    assert_eq!(packed, serial);

    let unpacked = decompress_bytes(&packed, &config(64, 8), codec).unwrap();
    assert_eq!(unpacked, data);
}

#[test]
fn test_codec_failure_aborts_run() {
    let data = tagged(16, 8);
    let codec = instrumented(|block| {
        if block[0] == 3 {
            Err(io::Error::new(io::ErrorKind::InvalidData, "bad block"))
        } else {
            thread::sleep(Duration::from_millis(1));
            Ok(())
        }
    });

    let err = compress_bytes(&data, &config(8, 4), codec).unwrap_err();
    assert!(
        matches!(err, PipelineError::Codec { seq: 3, .. }),
        "unexpected error: {err:?}"
    );
    assert_eq!(err.block(), Some(3));
}

#[test]
fn test_panicking_codec_is_reported() {
    let data = tagged(8, 8);
    let codec = instrumented(|block| {
        if block[0] == 5 {
            panic!("codec exploded");
        }
        Ok(())
    });

    match compress_bytes(&data, &config(8, 2), codec) {
        Err(PipelineError::Task {
            seq: 5,
            source: TaskError::Panicked(msg),
        }) => assert_eq!(msg, "codec exploded"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_truncated_archive_is_rejected() {
    let config = config(256, 2);
    let codec = CodecKind::Gzip.build(None);
    let packed = compress_bytes(&sample(1000), &config, Arc::clone(&codec)).unwrap();

    let err = decompress_bytes(&packed[..packed.len() - 1], &config, Arc::clone(&codec))
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Format(FormatError::TruncatedBlock { seq: 3, .. })
    ));

    let mut dangling = packed.clone();
    dangling.extend_from_slice(&[7, 0]);
    let err = decompress_bytes(&dangling, &config, codec).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Format(FormatError::TruncatedHeader { .. })
    ));
}

#[test]
fn test_wrong_codec_fails_to_decompress() {
    let config = config(512, 2);
    let packed = compress_bytes(&sample(2048), &config, CodecKind::Zstd.build(None)).unwrap();
    let err = decompress_bytes(&packed, &config, CodecKind::Gzip.build(None)).unwrap_err();
    assert!(matches!(err, PipelineError::Codec { .. }), "{err:?}");
}

#[test]
fn test_progress_is_monotonic() {
    let data = sample(10 * 300 + 7);
    let seen = Arc::new(Mutex::new(Vec::<Progress>::new()));
    let observer = Arc::clone(&seen);
    let pipeline = Pipeline::new(config(300, 4), CodecKind::Zstd.build(None))
        .on_progress(move |p| observer.lock().push(p));

    let outcome = pipeline
        .execute(Mode::Compress, Cursor::new(data.clone()), Vec::new())
        .unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 11);
    for (i, p) in seen.iter().enumerate() {
        assert_eq!(p.completed, i as u64 + 1);
        assert_eq!(p.total, 11);
    }
    assert!(seen.windows(2).all(|w| w[0].bytes_out < w[1].bytes_out));

    let last = seen[seen.len() - 1];
    assert_eq!(last.percent(), 100);
    assert_eq!(last.bytes_in, data.len() as u64);
    assert_eq!(last.bytes_out, outcome.output.len() as u64);
    assert_eq!(outcome.summary.blocks, 11);
    assert_eq!(outcome.summary.bytes_in, data.len() as u64);
    assert_eq!(outcome.summary.bytes_out, outcome.output.len() as u64);
}

/// Store codec that records the peak number of blocks transformed at once.
fn concurrency_tracker() -> (Arc<dyn BlockCodec>, Arc<AtomicUsize>) {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let codec = {
        let peak = Arc::clone(&peak);
        instrumented(move |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    };
    (codec, peak)
}

#[test]
fn test_in_flight_limit_caps_concurrency() {
    let (codec, peak) = concurrency_tracker();
    let data = sample(40 * 16);
    let config = config(16, 6).max_in_flight(2);
    let packed = compress_bytes(&data, &config, codec).unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(
        decompress_bytes(&packed, &config, Arc::new(StoreCodec)).unwrap(),
        data
    );
}

#[test]
fn test_memory_budget_follows_archive_records() {
    const RECORD: usize = 64 * 1024;
    let data = sample(RECORD * 12);
    let packed = compress_bytes(&data, &config(RECORD, 4), Arc::new(StoreCodec)).unwrap();

    // The configured block size stays at its default; only the records in
    // the archive decide how many fit in the budget.
    let (codec, peak) = concurrency_tracker();
    let config = PipelineConfig::default()
        .workers(6)
        .memory_budget(2 * RECORD + 100);
    assert_eq!(config.block_size, parallel_blockzip::format::DEFAULT_BLOCK_SIZE);

    let unpacked = decompress_bytes(&packed, &config, codec).unwrap();
    assert_eq!(unpacked, data);
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak {peak}");
}

#[test]
fn test_growing_pool_roundtrip() {
    let config = config(128, 1).grow_on_demand(Some(4));
    let data = sample(128 * 20);
    let codec = CodecKind::Bzip2.build(Some(1));
    let packed = compress_bytes(&data, &config, Arc::clone(&codec)).unwrap();
    assert_eq!(decompress_bytes(&packed, &config, codec).unwrap(), data);
}

/// Accepts `budget` bytes, then fails every write.
#[derive(Debug)]
struct FailingWriter {
    budget: usize,
}

impl Write for FailingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.budget == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        let n = buf.len().min(self.budget);
        self.budget -= n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_write_failure_names_block() {
    // Records are 4 + 8 bytes; the third one cannot be written in full.
    let pipeline = Pipeline::new(config(8, 3), Arc::new(StoreCodec));
    let err = pipeline
        .execute(
            Mode::Compress,
            Cursor::new(tagged(6, 8)),
            FailingWriter { budget: 30 },
        )
        .unwrap_err();
    assert!(
        matches!(err, PipelineError::Io { seq: 2, .. }),
        "unexpected error: {err:?}"
    );
}
