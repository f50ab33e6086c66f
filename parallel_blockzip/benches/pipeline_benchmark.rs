use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parallel_blockzip::{compress_bytes, decompress_bytes, CodecKind, PipelineConfig};
use pprof::criterion::{Output, PProfProfiler};
use rayon::prelude::*;

const BLOCK_SIZE: usize = 256 * 1024;

/// 8 MiB of mixed text and noise.
fn generate_input() -> Vec<u8> {
    let text = b"the quick brown fox jumps over the lazy dog ";
    let mut state = 0x9e37_79b9_u32;
    (0..8 * 1024 * 1024)
        .map(|i: usize| {
            if (i / 4096) % 3 == 0 {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            } else {
                text[i % text.len()]
            }
        })
        .collect()
}

fn bench_compress(c: &mut Criterion) {
    let data = generate_input();
    let mut group = c.benchmark_group("pipeline_compress");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.sample_size(10);

    for kind in [CodecKind::Gzip, CodecKind::Zstd] {
        for workers in [1, 4, 8] {
            let config = PipelineConfig::default()
                .block_size(BLOCK_SIZE)
                .workers(workers);
            group.bench_with_input(
                BenchmarkId::new(kind.as_str(), workers),
                &config,
                |b, config| b.iter(|| compress_bytes(&data, config, kind.build(None)).unwrap()),
            );
        }

        // Unordered rayon baseline: same blocks and codec, no gate or framing.
        let codec = kind.build(None);
        group.bench_function(BenchmarkId::new(format!("{kind}_rayon"), "all"), |b| {
            b.iter(|| {
                data.par_chunks(BLOCK_SIZE)
                    .map(|block| codec.compress(block).unwrap().len())
                    .sum::<usize>()
            })
        });
    }

    group.finish();
}

fn bench_decompress(c: &mut Criterion) {
    let data = generate_input();
    let mut group = c.benchmark_group("pipeline_decompress");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.sample_size(10);

    for kind in [CodecKind::Gzip, CodecKind::Zstd] {
        let config = PipelineConfig::default().block_size(BLOCK_SIZE);
        let packed = compress_bytes(&data, &config, kind.build(None)).unwrap();
        group.bench_function(kind.as_str(), |b| {
            b.iter(|| decompress_bytes(&packed, &config, kind.build(None)).unwrap())
        });
    }

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default().with_profiler(PProfProfiler::new(100, Output::Flamegraph(None)));
    targets = bench_compress, bench_decompress
}
criterion_main!(benches);
