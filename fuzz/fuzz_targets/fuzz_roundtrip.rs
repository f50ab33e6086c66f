#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parallel_blockzip::{compress_bytes, decompress_bytes, CodecKind, PipelineConfig};

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    data: Vec<u8>,
    block_size: u16,
    workers: u8,
    in_flight: u8,
    codec: u8,
}

fuzz_target!(|input: FuzzInput| {
    if input.data.len() > 16 * 1024 {
        return;
    }

    let kind = CodecKind::ALL[input.codec as usize % CodecKind::ALL.len()];
    let config = PipelineConfig::default()
        .block_size(usize::from(input.block_size).max(1))
        .workers(usize::from(input.workers % 8) + 1)
        .max_in_flight(usize::from(input.in_flight % 16) + 1);

    let packed = compress_bytes(&input.data, &config, kind.build(None)).unwrap();
    let unpacked = decompress_bytes(&packed, &config, kind.build(None)).unwrap();
    assert_eq!(unpacked, input.data);
});
