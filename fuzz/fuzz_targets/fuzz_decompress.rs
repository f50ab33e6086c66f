#![no_main]

use libfuzzer_sys::fuzz_target;
use parallel_blockzip::{
    decompress_bytes, BlockCodec, Bzip2Codec, GzipCodec, PipelineConfig, StoreCodec, ZstdCodec,
};
use std::sync::Arc;

/// Decoded blocks larger than this are rejected by the codecs.
const MAX_OUTPUT: usize = 1 << 20;

fuzz_target!(|data: &[u8]| {
    let config = PipelineConfig::default().workers(2);
    let codecs: [Arc<dyn BlockCodec>; 4] = [
        Arc::new(GzipCodec::default().max_output(MAX_OUTPUT)),
        Arc::new(ZstdCodec::default().max_output(MAX_OUTPUT)),
        Arc::new(Bzip2Codec::default().max_output(MAX_OUTPUT)),
        Arc::new(StoreCodec),
    ];
    for codec in codecs {
        // Must return, never hang or panic.
        let _ = decompress_bytes(data, &config, codec);
    }
});
