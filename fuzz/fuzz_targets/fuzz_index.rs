#![no_main]

use libfuzzer_sys::fuzz_target;
use parallel_blockzip::format::{scan_index, LENGTH_PREFIX_SIZE};
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let Ok(blocks) = scan_index(&mut Cursor::new(data)) else {
        return;
    };

    // A successful scan covers the stream exactly, record after record.
    let mut pos = 0u64;
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.seq, i as u64);
        assert_eq!(block.offset, pos + LENGTH_PREFIX_SIZE as u64);
        pos = block.offset + block.len as u64;
    }
    assert_eq!(pos, data.len() as u64);
});
