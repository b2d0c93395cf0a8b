#![no_main]
use heap_archive::{ArchiveImage, CompiledSubgraphTable, LoadSession, RegionKind};
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must be rejected with an error, never a panic
fuzz_target!(|data: &[u8]| {
    let _ = CompiledSubgraphTable::from_bytes(data);

    if ArchiveImage::from_bytes(data).is_err() {
        return;
    }

    let mut bytes = data.to_vec();
    let Ok(mut session) = LoadSession::new(&mut bytes) else {
        return;
    };
    let header = *session.header();
    let mapped = session
        .map_region(RegionKind::Closed, header.closed.dump_base.wrapping_add(4096))
        .and_then(|_| {
            session.map_region(RegionKind::Open, header.open.dump_base.wrapping_add(4096))
        })
        .and_then(|_| session.init_decoding(header.codec_base, header.codec_shift));
    if mapped.is_ok() {
        let _ = session.fixup_mapped_regions();
    }
});
