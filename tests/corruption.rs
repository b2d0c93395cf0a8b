//! Corruption detection tests
//!
//! A damaged archive must be rejected before any archived reference can be
//! read, and a rejected relocation must leave the region untouched.

use heap_archive::core::codec::EXTERNAL_TAG;
use heap_archive::core::region::read_word;
use heap_archive::{
    ArchiveBuilder, ArchiveError, ArchiveImage, FieldKind, Heap, LiveRef, LoadSession,
    RegionKind, RelocationBitmap, Slot, TypeBuilder, PAGE_SIZE,
};

/// A two-node chain whose tail carries `marker` in its primitive slot
fn sample_image(marker: u64) -> ArchiveImage {
    let mut heap = Heap::new();
    let node = heap
        .define_type(
            TypeBuilder::instance("Node")
                .field(FieldKind::Ref)
                .field(FieldKind::Prim),
        )
        .unwrap();
    let holder = heap
        .define_type(TypeBuilder::instance("Holder").static_ref("HEAD", "Node"))
        .unwrap();
    let tail = heap
        .alloc_instance(node, vec![Slot::Ref(None), Slot::Prim(marker)])
        .unwrap();
    let head = heap
        .alloc_instance(node, vec![Slot::Ref(Some(tail)), Slot::Prim(1)])
        .unwrap();
    heap.set_static(holder, "HEAD", Slot::Ref(Some(head))).unwrap();

    ArchiveBuilder::new()
        .root("Holder", "HEAD", RegionKind::Closed)
        .dump(&heap)
        .unwrap()
        .image
}

/// Word index of the first occurrence of `value` in the closed region
fn find_word(image: &ArchiveImage, value: u64) -> usize {
    (0..image.closed.bytes.len() / 8)
        .find(|&i| read_word(&image.closed.bytes, i * 8) == Some(value))
        .unwrap()
}

fn open_and_map(bytes: &mut [u8]) -> Result<LoadSession<'_>, ArchiveError> {
    let mut session = LoadSession::new(bytes)?;
    let header = *session.header();
    session.map_region(RegionKind::Closed, header.closed.dump_base + 0x10_0000)?;
    session.map_region(RegionKind::Open, header.open.dump_base + 0x10_0000)?;
    session.init_decoding(header.codec_base, header.codec_shift)?;
    Ok(session)
}

#[test]
fn test_checksum_mismatch_detected() {
    let image = sample_image(0x55);
    let mut bytes = image.to_bytes();
    let at = PAGE_SIZE + find_word(&image, 0x55) * 8;
    bytes[at] ^= 0xff;

    assert!(matches!(
        LoadSession::new(&mut bytes),
        Err(ArchiveError::ChecksumMismatch("closed region"))
    ));
}

#[test]
fn test_bad_magic_and_truncation() {
    let image = sample_image(0x55);

    let mut bytes = image.to_bytes();
    bytes[0] = b'X';
    assert!(matches!(
        LoadSession::new(&mut bytes),
        Err(ArchiveError::InvalidMagic)
    ));

    let mut bytes = image.to_bytes();
    let truncated = bytes.len() - PAGE_SIZE;
    assert!(LoadSession::new(&mut bytes[..truncated]).is_err());
    assert!(LoadSession::new(&mut bytes[..64]).is_err());
}

#[test]
fn test_bitmap_length_mismatch() {
    let mut image = sample_image(0x55);
    image.closed.bitmap = RelocationBitmap::new(image.closed.bitmap.bit_count() + 64);
    let mut bytes = image.to_bytes();

    assert!(matches!(
        LoadSession::new(&mut bytes),
        Err(ArchiveError::BitmapLengthMismatch { .. })
    ));
}

#[test]
fn test_decode_out_of_range_rejected_before_any_write() {
    let marker = 0x7000_0000;
    let mut image = sample_image(marker);
    // Claim the primitive is a reference; it points far outside both regions
    let word = find_word(&image, marker);
    image.closed.bitmap.set(word);
    let original = image.to_bytes();

    let mut bytes = original.clone();
    {
        let mut session = open_and_map(&mut bytes).unwrap();
        assert!(matches!(
            session.fixup_mapped_regions(),
            Err(ArchiveError::DecodeOutOfRange(_))
        ));
        assert!(!session.is_relocated(RegionKind::Closed));

        let mapped = session.header().closed.dump_base + 0x10_0000 + 8;
        assert!(matches!(
            session.object(LiveRef::new(mapped).unwrap()),
            Err(ArchiveError::NotRelocated)
        ));
    }
    assert_eq!(bytes, original);
}

#[test]
fn test_external_reference_in_closed_region_rejected() {
    let marker = (EXTERNAL_TAG | 3) as u64;
    let mut image = sample_image(marker);
    let word = find_word(&image, marker);
    image.closed.bitmap.set(word);
    let mut bytes = image.to_bytes();

    let mut session = open_and_map(&mut bytes).unwrap();
    assert!(matches!(
        session.fixup_mapped_regions(),
        Err(ArchiveError::CorruptRegion {
            kind: RegionKind::Closed,
            ..
        })
    ));
}

#[test]
fn test_relocation_runs_once() {
    let mut bytes = sample_image(0x55).to_bytes();
    let mut session = open_and_map(&mut bytes).unwrap();
    session.fixup_mapped_regions().unwrap();

    // A second fixup finds nothing left to do; an explicit relocation is an error
    assert_eq!(session.fixup_mapped_regions().unwrap().references, 0);
    assert!(matches!(
        session.relocate_region(RegionKind::Closed),
        Err(ArchiveError::AlreadyRelocated(RegionKind::Closed))
    ));
    assert!(matches!(
        session.map_region(RegionKind::Closed, 0x5000_0000),
        Err(ArchiveError::AlreadyRelocated(RegionKind::Closed))
    ));
}

#[test]
fn test_parsed_image_matches_dump() {
    let image = sample_image(0x55);
    let parsed = ArchiveImage::from_bytes(&image.to_bytes()).unwrap();
    assert_eq!(parsed.closed, image.closed);
    assert_eq!(parsed.open, image.open);
    assert_eq!(parsed.table, image.table);
}

#[test]
fn test_codec_base_near_address_space_end_rejected() {
    let mut bytes = sample_image(0x55).to_bytes();
    bytes[20..28].copy_from_slice(&(u64::MAX - 7).to_le_bytes());

    assert!(matches!(
        LoadSession::new(&mut bytes),
        Err(ArchiveError::InvalidHeader(_))
    ));
}

#[test]
fn test_region_outside_codec_span_rejected() {
    let image = sample_image(0x55);
    let mut bytes = image.to_bytes();
    // Move the codec base above the closed region
    let raised = image.closed.dump_base + 0x1000;
    bytes[20..28].copy_from_slice(&raised.to_le_bytes());

    assert!(matches!(
        LoadSession::new(&mut bytes),
        Err(ArchiveError::InvalidHeader(_))
    ));
}
