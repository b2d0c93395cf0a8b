//! Property-based tests for the reference codec and relocation
//!
//! Uses proptest to check that encoded references survive arbitrary
//! offsets and that relocated graphs survive arbitrary mapping deltas.

use heap_archive::{
    ArchiveBuilder, ArchiveCodec, FieldKind, FieldValue, Heap, LiveRef, LoadSession, ObjId,
    RegionKind, RelocationBitmap, Slot, StaticFieldStore, TypeBuilder, TypeKey,
};
use proptest::prelude::*;

const BASE: u64 = 0x1_0000_0000;

struct FirstStatic(Option<FieldValue>);

impl StaticFieldStore for FirstStatic {
    fn write_static(&mut self, _ty: TypeKey, offset: u32, value: FieldValue) {
        if offset == 0 {
            self.0 = Some(value);
        }
    }
}

/// A ring of `len` nodes; node `i` carries `i * 10` in its primitive slot
fn ring(len: usize) -> Heap {
    let mut heap = Heap::new();
    let node = heap
        .define_type(
            TypeBuilder::instance("Node")
                .field(FieldKind::Ref)
                .field(FieldKind::Prim),
        )
        .unwrap();
    let holder = heap
        .define_type(TypeBuilder::instance("Ring").static_ref("HEAD", "Node"))
        .unwrap();

    let ids: Vec<ObjId> = (0..len)
        .map(|i| {
            heap.alloc_instance(node, vec![Slot::Ref(None), Slot::Prim(i as u64 * 10)])
                .unwrap()
        })
        .collect();
    for i in 0..len {
        heap.set_slot(ids[i], 0, Slot::Ref(Some(ids[(i + 1) % len])))
            .unwrap();
    }
    heap.set_static(holder, "HEAD", Slot::Ref(Some(ids[0]))).unwrap();
    heap
}

proptest! {
    #[test]
    fn prop_codec_roundtrip(shift in 0u32..=3, units in 1u64..(1u64 << 31)) {
        let codec = ArchiveCodec::new(BASE, shift).unwrap();
        let addr = BASE + (units << shift);

        let narrow = codec.encode(addr).unwrap();
        prop_assert!(!narrow.is_null());
        prop_assert!(!narrow.is_external());
        prop_assert_eq!(codec.decode(narrow), Some(addr));
    }

    #[test]
    fn prop_codec_rejects_misaligned_and_out_of_range(
        shift in 1u32..=3,
        units in 1u64..(1u64 << 20),
        skew in 1u64..8,
    ) {
        let codec = ArchiveCodec::new(BASE, shift).unwrap();
        let skew = skew % (1u64 << shift);
        if skew != 0 {
            prop_assert!(codec.encode(BASE + (units << shift) + skew).is_err());
        }
        prop_assert!(codec.encode(BASE - (units << shift)).is_err());
        prop_assert!(codec.encode(BASE + codec.max_span() + (units << shift)).is_err());
    }

    #[test]
    fn prop_bitmap_sizing(words in 1usize..10_000) {
        let expected = (words + 7) / 8;
        prop_assert_eq!(RelocationBitmap::byte_len_for(words * 8), expected);
        prop_assert_eq!(RelocationBitmap::new(words).to_bytes().len(), expected);
    }

    #[test]
    fn prop_relocated_ring_survives_any_delta(
        len in 1usize..24,
        pages in 0u64..4096,
        runtime_shift in 0u32..=3,
    ) {
        let heap = ring(len);
        let output = ArchiveBuilder::new()
            .verify_subgraphs(false)
            .root("Ring", "HEAD", RegionKind::Closed)
            .dump(&heap)
            .unwrap();
        prop_assert_eq!(output.stats.archived, len);
        prop_assert_eq!(output.stats.closed_relocations, len);

        let delta = pages * 4096;
        let mut bytes = output.image.to_bytes();
        let mut session = LoadSession::new(&mut bytes).unwrap();
        let header = *session.header();
        session.map_region(RegionKind::Closed, header.closed.dump_base + delta).unwrap();
        session.map_region(RegionKind::Open, header.open.dump_base + delta).unwrap();
        session.init_decoding(header.codec_base, runtime_shift).unwrap();
        session.fixup_mapped_regions().unwrap();

        let ring_type = session.table().iter().next().unwrap().owner();
        let mut head = FirstStatic(None);
        prop_assert!(session.initialize_from_archive(ring_type, &mut head).unwrap());
        let head = match head.0 {
            Some(FieldValue::Archived(addr)) => addr,
            other => panic!("unexpected head {:?}", other),
        };
        prop_assert_eq!(head.addr(), header.closed.dump_base + delta + 8);

        let mut current: LiveRef = head;
        for i in 0..len {
            let view = session.object(current).unwrap();
            prop_assert_eq!(view.prim(1).unwrap(), i as u64 * 10);
            current = match view.reference(0).unwrap() {
                FieldValue::Archived(next) => next,
                other => panic!("unexpected link {:?}", other),
            };
        }
        prop_assert_eq!(current, head);
    }
}
