//! Benchmarks for dumping and relocating a synthetic object graph

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use heap_archive::{ArchiveBuilder, FieldKind, Heap, LoadSession, RegionKind, Slot, TypeBuilder};

/// A binary tree of `count` nodes with every node also listed in one array
fn synthetic_heap(count: usize) -> Heap {
    let mut heap = Heap::new();
    let node = heap
        .define_type(
            TypeBuilder::instance("Node")
                .field(FieldKind::Ref)
                .field(FieldKind::Ref)
                .field(FieldKind::Prim),
        )
        .unwrap();
    let list = heap.define_type(TypeBuilder::ref_array("Node[]")).unwrap();
    let holder = heap
        .define_type(
            TypeBuilder::instance("Boot")
                .static_ref("TREE", "Node")
                .static_ref("ALL", "Node[]"),
        )
        .unwrap();

    let ids: Vec<_> = (0..count)
        .map(|i| {
            heap.alloc_instance(
                node,
                vec![Slot::Ref(None), Slot::Ref(None), Slot::Prim(i as u64)],
            )
            .unwrap()
        })
        .collect();
    for i in 0..count {
        for (slot, child) in [(0, 2 * i + 1), (1, 2 * i + 2)] {
            if child < count {
                heap.set_slot(ids[i], slot, Slot::Ref(Some(ids[child])))
                    .unwrap();
            }
        }
    }
    let all = heap
        .alloc_ref_array(list, ids.iter().copied().map(Some).collect())
        .unwrap();
    heap.set_static(holder, "TREE", Slot::Ref(Some(ids[0]))).unwrap();
    heap.set_static(holder, "ALL", Slot::Ref(Some(all))).unwrap();
    heap
}

fn builder() -> ArchiveBuilder {
    ArchiveBuilder::new()
        .closed_region(0x1_0000_0000, 16 << 20)
        .open_region(0x1_0100_0000, 16 << 20)
        .verify_subgraphs(false)
        .root("Boot", "TREE", RegionKind::Closed)
        .root("Boot", "ALL", RegionKind::Open)
}

fn benchmark_dump(c: &mut Criterion) {
    let mut group = c.benchmark_group("dump");

    for count in [1_000, 10_000, 100_000].iter() {
        let heap = synthetic_heap(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| black_box(builder().dump(&heap).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_relocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("relocate");

    for count in [1_000, 10_000, 100_000].iter() {
        let bytes = builder()
            .dump(&synthetic_heap(*count))
            .unwrap()
            .image
            .to_bytes();
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                let mut copy = bytes.clone();
                let mut session = LoadSession::new(&mut copy).unwrap();
                session.map_region(RegionKind::Closed, 0x2_0000_0000).unwrap();
                session.map_region(RegionKind::Open, 0x2_0100_0000).unwrap();
                session.init_decoding(0x2_0000_0000, 3).unwrap();
                black_box(session.fixup_mapped_regions().unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_dump, benchmark_relocate);
criterion_main!(benches);
