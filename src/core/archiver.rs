//! Graph archiver
//!
//! Copies the object graph reachable from each preservable root into the
//! root's region. Each source object is copied at most once per dump
//! ([`ObjectCache`]); each recording pass tracks the objects it has reached
//! in a [`SeenSet`] so cycles terminate even through objects copied by an
//! earlier pass, which are walked again to record their types but never
//! rewritten.
//!
//! Closed-region roots must all be archived before the first open-region
//! root, so closed-region objects never point into the open region.

use crate::core::checker::{Disqualification, NegativeCache, RootFieldDescriptor};
use crate::core::codec::{ArchiveCodec, NarrowRef, WORD_SIZE};
use crate::core::error::{ArchiveError, Result};
use crate::core::heap::{HeapSource, ObjId, Slot, TypeKey};
use crate::core::region::{
    read_word, ArchiveRef, ObjectHeader, RegionBuffer, RegionKind, OBJECT_HEADER_WORDS,
};
use crate::core::stats::{DumpStats, PassStats};
use crate::core::subgraph::{EntryField, SubgraphTable};
use ahash::{AHashMap, AHashSet};
use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

/// Source object -> archived copy, for the whole dump
#[derive(Debug, Default)]
pub struct ObjectCache {
    map: AHashMap<ObjId, ArchiveRef>,
    /// Insertion order, so an aborted pass can take its copies back out
    journal: Vec<ObjId>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ObjId) -> Option<ArchiveRef> {
        self.map.get(&id).copied()
    }

    fn insert(&mut self, id: ObjId, archived: ArchiveRef) {
        if self.map.insert(id, archived).is_none() {
            self.journal.push(id);
        }
    }

    fn mark(&self) -> usize {
        self.journal.len()
    }

    fn rollback(&mut self, mark: usize) {
        if mark >= self.journal.len() {
            return;
        }
        for id in self.journal.drain(mark..) {
            self.map.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Objects reached in the current recording pass
#[derive(Debug, Default)]
pub struct SeenSet {
    objects: AHashSet<ObjId>,
}

impl SeenSet {
    pub fn reset(&mut self) {
        self.objects.clear();
    }

    /// Returns false if `id` was already seen in this pass
    pub fn insert(&mut self, id: ObjId) -> bool {
        self.objects.insert(id)
    }

    pub fn contains(&self, id: ObjId) -> bool {
        self.objects.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Result of archiving one root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootOutcome {
    Archived(ArchiveRef),
    /// Open-region root whose value is a runtime-recreated object
    External(u32),
    Null,
    /// The pass met an object that cannot be archived and was rolled back
    Aborted,
}

enum Work {
    /// Fresh copy whose reference slots still need writing
    Fill(ObjId, ArchiveRef),
    /// Copied by an earlier pass, walked for type recording only
    Walk(ObjId),
}

enum Visit {
    Reached(ArchiveRef, Option<Work>),
    External(u32),
    Rejected,
}

/// Everything the archiver produced, handed to image assembly
#[derive(Debug)]
pub struct ArchiverOutput {
    pub closed: RegionBuffer,
    pub open: RegionBuffer,
    pub table: SubgraphTable,
    pub stats: DumpStats,
}

pub struct GraphArchiver<'h, H: HeapSource> {
    heap: &'h H,
    codec: ArchiveCodec,
    closed: RegionBuffer,
    open: RegionBuffer,
    cache: ObjectCache,
    seen: SeenSet,
    negative: NegativeCache,
    table: SubgraphTable,
    unrecordable: BTreeSet<TypeKey>,
    open_started: bool,
    stats: DumpStats,
}

impl<'h, H: HeapSource> GraphArchiver<'h, H> {
    pub fn new(
        heap: &'h H,
        codec: ArchiveCodec,
        closed: RegionBuffer,
        open: RegionBuffer,
        negative: NegativeCache,
    ) -> Result<Self> {
        if closed.kind() != RegionKind::Closed || open.kind() != RegionKind::Open {
            return Err(ArchiveError::InvalidConfig(
                "Region buffers passed in the wrong order".to_string(),
            ));
        }
        if codec.alignment() > WORD_SIZE as u64 {
            return Err(ArchiveError::InvalidConfig(format!(
                "Codec alignment {} exceeds the object alignment of {} bytes",
                codec.alignment(),
                WORD_SIZE
            )));
        }
        for region in [&closed, &open] {
            let end = region.base() + region.capacity() as u64;
            if region.base() < codec.base() || end - codec.base() > codec.max_span() {
                return Err(ArchiveError::InvalidConfig(format!(
                    "{} region {:#x}..{:#x} is not encodable from base {:#x}",
                    region.kind(),
                    region.base(),
                    end,
                    codec.base()
                )));
            }
        }

        Ok(GraphArchiver {
            heap,
            codec,
            closed,
            open,
            cache: ObjectCache::new(),
            seen: SeenSet::default(),
            negative,
            table: SubgraphTable::new(),
            unrecordable: BTreeSet::new(),
            open_started: false,
            stats: DumpStats::default(),
        })
    }

    pub fn codec(&self) -> &ArchiveCodec {
        &self.codec
    }

    pub fn region(&self, kind: RegionKind) -> &RegionBuffer {
        match kind {
            RegionKind::Closed => &self.closed,
            RegionKind::Open => &self.open,
        }
    }

    fn region_mut(&mut self, kind: RegionKind) -> &mut RegionBuffer {
        match kind {
            RegionKind::Closed => &mut self.closed,
            RegionKind::Open => &mut self.open,
        }
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn table(&self) -> &SubgraphTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut SubgraphTable {
        &mut self.table
    }

    pub fn stats(&self) -> &DumpStats {
        &self.stats
    }

    pub fn is_unrecordable(&self, owner: TypeKey) -> bool {
        self.unrecordable.contains(&owner)
    }

    fn address_of(&self, archived: ArchiveRef) -> u64 {
        self.region(archived.region).address_of(archived.offset)
    }

    fn encode(&self, archived: ArchiveRef) -> Result<NarrowRef> {
        self.codec.encode(self.address_of(archived))
    }

    /// Archive the graph reachable from one root field and record its entry.
    ///
    /// Meeting an object that cannot be archived is not an error: the pass
    /// is rolled back, the owning type is dropped from the table and marked
    /// unrecordable, and [`RootOutcome::Aborted`] is returned.
    pub fn archive_root(&mut self, desc: &RootFieldDescriptor) -> Result<RootOutcome> {
        match desc.region {
            RegionKind::Closed if self.open_started => {
                return Err(ArchiveError::InvalidConfig(format!(
                    "Closed-region root {}.{} archived after open-region roots",
                    desc.type_name, desc.field_name
                )))
            }
            RegionKind::Open => self.open_started = true,
            RegionKind::Closed => {}
        }

        if self.unrecordable.contains(&desc.owner) {
            debug!(
                "Skipping {}.{}, type {} is unrecordable",
                desc.type_name, desc.field_name, desc.type_name
            );
            return Ok(RootOutcome::Aborted);
        }

        let value = match self.heap.static_slot(desc.owner, desc.offset) {
            Some(Slot::Ref(value)) => value,
            _ => {
                return Err(ArchiveError::NotAReferenceField {
                    type_name: desc.type_name.clone(),
                    field: desc.field_name.clone(),
                })
            }
        };

        self.seen.reset();
        let region_mark = self.region(desc.region).mark();
        let cache_mark = self.cache.mark();
        let mut pass = PassStats {
            old_recorded_types: self
                .table
                .get(desc.owner)
                .map_or(0, |r| r.dependent_types().len()),
            ..PassStats::default()
        };

        let outcome = match value {
            Some(root) => self.walk(desc, root, &mut pass)?,
            None => RootOutcome::Null,
        };

        let entry = match outcome {
            RootOutcome::Archived(archived) => self.encode(archived)?,
            RootOutcome::External(index) => NarrowRef::external(index)?,
            RootOutcome::Null => NarrowRef::NULL,
            RootOutcome::Aborted => {
                self.region_mut(desc.region).rollback(region_mark);
                self.cache.rollback(cache_mark);
                self.table.remove(desc.owner);
                self.unrecordable.insert(desc.owner);
                self.stats.aborted_recordings += 1;
                warn!(
                    "Aborted archiving {}.{}: reached an object that cannot be archived in the {} region",
                    desc.type_name, desc.field_name, desc.region
                );
                return Ok(RootOutcome::Aborted);
            }
        };

        self.table.record_mut(desc.owner).add_entry_field(EntryField {
            offset: desc.offset,
            value: entry,
            region: desc.region,
        });
        self.stats.add_pass(&pass);
        debug!(
            "Archived {}.{} into {} region: walked {}, archived {}, old recorded types {}",
            desc.type_name,
            desc.field_name,
            desc.region,
            pass.walked,
            pass.archived,
            pass.old_recorded_types
        );

        Ok(outcome)
    }

    fn walk(
        &mut self,
        desc: &RootFieldDescriptor,
        root: ObjId,
        pass: &mut PassStats,
    ) -> Result<RootOutcome> {
        let heap = self.heap;
        let mut worklist = Vec::new();

        let root_ref = match self.visit(desc, root, pass)? {
            Visit::Reached(archived, work) => {
                worklist.extend(work);
                archived
            }
            Visit::External(index) => return Ok(RootOutcome::External(index)),
            Visit::Rejected => return Ok(RootOutcome::Aborted),
        };

        while let Some(work) = worklist.pop() {
            let (id, target) = match work {
                Work::Fill(id, archived) => (id, Some(archived)),
                Work::Walk(id) => (id, None),
            };
            let object = heap
                .object(id)
                .ok_or(ArchiveError::UnknownObject(id.index()))?;

            for (slot, child) in object.references() {
                let narrow = match self.visit(desc, child, pass)? {
                    Visit::Reached(archived, work) => {
                        worklist.extend(work);
                        self.encode(archived)?
                    }
                    Visit::External(index) => NarrowRef::external(index)?,
                    Visit::Rejected => return Ok(RootOutcome::Aborted),
                };
                if let Some(target) = target {
                    self.region_mut(target.region)
                        .write_ref(target, slot, narrow)?;
                }
            }
        }

        Ok(RootOutcome::Archived(root_ref))
    }

    fn visit(
        &mut self,
        desc: &RootFieldDescriptor,
        id: ObjId,
        pass: &mut PassStats,
    ) -> Result<Visit> {
        let heap = self.heap;
        let region = desc.region;

        if self.negative.disqualifies(id, region) {
            return Ok(Visit::Rejected);
        }

        if let Some(index) = heap.external_index(id) {
            return Ok(match region {
                RegionKind::Open => Visit::External(index),
                RegionKind::Closed => {
                    self.negative.mark(id, Disqualification::ReachesExternal);
                    Visit::Rejected
                }
            });
        }

        let object = heap
            .object(id)
            .ok_or(ArchiveError::UnknownObject(id.index()))?;
        let info = heap
            .type_info(object.ty)
            .ok_or_else(|| ArchiveError::UnknownType(format!("#{}", object.ty.0)))?;
        if !info.is_freezable() {
            self.negative.mark(id, Disqualification::Intrinsic);
            return Ok(Visit::Rejected);
        }

        self.table
            .record_mut(desc.owner)
            .add_dependent_type(object.ty);

        if !self.seen.insert(id) {
            // Reached earlier in this pass, so its copy already exists
            let archived = self
                .cache
                .get(id)
                .ok_or(ArchiveError::UnknownObject(id.index()))?;
            return Ok(Visit::Reached(archived, None));
        }
        pass.walked += 1;

        if let Some(archived) = self.cache.get(id) {
            return Ok(Visit::Reached(archived, Some(Work::Walk(id))));
        }

        let slots = u32::try_from(object.slots.len()).map_err(|_| {
            ArchiveError::ShapeMismatch(format!("Object {} has too many slots", id.index()))
        })?;
        let header = ObjectHeader {
            ty: object.ty,
            kind: info.kind,
            slots,
        };

        let buffer = self.region_mut(region);
        let archived = buffer.alloc_object(header)?;
        for (i, slot) in object.slots.iter().enumerate() {
            if let Slot::Prim(value) = slot {
                buffer.write_prim(archived, i, *value)?;
            }
        }
        self.cache.insert(id, archived);
        pass.archived += 1;
        trace!(
            "Copied object {} ({}) to {} region offset {:#x}",
            id.index(),
            info.name,
            region,
            archived.offset
        );

        Ok(Visit::Reached(archived, Some(Work::Fill(id, archived))))
    }

    fn locate(&self, addr: u64) -> Option<ArchiveRef> {
        RegionKind::ALL.into_iter().find_map(|kind| {
            self.region(kind)
                .offset_of(addr)
                .map(|offset| ArchiveRef {
                    region: kind,
                    offset,
                })
        })
    }

    /// Re-walk an archived root and check the copy mirrors the source graph.
    /// Returns the number of objects verified; zero if the root has no entry.
    pub fn verify_subgraph_from_static_field(&mut self, desc: &RootFieldDescriptor) -> Result<usize> {
        let verified = self.verify_root(desc)?;
        self.stats.verifications += verified;
        Ok(verified)
    }

    fn verify_root(&self, desc: &RootFieldDescriptor) -> Result<usize> {
        let entry = self
            .table
            .get(desc.owner)
            .and_then(|r| r.entry_fields().iter().find(|f| f.offset == desc.offset))
            .map(|f| f.value);
        let Some(entry) = entry else {
            return Ok(0);
        };

        let heap = self.heap;
        let root = match heap.static_slot(desc.owner, desc.offset) {
            Some(Slot::Ref(value)) => value,
            _ => {
                return Err(ArchiveError::NotAReferenceField {
                    type_name: desc.type_name.clone(),
                    field: desc.field_name.clone(),
                })
            }
        };

        let mut seen = AHashSet::new();
        let mut stack = Vec::new();
        self.check_reference(desc.region, root, entry, &mut seen, &mut stack)?;

        let mut verified = 0;
        while let Some((id, archived)) = stack.pop() {
            let object = heap
                .object(id)
                .ok_or(ArchiveError::UnknownObject(id.index()))?;
            let region = self.region(archived.region);
            let header = region.header(archived)?;
            if header.ty != object.ty || header.slots as usize != object.slots.len() {
                return Err(ArchiveError::corrupt(
                    archived.region,
                    format!("Object at {:#x} does not mirror its original", archived.offset),
                ));
            }

            for (i, slot) in object.slots.iter().enumerate() {
                let at = archived.offset as usize + (OBJECT_HEADER_WORDS + i) * WORD_SIZE;
                let word = read_word(region.bytes(), at).ok_or_else(|| {
                    ArchiveError::corrupt(archived.region, format!("Truncated slot at {:#x}", at))
                })?;
                match slot {
                    Slot::Prim(value) if word == *value => {}
                    Slot::Ref(child) if word >> 32 == 0 => {
                        let narrow = NarrowRef::from_raw(word as u32);
                        self.check_reference(archived.region, *child, narrow, &mut seen, &mut stack)?;
                    }
                    _ => {
                        return Err(ArchiveError::corrupt(
                            archived.region,
                            format!("Slot at {:#x} does not mirror its original", at),
                        ))
                    }
                }
            }
            verified += 1;
        }

        Ok(verified)
    }

    fn check_reference(
        &self,
        from: RegionKind,
        original: Option<ObjId>,
        narrow: NarrowRef,
        seen: &mut AHashSet<ObjId>,
        stack: &mut Vec<(ObjId, ArchiveRef)>,
    ) -> Result<()> {
        let mismatch = || {
            ArchiveError::corrupt(
                from,
                format!("Reference {:#x} does not mirror its original", narrow.raw()),
            )
        };

        let Some(id) = original else {
            return if narrow.is_null() { Ok(()) } else { Err(mismatch()) };
        };

        if let Some(index) = self.heap.external_index(id) {
            return if from == RegionKind::Open && narrow.external_index() == Some(index) {
                Ok(())
            } else {
                Err(mismatch())
            };
        }

        let addr = self.codec.decode(narrow).ok_or_else(mismatch)?;
        let archived = self.locate(addr).ok_or_else(mismatch)?;
        if self.cache.get(id) != Some(archived)
            || (from == RegionKind::Closed && archived.region == RegionKind::Open)
        {
            return Err(mismatch());
        }
        self.region(archived.region).header(archived)?;

        if seen.insert(id) {
            stack.push((id, archived));
        }
        Ok(())
    }

    pub fn finish(self) -> ArchiverOutput {
        ArchiverOutput {
            closed: self.closed,
            open: self.open,
            table: self.table,
            stats: self.stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checker::PreservabilityChecker;
    use crate::core::heap::{FieldKind, Heap, TypeBuilder};
    use crate::core::registry::RootRegistry;

    const BASE: u64 = 0x1_0000_0000;

    struct Fixture {
        heap: Heap,
        node: TypeKey,
        socket: TypeKey,
        holder: TypeKey,
    }

    fn fixture() -> Fixture {
        let mut heap = Heap::new();
        let node = heap
            .define_type(
                TypeBuilder::instance("Node")
                    .field(FieldKind::Ref)
                    .field(FieldKind::Ref)
                    .field(FieldKind::Prim),
            )
            .unwrap();
        let socket = heap
            .define_type(TypeBuilder::instance("Socket").with_native_state())
            .unwrap();
        let holder = heap
            .define_type(
                TypeBuilder::instance("Holder")
                    .static_ref("A", "Node")
                    .static_ref("B", "Node")
                    .static_ref("C", "Node"),
            )
            .unwrap();
        Fixture {
            heap,
            node,
            socket,
            holder,
        }
    }

    fn node(f: &mut Fixture, a: Option<ObjId>, b: Option<ObjId>, value: u64) -> ObjId {
        f.heap
            .alloc_instance(f.node, vec![Slot::Ref(a), Slot::Ref(b), Slot::Prim(value)])
            .unwrap()
    }

    fn descriptors(heap: &Heap, roots: &[(&str, RegionKind)]) -> Vec<RootFieldDescriptor> {
        let mut registry = RootRegistry::new();
        for (field, region) in roots {
            registry.register_root("Holder", field, *region);
        }
        let mut checker = PreservabilityChecker::new(heap);
        checker.check_all(&registry).unwrap().fields().to_vec()
    }

    fn archiver(heap: &Heap) -> GraphArchiver<'_, Heap> {
        let codec = ArchiveCodec::new(BASE, 3).unwrap();
        let closed = RegionBuffer::new(RegionKind::Closed, BASE, 4096).unwrap();
        let open = RegionBuffer::new(RegionKind::Open, BASE + 0x10_000, 4096).unwrap();
        GraphArchiver::new(heap, codec, closed, open, NegativeCache::new()).unwrap()
    }

    #[test]
    fn test_diamond_copied_once() {
        let mut f = fixture();
        let shared = node(&mut f, None, None, 7);
        let left = node(&mut f, Some(shared), None, 1);
        let right = node(&mut f, Some(shared), None, 2);
        let top = node(&mut f, Some(left), Some(right), 0);
        f.heap.set_static(f.holder, "A", Slot::Ref(Some(top))).unwrap();
        f.heap.set_static(f.holder, "B", Slot::Ref(Some(shared))).unwrap();

        let descs = descriptors(&f.heap, &[("A", RegionKind::Closed), ("B", RegionKind::Closed)]);
        let mut archiver = archiver(&f.heap);

        let first = archiver.archive_root(&descs[0]).unwrap();
        assert_eq!(archiver.cache().len(), 4);
        let second = archiver.archive_root(&descs[1]).unwrap();
        assert_eq!(archiver.cache().len(), 4);
        assert_eq!(second, RootOutcome::Archived(archiver.cache().get(shared).unwrap()));
        assert!(matches!(first, RootOutcome::Archived(_)));

        assert_eq!(archiver.stats().archived, 4);
        assert_eq!(archiver.stats().recordings, 2);
        // Node was already on record when B was recorded
        assert_eq!(archiver.stats().old_recorded_types, 1);
        let record = archiver.table().get(f.holder).unwrap();
        assert_eq!(record.dependent_types(), &[f.node]);
        assert_eq!(record.entry_fields().len(), 2);

        assert_eq!(archiver.verify_subgraph_from_static_field(&descs[0]).unwrap(), 4);
        assert_eq!(archiver.verify_subgraph_from_static_field(&descs[1]).unwrap(), 1);
        assert_eq!(archiver.stats().verifications, 5);
    }

    #[test]
    fn test_cycle_terminates_and_encodes_refs() {
        let mut f = fixture();
        let a = node(&mut f, None, None, 1);
        let b = node(&mut f, Some(a), None, 2);
        f.heap.set_slot(a, 0, Slot::Ref(Some(b))).unwrap();
        f.heap.set_slot(a, 1, Slot::Ref(Some(a))).unwrap();
        f.heap.set_static(f.holder, "A", Slot::Ref(Some(a))).unwrap();

        let descs = descriptors(&f.heap, &[("A", RegionKind::Closed)]);
        let mut archiver = archiver(&f.heap);
        archiver.archive_root(&descs[0]).unwrap();

        let a_ref = archiver.cache().get(a).unwrap();
        let b_ref = archiver.cache().get(b).unwrap();
        let closed = archiver.region(RegionKind::Closed);
        let codec = *archiver.codec();

        assert_eq!(
            codec.decode(closed.read_ref(a_ref, 0).unwrap()),
            Some(closed.address_of(b_ref.offset))
        );
        assert_eq!(
            codec.decode(closed.read_ref(a_ref, 1).unwrap()),
            Some(closed.address_of(a_ref.offset))
        );
        // Three reference slots written, the null one in b is not tracked
        assert_eq!(closed.embedded().count_ones(), 3);
        assert_eq!(archiver.verify_subgraph_from_static_field(&descs[0]).unwrap(), 2);
    }

    #[test]
    fn test_external_reference_in_open_region() {
        let mut f = fixture();
        let shared = node(&mut f, None, None, 0);
        let index = f.heap.register_external(shared).unwrap();
        let top = node(&mut f, Some(shared), None, 0);
        f.heap.set_static(f.holder, "A", Slot::Ref(Some(top))).unwrap();
        f.heap.set_static(f.holder, "B", Slot::Ref(Some(shared))).unwrap();

        let descs = descriptors(&f.heap, &[("A", RegionKind::Open), ("B", RegionKind::Open)]);
        let mut archiver = archiver(&f.heap);

        let top_ref = match archiver.archive_root(&descs[0]).unwrap() {
            RootOutcome::Archived(archived) => archived,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(top_ref.region, RegionKind::Open);
        let narrow = archiver.region(RegionKind::Open).read_ref(top_ref, 0).unwrap();
        assert_eq!(narrow.external_index(), Some(index));
        assert!(archiver.cache().get(shared).is_none());

        assert_eq!(
            archiver.archive_root(&descs[1]).unwrap(),
            RootOutcome::External(index)
        );
        assert_eq!(archiver.verify_subgraph_from_static_field(&descs[0]).unwrap(), 1);
    }

    #[test]
    fn test_abort_rolls_back_pass() {
        let mut f = fixture();
        let good = node(&mut f, None, None, 5);
        let sock = f.heap.alloc_instance(f.socket, vec![]).unwrap();
        let inner = node(&mut f, None, None, 6);
        let bad = node(&mut f, Some(inner), Some(sock), 0);
        f.heap.set_static(f.holder, "A", Slot::Ref(Some(good))).unwrap();
        f.heap.set_static(f.holder, "B", Slot::Ref(Some(bad))).unwrap();

        let descs = descriptors(&f.heap, &[("A", RegionKind::Closed), ("B", RegionKind::Closed)]);
        let mut archiver = archiver(&f.heap);

        archiver.archive_root(&descs[0]).unwrap();
        let used = archiver.region(RegionKind::Closed).used();
        let bits = archiver.region(RegionKind::Closed).embedded().count_ones();

        assert_eq!(archiver.archive_root(&descs[1]).unwrap(), RootOutcome::Aborted);
        assert_eq!(archiver.region(RegionKind::Closed).used(), used);
        assert_eq!(archiver.region(RegionKind::Closed).embedded().count_ones(), bits);
        assert!(archiver.cache().get(bad).is_none());
        assert!(archiver.cache().get(inner).is_none());
        assert!(archiver.cache().get(good).is_some());

        assert!(archiver.is_unrecordable(f.holder));
        assert!(archiver.table().get(f.holder).is_none());
        assert_eq!(archiver.stats().aborted_recordings, 1);

        // Later roots of the same type are skipped
        assert_eq!(archiver.archive_root(&descs[0]).unwrap(), RootOutcome::Aborted);
    }

    #[test]
    fn test_closed_after_open_rejected() {
        let mut f = fixture();
        let a = node(&mut f, None, None, 0);
        f.heap.set_static(f.holder, "A", Slot::Ref(Some(a))).unwrap();

        let descs = descriptors(&f.heap, &[("A", RegionKind::Open), ("B", RegionKind::Closed)]);
        let mut archiver = archiver(&f.heap);
        archiver.archive_root(&descs[0]).unwrap();
        assert!(matches!(
            archiver.archive_root(&descs[1]),
            Err(ArchiveError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_null_root_records_null_entry() {
        let f = fixture();
        let descs = descriptors(&f.heap, &[("C", RegionKind::Closed)]);
        let mut archiver = archiver(&f.heap);

        assert_eq!(archiver.archive_root(&descs[0]).unwrap(), RootOutcome::Null);
        let record = archiver.table().get(f.holder).unwrap();
        assert_eq!(record.entry_fields()[0].value, NarrowRef::NULL);
        assert!(record.dependent_types().is_empty());
    }

    #[test]
    fn test_region_overflow_is_fatal() {
        let mut f = fixture();
        let a = node(&mut f, None, None, 0);
        let b = node(&mut f, Some(a), None, 0);
        f.heap.set_static(f.holder, "A", Slot::Ref(Some(b))).unwrap();

        let descs = descriptors(&f.heap, &[("A", RegionKind::Closed)]);
        let codec = ArchiveCodec::new(BASE, 3).unwrap();
        // Marker plus one 5-word object
        let closed = RegionBuffer::new(RegionKind::Closed, BASE, 48).unwrap();
        let open = RegionBuffer::new(RegionKind::Open, BASE + 0x1000, 64).unwrap();
        let mut archiver =
            GraphArchiver::new(&f.heap, codec, closed, open, NegativeCache::new()).unwrap();

        assert!(matches!(
            archiver.archive_root(&descs[0]),
            Err(ArchiveError::RegionOverflow { .. })
        ));
    }
}
