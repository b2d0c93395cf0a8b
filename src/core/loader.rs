//! Load session
//!
//! Owns everything the runtime needs between mapping an archive and
//! handing out archived objects:
//!
//! 1. [`LoadSession::new`] validates the archive bytes and splits them
//!    into regions, bitmaps and the subgraph table.
//! 2. The heap collaborator assigns each region its runtime address with
//!    [`LoadSession::map_region`] and the runtime fixes its codec with
//!    [`LoadSession::init_decoding`].
//! 3. [`LoadSession::fixup_mapped_regions`] relocates every mapped region,
//!    once.
//! 4. Types are materialized with [`LoadSession::initialize_from_archive`]
//!    or [`LoadSession::initialize_type`], and archived objects are read
//!    through [`LoadSession::object`].
//!
//! No view of an archived object can be created before its region is
//! relocated.

use crate::core::bitmap::RelocationBitmap;
use crate::core::codec::{ArchiveCodec, DecodingState, LiveRef, NarrowRef, WORD_SIZE};
use crate::core::error::{ArchiveError, Result};
use crate::core::header::ArchiveHeader;
use crate::core::heap::{ObjectKind, TypeKey};
use crate::core::image::ArchiveLayout;
use crate::core::region::{
    read_object_header, read_word, ObjectHeader, RegionKind, OBJECT_HEADER_WORDS,
};
use crate::core::relocation::{relocate, RegionMapping, RelocationContext, RelocationReport};
use crate::core::subgraph::{ArchivedSubgraphRecord, CompiledSubgraphTable, EntryField};
use tracing::{debug, info};

/// Value materialized into a static field or read from an archived slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Null,
    Archived(LiveRef),
    /// Live object the runtime recreates itself, by external index
    External(u32),
}

/// Static storage of the types being initialized
pub trait StaticFieldStore {
    fn write_static(&mut self, ty: TypeKey, offset: u32, value: FieldValue);
}

/// Class-initialization collaborator
pub trait TypeInitializer: StaticFieldStore {
    /// Run the type's normal initializer code
    fn run_initializer(&mut self, ty: TypeKey);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Every field came from the archive
    Archived,
    /// Archived fields first, then the initializer for the rest
    ArchivedThenInitialized,
    /// Not in the archive; initializer only
    Initialized,
}

#[derive(Debug)]
struct MappedRegion<'a> {
    bytes: &'a mut [u8],
    bitmap: RelocationBitmap,
    dump_base: u64,
    mapped_base: Option<u64>,
    relocated: bool,
}

impl MappedRegion<'_> {
    fn mapping(&self, kind: RegionKind) -> Option<RegionMapping> {
        Some(RegionMapping {
            kind,
            dump_base: self.dump_base,
            mapped_base: self.mapped_base?,
            len: self.bytes.len(),
        })
    }

    fn contains(&self, addr: u64) -> Option<usize> {
        let delta = addr.checked_sub(self.mapped_base?)?;
        if delta < self.bytes.len() as u64 {
            Some(delta as usize)
        } else {
            None
        }
    }
}

/// Read-only view of one archived object in a relocated region
#[derive(Debug, Clone, Copy)]
pub struct ArchivedObject<'s> {
    addr: LiveRef,
    region: RegionKind,
    header: ObjectHeader,
    bytes: &'s [u8],
    offset: usize,
    bitmap: &'s RelocationBitmap,
    codec: &'s ArchiveCodec,
}

impl<'s> ArchivedObject<'s> {
    pub fn addr(&self) -> LiveRef {
        self.addr
    }

    pub fn region(&self) -> RegionKind {
        self.region
    }

    pub fn type_key(&self) -> TypeKey {
        self.header.ty
    }

    pub fn kind(&self) -> ObjectKind {
        self.header.kind
    }

    pub fn len(&self) -> usize {
        self.header.slots as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.slots == 0
    }

    fn slot_offset(&self, index: usize) -> Result<usize> {
        if index >= self.len() {
            return Err(ArchiveError::ShapeMismatch(format!(
                "Slot {} out of bounds for object of {} slots",
                index,
                self.len()
            )));
        }
        Ok(self.offset + (OBJECT_HEADER_WORDS + index) * WORD_SIZE)
    }

    /// Raw word of a primitive slot
    pub fn prim(&self, index: usize) -> Result<u64> {
        let at = self.slot_offset(index)?;
        if self.bitmap.is_set(at / WORD_SIZE) {
            return Err(ArchiveError::ShapeMismatch(format!("Slot {} holds a reference", index)));
        }
        read_word(self.bytes, at).ok_or_else(|| ArchiveError::corrupt(self.region, "Truncated object"))
    }

    /// Decoded value of a reference slot
    pub fn reference(&self, index: usize) -> Result<FieldValue> {
        let at = self.slot_offset(index)?;
        let word = read_word(self.bytes, at)
            .ok_or_else(|| ArchiveError::corrupt(self.region, "Truncated object"))?;
        if word == 0 {
            return Ok(FieldValue::Null);
        }
        if !self.bitmap.is_set(at / WORD_SIZE) {
            return Err(ArchiveError::ShapeMismatch(format!(
                "Slot {} holds a primitive",
                index
            )));
        }

        let narrow = NarrowRef::from_raw(word as u32);
        if let Some(index) = narrow.external_index() {
            return Ok(FieldValue::External(index));
        }
        let addr = self
            .codec
            .decode(narrow)
            .ok_or(ArchiveError::DecodeOutOfRange(word))?;
        LiveRef::new(addr)
            .map(FieldValue::Archived)
            .ok_or(ArchiveError::DecodeOutOfRange(addr))
    }
}

pub struct LoadSession<'a> {
    header: ArchiveHeader,
    decoding: DecodingState,
    closed: MappedRegion<'a>,
    open: MappedRegion<'a>,
    table: CompiledSubgraphTable<'a>,
}

impl<'a> LoadSession<'a> {
    /// Validate an archive and take it over for loading. The bytes are
    /// patched in place by relocation, so pass a private copy or a
    /// copy-on-write mapping.
    pub fn new(bytes: &'a mut [u8]) -> Result<Self> {
        let layout = ArchiveLayout::parse(bytes)?;
        let header = *layout.header();
        let parts = layout.split_mut(bytes)?;

        let closed_bitmap = RelocationBitmap::from_bytes(parts.closed_bitmap, parts.closed.len())?;
        let open_bitmap = RelocationBitmap::from_bytes(parts.open_bitmap, parts.open.len())?;
        let table = CompiledSubgraphTable::from_bytes(parts.table)?;

        info!(
            "Opened archive: closed {} bytes, open {} bytes, {} subgraph records",
            parts.closed.len(),
            parts.open.len(),
            table.len()
        );

        Ok(LoadSession {
            closed: MappedRegion {
                bytes: parts.closed,
                bitmap: closed_bitmap,
                dump_base: header.closed.dump_base,
                mapped_base: None,
                relocated: false,
            },
            open: MappedRegion {
                bytes: parts.open,
                bitmap: open_bitmap,
                dump_base: header.open.dump_base,
                mapped_base: None,
                relocated: false,
            },
            header,
            decoding: DecodingState::new(),
            table,
        })
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    pub fn table(&self) -> &CompiledSubgraphTable<'a> {
        &self.table
    }

    fn region(&self, kind: RegionKind) -> &MappedRegion<'a> {
        match kind {
            RegionKind::Closed => &self.closed,
            RegionKind::Open => &self.open,
        }
    }

    fn region_mut(&mut self, kind: RegionKind) -> &mut MappedRegion<'a> {
        match kind {
            RegionKind::Closed => &mut self.closed,
            RegionKind::Open => &mut self.open,
        }
    }

    /// Fix the runtime address of a region's first byte
    pub fn map_region(&mut self, kind: RegionKind, mapped_base: u64) -> Result<()> {
        let region = self.region_mut(kind);
        if region.relocated {
            return Err(ArchiveError::AlreadyRelocated(kind));
        }
        if mapped_base == 0 || mapped_base % WORD_SIZE as u64 != 0 {
            return Err(ArchiveError::InvalidConfig(format!(
                "{} region cannot be mapped at {:#x}",
                kind, mapped_base
            )));
        }
        if mapped_base.checked_add(region.bytes.len() as u64).is_none() {
            return Err(ArchiveError::InvalidConfig(format!(
                "{} region mapped at {:#x} wraps the address space",
                kind, mapped_base
            )));
        }
        region.mapped_base = Some(mapped_base);
        debug!("Mapped {} region at {:#x}", kind, mapped_base);
        Ok(())
    }

    pub fn is_region_mapped(&self, kind: RegionKind) -> bool {
        self.region(kind).mapped_base.is_some()
    }

    pub fn is_relocated(&self, kind: RegionKind) -> bool {
        self.region(kind).relocated
    }

    /// Establish the runtime codec. Must happen exactly once, before relocation.
    pub fn init_decoding(&self, base: u64, shift: u32) -> Result<()> {
        self.decoding.init_decoding(base, shift)
    }

    pub fn decoding(&self) -> &DecodingState {
        &self.decoding
    }

    fn mappings(&self) -> Vec<RegionMapping> {
        RegionKind::ALL
            .into_iter()
            .filter_map(|kind| self.region(kind).mapping(kind))
            .collect()
    }

    /// Relocate one mapped region
    pub fn relocate_region(&mut self, kind: RegionKind) -> Result<RelocationReport> {
        let runtime_codec = *self.decoding.codec()?;
        let dump_codec = self.header.codec()?;
        if self.region(kind).relocated {
            return Err(ArchiveError::AlreadyRelocated(kind));
        }
        if !self.is_region_mapped(kind) {
            return Err(ArchiveError::RegionNotMapped(kind));
        }
        if kind == RegionKind::Open && !self.is_region_mapped(RegionKind::Closed) {
            return Err(ArchiveError::RegionNotMapped(RegionKind::Closed));
        }

        let mappings = self.mappings();
        let ctx = RelocationContext {
            dump_codec,
            runtime_codec,
            mappings: &mappings,
        };
        let region = self.region_mut(kind);
        let report = relocate(kind, region.bytes, &region.bitmap, &ctx)?;
        region.relocated = true;
        Ok(report)
    }

    /// Relocate every mapped region that has not been relocated yet.
    /// An open region cannot be used without the closed region it may point into.
    pub fn fixup_mapped_regions(&mut self) -> Result<RelocationReport> {
        self.decoding.codec()?;
        if self.is_region_mapped(RegionKind::Open) && !self.is_region_mapped(RegionKind::Closed) {
            return Err(ArchiveError::RegionNotMapped(RegionKind::Closed));
        }

        let mut total = RelocationReport::default();
        for kind in RegionKind::ALL {
            if self.is_region_mapped(kind) && !self.is_relocated(kind) {
                let report = self.relocate_region(kind)?;
                total.references += report.references;
                total.external += report.external;
                total.rewritten += report.rewritten;
            }
        }

        info!(
            "Relocated mapped regions: {} references, {} rewritten",
            total.references, total.rewritten
        );
        Ok(total)
    }

    /// Region and offset of a runtime address inside a mapped region
    fn locate(&self, addr: u64) -> Option<(RegionKind, usize)> {
        RegionKind::ALL
            .into_iter()
            .find_map(|kind| self.region(kind).contains(addr).map(|offset| (kind, offset)))
    }

    pub fn lookup(&self, ty: TypeKey) -> Option<ArchivedSubgraphRecord<'a>> {
        self.table.lookup(ty)
    }

    /// View of an archived object
    pub fn object(&self, addr: LiveRef) -> Result<ArchivedObject<'_>> {
        let (kind, offset) = self
            .locate(addr.addr())
            .ok_or(ArchiveError::DecodeOutOfRange(addr.addr()))?;
        let region = self.region(kind);
        if !region.relocated {
            return Err(ArchiveError::NotRelocated);
        }
        let header = read_object_header(kind, &*region.bytes, offset)?;

        Ok(ArchivedObject {
            addr,
            region: kind,
            header,
            bytes: &*region.bytes,
            offset,
            bitmap: &region.bitmap,
            codec: self.decoding.codec()?,
        })
    }

    /// Whether `addr` is the start of an object in a relocated region
    ///
    /// Walks the object headers of the region up to `addr`, so an address
    /// inside an object never counts even when its word looks like a header.
    pub fn is_archived_object(&self, addr: LiveRef) -> bool {
        let (kind, target) = match self.locate(addr.addr()) {
            Some(found) => found,
            None => return false,
        };
        let region = self.region(kind);
        if !region.relocated {
            return false;
        }

        let mut offset = WORD_SIZE;
        while offset < target {
            match read_object_header(kind, &*region.bytes, offset) {
                Ok(header) => offset += header.size_in_bytes(),
                Err(_) => return false,
            }
        }
        offset == target && read_object_header(kind, &*region.bytes, offset).is_ok()
    }

    fn decode_entry(&self, owner: TypeKey, field: &EntryField) -> Result<FieldValue> {
        if field.value.is_null() {
            return Ok(FieldValue::Null);
        }
        if let Some(index) = field.value.external_index() {
            if field.region == RegionKind::Closed {
                return Err(ArchiveError::CorruptTable(format!(
                    "Closed entry field of type #{} is external",
                    owner.0
                )));
            }
            return Ok(FieldValue::External(index));
        }

        let dump_addr = self
            .header
            .codec()?
            .decode(field.value)
            .ok_or(ArchiveError::DecodeOutOfRange(field.value.raw() as u64))?;
        let (kind, mapping) = self
            .mappings()
            .into_iter()
            .find_map(|m| m.translate(dump_addr).map(|addr| (m.kind, addr)))
            .ok_or(ArchiveError::DecodeOutOfRange(dump_addr))?;

        if field.region == RegionKind::Closed && kind != RegionKind::Closed {
            return Err(ArchiveError::CorruptTable(format!(
                "Closed entry field of type #{} points into the {} region",
                owner.0, kind
            )));
        }

        let region = self.region(kind);
        let offset = region
            .contains(mapping)
            .ok_or(ArchiveError::DecodeOutOfRange(mapping))?;
        read_object_header(kind, &*region.bytes, offset)?;

        LiveRef::new(mapping)
            .map(FieldValue::Archived)
            .ok_or(ArchiveError::DecodeOutOfRange(mapping))
    }

    /// Materialize a type's archived static fields.
    ///
    /// Returns false on a table miss or when a region the entries need is not
    /// mapped, in which case nothing is written and the caller falls back to
    /// normal initialization. Entries are decoded and validated before any
    /// field is written.
    pub fn initialize_from_archive<S: StaticFieldStore>(
        &self,
        ty: TypeKey,
        store: &mut S,
    ) -> Result<bool> {
        let Some(record) = self.lookup(ty) else {
            debug!("Type #{} not in archive", ty.0);
            return Ok(false);
        };

        for field in record.entry_fields() {
            if !self.is_region_mapped(field.region)
                || (field.region == RegionKind::Open && !self.is_region_mapped(RegionKind::Closed))
            {
                debug!(
                    "Type #{} needs the unmapped {} region, falling back",
                    ty.0, field.region
                );
                return Ok(false);
            }
        }
        for kind in RegionKind::ALL {
            if self.is_region_mapped(kind) && !self.is_relocated(kind) {
                return Err(ArchiveError::NotRelocated);
            }
        }

        let values = record
            .entry_fields()
            .map(|field| {
                self.decode_entry(ty, &field)
                    .map(|value| (field.offset, value))
            })
            .collect::<Result<Vec<_>>>()?;

        for (offset, value) in values {
            store.write_static(ty, offset, value);
        }
        debug!(
            "Materialized {} fields of type #{} from the archive",
            record.field_count(),
            ty.0
        );
        Ok(true)
    }

    /// Initialize a type: archive first, then the type's initializer if the
    /// archive did not cover all of it. The initializer's writes win.
    pub fn initialize_type<I: TypeInitializer>(
        &self,
        ty: TypeKey,
        initializer: &mut I,
    ) -> Result<InitOutcome> {
        if !self.initialize_from_archive(ty, initializer)? {
            initializer.run_initializer(ty);
            return Ok(InitOutcome::Initialized);
        }

        let partial = self.lookup(ty).map_or(false, |r| r.is_partial());
        if partial {
            initializer.run_initializer(ty);
            Ok(InitOutcome::ArchivedThenInitialized)
        } else {
            Ok(InitOutcome::Archived)
        }
    }
}
