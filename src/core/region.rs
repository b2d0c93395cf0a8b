//! Archive regions and the archived object layout
//!
//! Every region starts with a one-word marker so that no object ever sits
//! at the region base. Objects follow back to back, word aligned:
//!
//! ```text
//! word 0       type key (bits 0..32) | object kind (bits 32..40)
//! word 1       slot count
//! word 2..     one word per slot; reference slots hold a NarrowRef
//! ```

use crate::core::bitmap::RelocationBitmap;
use crate::core::codec::{NarrowRef, WORD_SIZE};
use crate::core::error::{ArchiveError, Result};
use crate::core::heap::{ObjectKind, TypeKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Region marker, low byte carries the region kind
pub const REGION_MARKER: u64 = u64::from_le_bytes(*b"\x00HREGION");

pub const OBJECT_HEADER_WORDS: usize = 2;

/// Largest region whose object offsets all fit in a `u32`
pub const MAX_REGION_CAPACITY: usize = (u32::MAX as usize) & !(WORD_SIZE - 1);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    /// Fully immutable; nothing in it points outside the archive
    Closed = 0,
    /// May point at live objects the runtime recreates itself
    #[default]
    Open = 1,
}

impl RegionKind {
    pub const ALL: [RegionKind; 2] = [RegionKind::Closed, RegionKind::Open];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RegionKind::Closed),
            1 => Some(RegionKind::Open),
            _ => None,
        }
    }

    pub fn marker(self) -> u64 {
        REGION_MARKER | self as u64
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Closed => f.write_str("closed"),
            RegionKind::Open => f.write_str("open"),
        }
    }
}

/// Dump-time handle to an archived object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveRef {
    pub region: RegionKind,
    /// Byte offset of the object header within the region
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub ty: TypeKey,
    pub kind: ObjectKind,
    pub slots: u32,
}

impl ObjectHeader {
    pub fn size_in_bytes(&self) -> usize {
        (OBJECT_HEADER_WORDS + self.slots as usize) * WORD_SIZE
    }

    pub fn to_words(&self) -> [u64; OBJECT_HEADER_WORDS] {
        [
            self.ty.0 as u64 | (self.kind as u64) << 32,
            self.slots as u64,
        ]
    }

    pub fn from_words(kind: RegionKind, words: [u64; OBJECT_HEADER_WORDS]) -> Result<Self> {
        if words[0] >> 40 != 0 || words[1] >> 32 != 0 {
            return Err(ArchiveError::corrupt(kind, "Malformed object header"));
        }
        let object_kind = ObjectKind::from_u8((words[0] >> 32) as u8)
            .ok_or_else(|| ArchiveError::corrupt(kind, "Unknown object kind"))?;
        Ok(ObjectHeader {
            ty: TypeKey(words[0] as u32),
            kind: object_kind,
            slots: words[1] as u32,
        })
    }
}

/// Read a little-endian word, `None` if out of bounds
pub fn read_word(bytes: &[u8], offset: usize) -> Option<u64> {
    let end = offset.checked_add(WORD_SIZE)?;
    let chunk = bytes.get(offset..end)?;
    let mut word = [0u8; WORD_SIZE];
    word.copy_from_slice(chunk);
    Some(u64::from_le_bytes(word))
}

pub fn write_word(bytes: &mut [u8], offset: usize, value: u64) -> Option<()> {
    let end = offset.checked_add(WORD_SIZE)?;
    bytes
        .get_mut(offset..end)?
        .copy_from_slice(&value.to_le_bytes());
    Some(())
}

/// Read and validate the header of the object at `offset`
pub fn read_object_header(kind: RegionKind, bytes: &[u8], offset: usize) -> Result<ObjectHeader> {
    if offset < WORD_SIZE || offset % WORD_SIZE != 0 {
        return Err(ArchiveError::corrupt(
            kind,
            format!("Invalid object offset {:#x}", offset),
        ));
    }
    let truncated = || ArchiveError::corrupt(kind, format!("Truncated object at {:#x}", offset));
    let words = [
        read_word(bytes, offset).ok_or_else(truncated)?,
        read_word(bytes, offset + WORD_SIZE).ok_or_else(truncated)?,
    ];
    let header = ObjectHeader::from_words(kind, words)?;
    if offset + header.size_in_bytes() > bytes.len() {
        return Err(truncated());
    }
    Ok(header)
}

/// Dump-time copy destination for one region
///
/// Memory grows by bump allocation up to the capacity the heap allocator
/// granted. Every reference slot written is recorded in `embedded`, which
/// becomes the region's relocation bitmap.
#[derive(Debug)]
pub struct RegionBuffer {
    kind: RegionKind,
    base: u64,
    capacity: usize,
    bytes: Vec<u8>,
    embedded: RelocationBitmap,
}

impl RegionBuffer {
    pub fn new(kind: RegionKind, base: u64, capacity: usize) -> Result<Self> {
        if capacity < WORD_SIZE || capacity % WORD_SIZE != 0 {
            return Err(ArchiveError::InvalidConfig(format!(
                "{} region capacity {} must be a non-zero multiple of {}",
                kind, capacity, WORD_SIZE
            )));
        }
        if capacity > MAX_REGION_CAPACITY {
            return Err(ArchiveError::InvalidConfig(format!(
                "{} region capacity {} exceeds the {} byte offset limit",
                kind, capacity, MAX_REGION_CAPACITY
            )));
        }
        let mut bytes = Vec::with_capacity(capacity.min(1 << 20));
        bytes.extend_from_slice(&kind.marker().to_le_bytes());

        Ok(RegionBuffer {
            kind,
            base,
            capacity,
            bytes,
            embedded: RelocationBitmap::new(capacity / WORD_SIZE),
        })
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn embedded(&self) -> &RelocationBitmap {
        &self.embedded
    }

    pub fn address_of(&self, offset: u32) -> u64 {
        self.base + offset as u64
    }

    /// Region offset for a dump-time address inside the used part of this region
    pub fn offset_of(&self, addr: u64) -> Option<u32> {
        let delta = addr.checked_sub(self.base)?;
        if delta < self.bytes.len() as u64 {
            Some(delta as u32)
        } else {
            None
        }
    }

    /// Reserve zeroed space for an object and write its header
    pub fn alloc_object(&mut self, header: ObjectHeader) -> Result<ArchiveRef> {
        let size = header.size_in_bytes();
        let offset = self.bytes.len();
        let requested = offset + size;
        if requested > self.capacity {
            return Err(ArchiveError::RegionOverflow {
                kind: self.kind,
                requested,
                capacity: self.capacity,
            });
        }

        self.bytes.resize(requested, 0);
        for (i, word) in header.to_words().iter().enumerate() {
            write_word(&mut self.bytes, offset + i * WORD_SIZE, *word);
        }

        Ok(ArchiveRef {
            region: self.kind,
            offset: offset as u32,
        })
    }

    fn slot_offset(&self, object: ArchiveRef, slot: usize) -> Result<usize> {
        let header = read_object_header(self.kind, &self.bytes, object.offset as usize)?;
        if slot >= header.slots as usize {
            return Err(ArchiveError::corrupt(
                self.kind,
                format!("Slot {} out of bounds at {:#x}", slot, object.offset),
            ));
        }
        Ok(object.offset as usize + (OBJECT_HEADER_WORDS + slot) * WORD_SIZE)
    }

    pub fn write_prim(&mut self, object: ArchiveRef, slot: usize, value: u64) -> Result<()> {
        let at = self.slot_offset(object, slot)?;
        write_word(&mut self.bytes, at, value);
        self.embedded.clear(at / WORD_SIZE);
        Ok(())
    }

    pub fn write_ref(&mut self, object: ArchiveRef, slot: usize, value: NarrowRef) -> Result<()> {
        let at = self.slot_offset(object, slot)?;
        write_word(&mut self.bytes, at, value.raw() as u64);
        if value.is_null() {
            self.embedded.clear(at / WORD_SIZE);
        } else {
            self.embedded.set(at / WORD_SIZE);
        }
        Ok(())
    }

    pub fn read_ref(&self, object: ArchiveRef, slot: usize) -> Result<NarrowRef> {
        let at = self.slot_offset(object, slot)?;
        let word = read_word(&self.bytes, at).unwrap_or_default();
        Ok(NarrowRef::from_raw(word as u32))
    }

    pub fn header(&self, object: ArchiveRef) -> Result<ObjectHeader> {
        read_object_header(self.kind, &self.bytes, object.offset as usize)
    }

    /// Current allocation top, for [`RegionBuffer::rollback`]
    pub fn mark(&self) -> usize {
        self.bytes.len()
    }

    /// Drop every object allocated since `mark`
    pub fn rollback(&mut self, mark: usize) {
        if mark >= self.bytes.len() {
            return;
        }
        for word in mark / WORD_SIZE..self.bytes.len() / WORD_SIZE {
            self.embedded.clear(word);
        }
        self.bytes.truncate(mark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(slots: u32) -> ObjectHeader {
        ObjectHeader {
            ty: TypeKey(7),
            kind: ObjectKind::RefArray,
            slots,
        }
    }

    #[test]
    fn test_region_starts_with_marker() {
        let region = RegionBuffer::new(RegionKind::Open, 0x10_000, 4096).unwrap();
        assert_eq!(region.used(), WORD_SIZE);
        assert_eq!(read_word(region.bytes(), 0), Some(RegionKind::Open.marker()));
    }

    #[test]
    fn test_alloc_and_header_roundtrip() {
        let mut region = RegionBuffer::new(RegionKind::Closed, 0x10_000, 4096).unwrap();
        let obj = region.alloc_object(header(3)).unwrap();
        assert_eq!(obj.offset, 8);
        assert_eq!(region.header(obj).unwrap(), header(3));
        assert_eq!(region.used(), 8 + 5 * 8);
        assert_eq!(region.offset_of(0x10_008), Some(8));
        assert_eq!(region.offset_of(0x10_000 + 4000), None);
    }

    #[test]
    fn test_ref_slots_are_tracked() {
        let mut region = RegionBuffer::new(RegionKind::Closed, 0x10_000, 4096).unwrap();
        let obj = region.alloc_object(header(2)).unwrap();
        region.write_ref(obj, 1, NarrowRef::from_raw(5)).unwrap();

        // header words 1..=2, slot 1 is word 4
        assert!(region.embedded().is_set(4));
        assert!(!region.embedded().is_set(3));
        assert_eq!(region.read_ref(obj, 1).unwrap(), NarrowRef::from_raw(5));

        region.write_ref(obj, 1, NarrowRef::NULL).unwrap();
        assert!(!region.embedded().is_set(4));
        assert!(region.write_ref(obj, 2, NarrowRef::NULL).is_err());
    }

    #[test]
    fn test_capacity_beyond_u32_offsets_rejected() {
        let result = RegionBuffer::new(RegionKind::Closed, 0x10_000, MAX_REGION_CAPACITY + WORD_SIZE);
        assert!(matches!(result, Err(ArchiveError::InvalidConfig(_))));
        assert_eq!(MAX_REGION_CAPACITY % WORD_SIZE, 0);
        assert!(MAX_REGION_CAPACITY <= u32::MAX as usize);
    }

    #[test]
    fn test_overflow() {
        let mut region = RegionBuffer::new(RegionKind::Open, 0, 64).unwrap();
        region.alloc_object(header(2)).unwrap();
        let result = region.alloc_object(header(2));
        assert!(matches!(
            result,
            Err(ArchiveError::RegionOverflow {
                kind: RegionKind::Open,
                requested: 72,
                capacity: 64,
            })
        ));
    }

    #[test]
    fn test_rollback_clears_bitmap() {
        let mut region = RegionBuffer::new(RegionKind::Open, 0, 4096).unwrap();
        let keep = region.alloc_object(header(1)).unwrap();
        let mark = region.mark();
        let dropped = region.alloc_object(header(1)).unwrap();
        region.write_ref(dropped, 0, NarrowRef::from_raw(1)).unwrap();

        region.rollback(mark);
        assert_eq!(region.used(), mark);
        assert_eq!(region.embedded().count_ones(), 0);
        assert!(region.header(keep).is_ok());
        assert!(region.header(dropped).is_err());
    }

    #[test]
    fn test_malformed_header_rejected() {
        let words = [u64::MAX, 1];
        assert!(ObjectHeader::from_words(RegionKind::Closed, words).is_err());
    }
}
