//! Relocation engine
//!
//! At dump time the bitmap of a region is simply the set of words the
//! archiver wrote references into. At load time every marked word is
//! decoded against the dump-time codec, moved by the difference between
//! the dump-time and mapped base of whichever region it points into, and
//! re-encoded against the runtime codec.
//!
//! Relocation is two-phase: every marked word is decoded and validated
//! before the first write, so a corrupt region is rejected untouched.

use crate::core::bitmap::RelocationBitmap;
use crate::core::codec::{ArchiveCodec, NarrowRef, WORD_SIZE};
use crate::core::error::{ArchiveError, Result};
use crate::core::region::{read_word, write_word, RegionBuffer, RegionKind};
use tracing::debug;

/// Bitmap covering exactly the used part of a dump-time region
pub fn build_relocation_map(region: &RegionBuffer) -> RelocationBitmap {
    region.embedded().truncated(region.used() / WORD_SIZE)
}

/// Where one region lived at dump time and where it lives now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionMapping {
    pub kind: RegionKind,
    pub dump_base: u64,
    pub mapped_base: u64,
    pub len: usize,
}

impl RegionMapping {
    pub fn is_identity(&self) -> bool {
        self.dump_base == self.mapped_base
    }

    /// Runtime address for a dump-time address inside this region
    pub fn translate(&self, addr: u64) -> Option<u64> {
        let delta = addr.checked_sub(self.dump_base)?;
        if delta < self.len as u64 {
            self.mapped_base.checked_add(delta)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelocationContext<'m> {
    /// Codec the archive was written with
    pub dump_codec: ArchiveCodec,
    /// Codec established by the runtime for this process
    pub runtime_codec: ArchiveCodec,
    /// Every mapped region a reference may point into
    pub mappings: &'m [RegionMapping],
}

impl RelocationContext<'_> {
    pub fn is_identity(&self) -> bool {
        self.dump_codec == self.runtime_codec && self.mappings.iter().all(|m| m.is_identity())
    }

    fn translate(&self, addr: u64) -> Option<u64> {
        self.mappings.iter().find_map(|m| m.translate(addr))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocationReport {
    /// Marked words examined
    pub references: usize,
    /// External references left untouched
    pub external: usize,
    /// Words actually rewritten
    pub rewritten: usize,
}

/// Rewrite every marked word of a mapped region in place
pub fn relocate(
    kind: RegionKind,
    bytes: &mut [u8],
    bitmap: &RelocationBitmap,
    ctx: &RelocationContext<'_>,
) -> Result<RelocationReport> {
    if bytes.len() % WORD_SIZE != 0 || bitmap.bit_count() != bytes.len() / WORD_SIZE {
        return Err(ArchiveError::BitmapLengthMismatch {
            expected: RelocationBitmap::byte_len_for(bytes.len()),
            actual: (bitmap.bit_count() + 7) / 8,
        });
    }

    let mut report = RelocationReport::default();
    let mut updates = Vec::with_capacity(bitmap.count_ones());

    for bit in bitmap.iter_ones() {
        let offset = bit * WORD_SIZE;
        let word = read_word(bytes, offset).ok_or_else(|| {
            ArchiveError::corrupt(kind, format!("Marked word {:#x} is out of bounds", offset))
        })?;
        report.references += 1;

        if word >> 32 != 0 {
            return Err(ArchiveError::corrupt(
                kind,
                format!("Marked word at {:#x} is not a narrow reference", offset),
            ));
        }
        let narrow = NarrowRef::from_raw(word as u32);
        if narrow.is_null() {
            return Err(ArchiveError::corrupt(kind, format!("Marked word at {:#x} is null", offset)));
        }
        if narrow.is_external() {
            if kind == RegionKind::Closed {
                return Err(ArchiveError::corrupt(
                    kind,
                    format!("External reference at {:#x}", offset),
                ));
            }
            report.external += 1;
            continue;
        }

        let addr = ctx
            .dump_codec
            .decode(narrow)
            .ok_or(ArchiveError::DecodeOutOfRange(word))?;
        let target = ctx
            .translate(addr)
            .ok_or(ArchiveError::DecodeOutOfRange(addr))?;
        let relocated = ctx.runtime_codec.encode(target)?;
        if relocated != narrow {
            updates.push((offset, relocated));
        }
    }

    if ctx.is_identity() && !updates.is_empty() {
        return Err(ArchiveError::corrupt(kind, "Identity mapping changed a reference"));
    }

    for (offset, relocated) in &updates {
        write_word(bytes, *offset, relocated.raw() as u64);
    }
    report.rewritten = updates.len();

    debug!(
        "Relocated {} region: {} references, {} external, {} rewritten",
        kind, report.references, report.external, report.rewritten
    );
    Ok(report)
}
