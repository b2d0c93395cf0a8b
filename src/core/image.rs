//! Archive image
//!
//! File layout: the header page, then each blob starting on its own page
//! in a fixed order (closed data, closed bitmap, open data, open bitmap,
//! subgraph table). [`ArchiveImage`] is the owned form produced by a dump;
//! [`ArchiveLayout`] validates a serialized archive in place and splits it
//! into per-blob slices for loading.

use crate::core::bitmap::RelocationBitmap;
use crate::core::codec::ArchiveCodec;
use crate::core::error::{ArchiveError, Result};
use crate::core::header::{ArchiveHeader, BlobDescriptor, RegionDescriptor, PAGE_SIZE};
use crate::core::region::{read_word, RegionBuffer, RegionKind};
use crate::core::relocation::build_relocation_map;
use crate::core::subgraph::CompiledSubgraphTable;

fn page_align(len: usize) -> usize {
    (len + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
}

/// One region's bytes and relocation bitmap, as dumped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionImage {
    pub kind: RegionKind,
    pub dump_base: u64,
    pub bytes: Vec<u8>,
    pub bitmap: RelocationBitmap,
}

impl RegionImage {
    pub fn from_buffer(buffer: &RegionBuffer) -> Self {
        RegionImage {
            kind: buffer.kind(),
            dump_base: buffer.base(),
            bytes: buffer.bytes().to_vec(),
            bitmap: build_relocation_map(buffer),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveImage {
    pub codec: ArchiveCodec,
    pub closed: RegionImage,
    pub open: RegionImage,
    /// Compiled subgraph table
    pub table: Vec<u8>,
}

impl ArchiveImage {
    pub fn region(&self, kind: RegionKind) -> &RegionImage {
        match kind {
            RegionKind::Closed => &self.closed,
            RegionKind::Open => &self.open,
        }
    }

    fn blobs(&self) -> [Vec<u8>; 5] {
        [
            self.closed.bytes.clone(),
            self.closed.bitmap.to_bytes(),
            self.open.bytes.clone(),
            self.open.bitmap.to_bytes(),
            self.table.clone(),
        ]
    }

    /// Header describing where [`ArchiveImage::to_bytes`] places every blob
    pub fn header(&self) -> ArchiveHeader {
        let mut header = ArchiveHeader::new(self.codec);
        let mut descriptors = [BlobDescriptor::default(); 5];
        let mut cursor = PAGE_SIZE;

        for (descriptor, blob) in descriptors.iter_mut().zip(self.blobs().iter()) {
            *descriptor = BlobDescriptor {
                offset: cursor as u64,
                len: blob.len() as u64,
                crc32: crc32fast::hash(blob),
            };
            cursor += page_align(blob.len());
        }

        header.closed = RegionDescriptor {
            dump_base: self.closed.dump_base,
            data: descriptors[0],
            bitmap: descriptors[1],
        };
        header.open = RegionDescriptor {
            dump_base: self.open.dump_base,
            data: descriptors[2],
            bitmap: descriptors[3],
        };
        header.table = descriptors[4];
        header
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header().to_bytes();
        for blob in self.blobs() {
            let start = bytes.len();
            bytes.extend_from_slice(&blob);
            bytes.resize(start + page_align(blob.len()), 0);
        }
        bytes
    }

    /// Parse and fully validate a serialized archive into an owned image
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let layout = ArchiveLayout::parse(bytes)?;
        let header = layout.header();
        let blob = |d: &BlobDescriptor| &bytes[d.offset as usize..(d.offset + d.len) as usize];

        let region = |kind: RegionKind| -> Result<RegionImage> {
            let descriptor = header.region(kind);
            let data = blob(&descriptor.data);
            Ok(RegionImage {
                kind,
                dump_base: descriptor.dump_base,
                bytes: data.to_vec(),
                bitmap: RelocationBitmap::from_bytes(blob(&descriptor.bitmap), data.len())?,
            })
        };

        Ok(ArchiveImage {
            codec: header.codec()?,
            closed: region(RegionKind::Closed)?,
            open: region(RegionKind::Open)?,
            table: blob(&header.table).to_vec(),
        })
    }
}

/// Per-blob slices of a serialized archive
#[derive(Debug)]
pub struct ArchiveParts<'a> {
    pub closed: &'a mut [u8],
    pub closed_bitmap: &'a [u8],
    pub open: &'a mut [u8],
    pub open_bitmap: &'a [u8],
    pub table: &'a [u8],
}

/// A validated view of a serialized archive
#[derive(Debug, Clone, Copy)]
pub struct ArchiveLayout {
    header: ArchiveHeader,
}

impl ArchiveLayout {
    /// Validate the header, blob placement, checksums, region markers,
    /// bitmap lengths and the subgraph table
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header = ArchiveHeader::from_bytes(bytes)?;

        let names = [
            "closed region",
            "closed bitmap",
            "open region",
            "open bitmap",
            "subgraph table",
        ];
        let mut previous_end = PAGE_SIZE;
        for (blob, name) in header.blobs().iter().zip(names) {
            let range = blob.range(bytes.len()).ok_or_else(|| {
                ArchiveError::InvalidHeader(format!("{} lies outside the archive", name))
            })?;
            if range.start < previous_end {
                return Err(ArchiveError::InvalidHeader(format!(
                    "{} overlaps the previous blob",
                    name
                )));
            }
            previous_end = range.end;

            if crc32fast::hash(&bytes[range]) != blob.crc32 {
                return Err(ArchiveError::ChecksumMismatch(name));
            }
        }

        for kind in RegionKind::ALL {
            let data = header.region(kind).data;
            let start = data.offset as usize;
            if read_word(bytes, start) != Some(kind.marker()) {
                return Err(ArchiveError::corrupt(kind, "Missing region marker"));
            }
        }

        let table = header.table;
        let table_range = table.offset as usize..(table.offset + table.len) as usize;
        CompiledSubgraphTable::from_bytes(&bytes[table_range])?;

        Ok(ArchiveLayout { header })
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    /// Split a buffer already accepted by [`ArchiveLayout::parse`] into its blobs
    pub fn split_mut<'a>(&self, bytes: &'a mut [u8]) -> Result<ArchiveParts<'a>> {
        let mut parts: Vec<&'a mut [u8]> = Vec::with_capacity(5);
        let mut rest: &'a mut [u8] = bytes;
        let mut consumed = 0usize;

        for blob in self.header.blobs() {
            let truncated =
                || ArchiveError::InvalidHeader("Blob lies outside the archive".to_string());
            let start = blob.offset as usize;
            let len = blob.len as usize;
            let skip = start.checked_sub(consumed).ok_or_else(truncated)?;

            let tail = std::mem::take(&mut rest);
            if skip.checked_add(len).map_or(true, |end| end > tail.len()) {
                return Err(truncated());
            }
            let (_, tail) = tail.split_at_mut(skip);
            let (part, tail) = tail.split_at_mut(len);
            parts.push(part);
            rest = tail;
            consumed = start + len;
        }

        let [closed, closed_bitmap, open, open_bitmap, table]: [&'a mut [u8]; 5] = parts
            .try_into()
            .map_err(|_| ArchiveError::InvalidHeader("Unexpected blob count".to_string()))?;

        Ok(ArchiveParts {
            closed,
            closed_bitmap,
            open,
            open_bitmap,
            table,
        })
    }
}
