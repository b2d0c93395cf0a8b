use crate::core::bitmap::RelocationBitmap;
use crate::core::codec::{ArchiveCodec, WORD_SIZE};
use crate::core::error::{ArchiveError, Result};
use crate::core::region::{RegionKind, MAX_REGION_CAPACITY};
use serde::{Deserialize, Serialize};

pub const MAGIC: [u8; 8] = *b"HARC\x00\x01\x00\x00";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;
pub const PAGE_SIZE: usize = 4096;

/// Serialized size of the header fields; the header page is zero padded
pub const HEADER_LEN: usize = 208;

const BLOB_LEN: usize = 20;

/// Location and checksum of one blob inside the archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    /// Byte offset from the start of the archive, page aligned
    pub offset: u64,
    pub len: u64,
    /// CRC32 of the blob bytes
    pub crc32: u32,
}

impl BlobDescriptor {
    fn write(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&self.offset.to_le_bytes());
        bytes.extend_from_slice(&self.len.to_le_bytes());
        bytes.extend_from_slice(&self.crc32.to_le_bytes());
    }

    fn read(bytes: &[u8], offset: usize) -> Self {
        BlobDescriptor {
            offset: read_u64(bytes, offset),
            len: read_u64(bytes, offset + 8),
            crc32: read_u32(bytes, offset + 16),
        }
    }

    /// Byte range within an archive of `total` bytes
    pub fn range(&self, total: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(self.offset).ok()?;
        let end = start.checked_add(usize::try_from(self.len).ok()?)?;
        if end > total {
            return None;
        }
        Some(start..end)
    }
}

/// One archived region: where it lived at dump time and where its bytes are
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    /// Address of the region's first byte at dump time
    pub dump_base: u64,
    pub data: BlobDescriptor,
    pub bitmap: BlobDescriptor,
}

/// Archive header (page 0)
///
/// Records the dump-time codec parameters, the dump-time base of each
/// region and the location of every blob. All blobs start on a page
/// boundary so each region can be mapped on its own.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArchiveHeader {
    /// Magic number: "HARC\x00\x01\x00\x00"
    pub magic: [u8; 8],

    pub version_major: u16,
    pub version_minor: u16,

    /// Heap word size in bytes (always 8)
    pub word_size: u32,

    /// Dump-time codec shift
    pub codec_shift: u32,

    /// Dump-time codec base
    pub codec_base: u64,

    pub closed: RegionDescriptor,
    pub open: RegionDescriptor,

    /// Compiled subgraph table
    pub table: BlobDescriptor,

    /// Reserved for future extensions
    #[serde(skip, default = "default_reserved")]
    pub reserved: [u8; 64],
}

fn default_reserved() -> [u8; 64] {
    [0u8; 64]
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(word)
}

impl ArchiveHeader {
    pub fn new(codec: ArchiveCodec) -> Self {
        ArchiveHeader {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            word_size: WORD_SIZE as u32,
            codec_shift: codec.shift(),
            codec_base: codec.base(),
            closed: RegionDescriptor::default(),
            open: RegionDescriptor::default(),
            table: BlobDescriptor::default(),
            reserved: [0; 64],
        }
    }

    pub fn region(&self, kind: RegionKind) -> &RegionDescriptor {
        match kind {
            RegionKind::Closed => &self.closed,
            RegionKind::Open => &self.open,
        }
    }

    pub fn region_mut(&mut self, kind: RegionKind) -> &mut RegionDescriptor {
        match kind {
            RegionKind::Closed => &mut self.closed,
            RegionKind::Open => &mut self.open,
        }
    }

    /// Dump-time codec
    pub fn codec(&self) -> Result<ArchiveCodec> {
        ArchiveCodec::new(self.codec_base, self.codec_shift)
    }

    /// Validate magic, version and the internal consistency of every descriptor
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(ArchiveError::InvalidMagic);
        }

        // Exact match for now
        if self.version_major != VERSION_MAJOR || self.version_minor != VERSION_MINOR {
            return Err(ArchiveError::UnsupportedVersion {
                major: self.version_major,
                minor: self.version_minor,
            });
        }

        if self.word_size != WORD_SIZE as u32 {
            return Err(ArchiveError::InvalidHeader(format!(
                "Word size {} is not supported",
                self.word_size
            )));
        }

        let codec = self
            .codec()
            .map_err(|e| ArchiveError::InvalidHeader(e.to_string()))?;
        let span_end = codec.base().checked_add(codec.max_span()).ok_or_else(|| {
            ArchiveError::InvalidHeader(format!(
                "Codec base {:#x} wraps the address space",
                codec.base()
            ))
        })?;

        for kind in RegionKind::ALL {
            let region = self.region(kind);
            let region_end = region.dump_base.checked_add(region.data.len);
            if region.dump_base < codec.base() || region_end.map_or(true, |end| end > span_end) {
                return Err(ArchiveError::InvalidHeader(format!(
                    "{} region at {:#x} is outside the codec span {:#x}..{:#x}",
                    kind,
                    region.dump_base,
                    codec.base(),
                    span_end
                )));
            }
            if region.data.len > MAX_REGION_CAPACITY as u64 {
                return Err(ArchiveError::InvalidHeader(format!(
                    "{} region length {} exceeds the {} byte offset limit",
                    kind, region.data.len, MAX_REGION_CAPACITY
                )));
            }
            if region.data.len < WORD_SIZE as u64 || region.data.len % WORD_SIZE as u64 != 0 {
                return Err(ArchiveError::InvalidHeader(format!(
                    "{} region length {} is not a non-zero multiple of the word size",
                    kind, region.data.len
                )));
            }
            if region.dump_base % WORD_SIZE as u64 != 0 {
                return Err(ArchiveError::InvalidHeader(format!(
                    "{} region base {:#x} is not word aligned",
                    kind, region.dump_base
                )));
            }
            let expected = RelocationBitmap::byte_len_for(region.data.len as usize) as u64;
            if region.bitmap.len != expected {
                return Err(ArchiveError::BitmapLengthMismatch {
                    expected: expected as usize,
                    actual: region.bitmap.len as usize,
                });
            }
        }

        for blob in self.blobs() {
            if blob.offset < PAGE_SIZE as u64 || blob.offset % PAGE_SIZE as u64 != 0 {
                return Err(ArchiveError::InvalidHeader(format!(
                    "Blob offset {:#x} is not page aligned past the header",
                    blob.offset
                )));
            }
        }

        Ok(())
    }

    /// Every blob in file order
    pub fn blobs(&self) -> [BlobDescriptor; 5] {
        [
            self.closed.data,
            self.closed.bitmap,
            self.open.data,
            self.open.bitmap,
            self.table,
        ]
    }

    /// Serialize header to one page
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);

        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.version_major.to_le_bytes());
        bytes.extend_from_slice(&self.version_minor.to_le_bytes());
        bytes.extend_from_slice(&self.word_size.to_le_bytes());
        bytes.extend_from_slice(&self.codec_shift.to_le_bytes());
        bytes.extend_from_slice(&self.codec_base.to_le_bytes());
        for region in [&self.closed, &self.open] {
            bytes.extend_from_slice(&region.dump_base.to_le_bytes());
            region.data.write(&mut bytes);
            region.bitmap.write(&mut bytes);
        }
        self.table.write(&mut bytes);
        bytes.extend_from_slice(&self.reserved);

        // Pad to PAGE_SIZE
        bytes.resize(PAGE_SIZE, 0);

        bytes
    }

    /// Deserialize and validate a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ArchiveError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Insufficient bytes for header",
            )));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        if magic != MAGIC {
            return Err(ArchiveError::InvalidMagic);
        }

        let mut offset = 8;
        let version_major = read_u16(bytes, offset);
        offset += 2;
        let version_minor = read_u16(bytes, offset);
        offset += 2;
        let word_size = read_u32(bytes, offset);
        offset += 4;
        let codec_shift = read_u32(bytes, offset);
        offset += 4;
        let codec_base = read_u64(bytes, offset);
        offset += 8;

        let mut regions = [RegionDescriptor::default(); 2];
        for region in regions.iter_mut() {
            region.dump_base = read_u64(bytes, offset);
            offset += 8;
            region.data = BlobDescriptor::read(bytes, offset);
            offset += BLOB_LEN;
            region.bitmap = BlobDescriptor::read(bytes, offset);
            offset += BLOB_LEN;
        }

        let table = BlobDescriptor::read(bytes, offset);
        offset += BLOB_LEN;

        let mut reserved = [0u8; 64];
        reserved.copy_from_slice(&bytes[offset..offset + 64]);

        let header = ArchiveHeader {
            magic,
            version_major,
            version_minor,
            word_size,
            codec_shift,
            codec_base,
            closed: regions[0],
            open: regions[1],
            table,
            reserved,
        };
        header.validate()?;

        Ok(header)
    }
}
