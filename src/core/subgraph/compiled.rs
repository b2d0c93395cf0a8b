//! Compiled subgraph table
//!
//! Immutable hash table read straight from the archive bytes. Every field is
//! a little-endian `u32`:
//!
//! ```text
//! header   magic "SGT1" | bucket count | entry count | records length
//! buckets  bucket count + 1 prefix sums into the entry array
//! entries  (type hash, record offset) grouped by bucket
//! records  owner | flags | field count | dependency count
//!          | (offset, narrow ref, region) per field | type key per dependency
//! ```

use super::{EntryField, SubgraphRecord};
use crate::core::codec::NarrowRef;
use crate::core::error::{ArchiveError, Result};
use crate::core::heap::TypeKey;
use crate::core::region::RegionKind;
use xxhash_rust::xxh3::xxh3_64;

pub const TABLE_MAGIC: u32 = u32::from_le_bytes(*b"SGT1");

const HEADER_LEN: usize = 16;
const ENTRY_LEN: usize = 8;
const RECORD_HEADER_LEN: usize = 16;
const FIELD_LEN: usize = 12;

const FLAG_PARTIAL: u32 = 1;

/// Bucket counts, smallest one not below the entry count is chosen
const PRIMES: [u32; 22] = [
    1, 2, 3, 5, 7, 11, 17, 37, 67, 131, 257, 521, 1031, 2053, 4099, 8209, 16411, 32771, 65537,
    131101, 262147, 1048573,
];

pub fn hash_type(ty: TypeKey) -> u32 {
    xxh3_64(&ty.0.to_le_bytes()) as u32
}

fn bucket_count_for(entries: usize) -> Result<u32> {
    PRIMES
        .iter()
        .copied()
        .find(|&p| p as usize >= entries)
        .ok_or_else(|| {
            ArchiveError::TableOverflow(format!(
                "{} records exceed the largest bucket count",
                entries
            ))
        })
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let chunk = bytes.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| ArchiveError::TableOverflow(format!("{} {} does not fit in 32 bits", what, value)))
}

pub(super) fn build<'r, I>(records: I) -> Result<Vec<u8>>
where
    I: Iterator<Item = &'r SubgraphRecord>,
{
    let mut record_bytes = Vec::new();
    let mut entries: Vec<(u32, u32)> = Vec::new();

    for record in records {
        let offset = to_u32(record_bytes.len(), "Record offset")?;
        let flags = if record.is_partial() { FLAG_PARTIAL } else { 0 };
        let fields = record.entry_fields();
        let deps = record.dependent_types();

        let mut words = vec![
            record.owner().0,
            flags,
            to_u32(fields.len(), "Entry field count")?,
            to_u32(deps.len(), "Dependency count")?,
        ];
        for field in fields {
            words.extend_from_slice(&[field.offset, field.value.raw(), field.region as u32]);
        }
        words.extend(deps.iter().map(|d| d.0));

        for word in words {
            record_bytes.extend_from_slice(&word.to_le_bytes());
        }
        entries.push((hash_type(record.owner()), offset));
    }

    let bucket_count = bucket_count_for(entries.len())?;
    entries.sort_by_key(|&(hash, offset)| (hash % bucket_count, offset));

    let mut counts = vec![0u32; bucket_count as usize];
    for (hash, _) in &entries {
        counts[(hash % bucket_count) as usize] += 1;
    }

    let records_len = to_u32(record_bytes.len(), "Records length")?;
    let total = HEADER_LEN
        + (bucket_count as usize + 1) * 4
        + entries.len() * ENTRY_LEN
        + record_bytes.len();
    let mut out = Vec::with_capacity(total);

    out.extend_from_slice(&TABLE_MAGIC.to_le_bytes());
    out.extend_from_slice(&bucket_count.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&records_len.to_le_bytes());

    let mut start = 0u32;
    for count in counts {
        out.extend_from_slice(&start.to_le_bytes());
        start += count;
    }
    out.extend_from_slice(&start.to_le_bytes());

    for (hash, offset) in &entries {
        out.extend_from_slice(&hash.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
    }
    out.extend_from_slice(&record_bytes);

    Ok(out)
}

/// Read-only view of a record inside a compiled table
#[derive(Debug, Clone, Copy)]
pub struct ArchivedSubgraphRecord<'a> {
    bytes: &'a [u8],
}

impl<'a> ArchivedSubgraphRecord<'a> {
    fn word(&self, index: usize) -> u32 {
        read_u32(self.bytes, index * 4).unwrap_or(0)
    }

    pub fn owner(&self) -> TypeKey {
        TypeKey(self.word(0))
    }

    pub fn is_partial(&self) -> bool {
        self.word(1) & FLAG_PARTIAL != 0
    }

    pub fn field_count(&self) -> usize {
        self.word(2) as usize
    }

    pub fn dependent_count(&self) -> usize {
        self.word(3) as usize
    }

    pub fn entry_field(&self, index: usize) -> Option<EntryField> {
        if index >= self.field_count() {
            return None;
        }
        let base = 4 + index * 3;
        Some(EntryField {
            offset: self.word(base),
            value: NarrowRef::from_raw(self.word(base + 1)),
            region: RegionKind::from_u8(self.word(base + 2) as u8).unwrap_or_default(),
        })
    }

    pub fn entry_fields(&self) -> impl Iterator<Item = EntryField> + 'a {
        let record = *self;
        (0..record.field_count()).filter_map(move |i| record.entry_field(i))
    }

    pub fn dependent_types(&self) -> impl Iterator<Item = TypeKey> + 'a {
        let record = *self;
        let base = 4 + record.field_count() * 3;
        (0..record.dependent_count()).map(move |i| TypeKey(record.word(base + i)))
    }
}

/// Runtime lookup table over a borrowed byte slice
#[derive(Debug, Clone, Copy)]
pub struct CompiledSubgraphTable<'a> {
    bytes: &'a [u8],
    bucket_count: u32,
    entry_count: u32,
}

impl<'a> CompiledSubgraphTable<'a> {
    /// Validate a table blob. Every offset and count is checked here so
    /// lookups never index out of bounds.
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self> {
        let corrupt = |reason: &str| ArchiveError::CorruptTable(reason.to_string());

        let header = |i: usize| read_u32(bytes, i * 4).ok_or_else(|| corrupt("Truncated table header"));
        if header(0)? != TABLE_MAGIC {
            return Err(corrupt("Bad table magic"));
        }
        let bucket_count = header(1)?;
        let entry_count = header(2)?;
        let records_len = header(3)? as usize;
        if bucket_count == 0 {
            return Err(corrupt("Zero bucket count"));
        }

        let expected = (bucket_count as usize + 1)
            .checked_mul(4)
            .and_then(|b| b.checked_add(HEADER_LEN))
            .and_then(|n| n.checked_add((entry_count as usize).checked_mul(ENTRY_LEN)?))
            .and_then(|n| n.checked_add(records_len));
        if expected != Some(bytes.len()) {
            return Err(ArchiveError::CorruptTable(format!(
                "Table is {} bytes, header describes {:?}",
                bytes.len(),
                expected
            )));
        }

        let table = CompiledSubgraphTable {
            bytes,
            bucket_count,
            entry_count,
        };
        table.validate(records_len)?;
        Ok(table)
    }

    fn entries_at(&self) -> usize {
        HEADER_LEN + (self.bucket_count as usize + 1) * 4
    }

    fn records_at(&self) -> usize {
        self.entries_at() + self.entry_count as usize * ENTRY_LEN
    }

    fn bucket_start(&self, bucket: u32) -> usize {
        read_u32(self.bytes, HEADER_LEN + bucket as usize * 4).unwrap_or(0) as usize
    }

    fn entry(&self, index: usize) -> (u32, u32) {
        let at = self.entries_at() + index * ENTRY_LEN;
        (
            read_u32(self.bytes, at).unwrap_or(0),
            read_u32(self.bytes, at + 4).unwrap_or(0),
        )
    }

    fn record_at(&self, offset: u32) -> Option<ArchivedSubgraphRecord<'a>> {
        let records = self.bytes.get(self.records_at()..)?;
        let start = offset as usize;
        let fields = read_u32(records, start + 8)? as usize;
        let deps = read_u32(records, start + 12)? as usize;
        let len = fields
            .checked_mul(FIELD_LEN)?
            .checked_add(deps.checked_mul(4)?)?
            .checked_add(RECORD_HEADER_LEN)?;
        let bytes = records.get(start..start.checked_add(len)?)?;
        Some(ArchivedSubgraphRecord { bytes })
    }

    fn validate(&self, records_len: usize) -> Result<()> {
        let corrupt = |reason: String| ArchiveError::CorruptTable(reason);

        let mut previous = 0;
        for bucket in 0..=self.bucket_count {
            let start = self.bucket_start(bucket);
            if start < previous || (bucket == 0 && start != 0) {
                return Err(corrupt(format!("Bucket {} has a bad start index", bucket)));
            }
            previous = start;
        }
        if previous != self.entry_count as usize {
            return Err(corrupt("Bucket index does not cover every entry".to_string()));
        }

        for bucket in 0..self.bucket_count {
            for index in self.bucket_start(bucket)..self.bucket_start(bucket + 1) {
                let (hash, offset) = self.entry(index);
                if hash % self.bucket_count != bucket {
                    return Err(corrupt(format!("Entry {} is in the wrong bucket", index)));
                }
                if offset as usize >= records_len || offset % 4 != 0 {
                    return Err(corrupt(format!("Entry {} has a bad record offset", index)));
                }
                let record = self
                    .record_at(offset)
                    .ok_or_else(|| corrupt(format!("Record at {} is truncated", offset)))?;
                if hash_type(record.owner()) != hash {
                    return Err(corrupt(format!("Record at {} does not match its hash", offset)));
                }
                if record.word(1) & !FLAG_PARTIAL != 0 {
                    return Err(corrupt(format!("Record at {} has unknown flags", offset)));
                }
                for i in 0..record.field_count() {
                    let region = record.word(4 + i * 3 + 2);
                    if region > 1 {
                        return Err(corrupt(format!(
                            "Record at {} has an unknown region flag {}",
                            offset, region
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entry_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// O(1) expected; only an exact type identity matches
    pub fn lookup(&self, ty: TypeKey) -> Option<ArchivedSubgraphRecord<'a>> {
        let hash = hash_type(ty);
        let bucket = hash % self.bucket_count;
        (self.bucket_start(bucket)..self.bucket_start(bucket + 1))
            .map(|i| self.entry(i))
            .filter(|&(h, _)| h == hash)
            .filter_map(|(_, offset)| self.record_at(offset))
            .find(|record| record.owner() == ty)
    }

    pub fn iter(&self) -> impl Iterator<Item = ArchivedSubgraphRecord<'a>> + '_ {
        (0..self.entry_count as usize).filter_map(move |i| self.record_at(self.entry(i).1))
    }
}
