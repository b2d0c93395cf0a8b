//! Dump configuration
//!
//! ```toml
//! shift = 3
//! verify_subgraphs = true
//!
//! [closed_region]
//! base = 4294967296
//! capacity = 1048576
//!
//! [open_region]
//! base = 4311744512
//! capacity = 1048576
//!
//! [[roots]]
//! type_name = "Boot"
//! field_name = "MODULES"
//! region = "closed"
//! ```

use crate::core::codec::{ArchiveCodec, WORD_SIZE};
use crate::core::error::{ArchiveError, Result};
use crate::core::region::{RegionKind, MAX_REGION_CAPACITY};
use crate::core::registry::RootSpec;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CLOSED_BASE: u64 = 0x1_0000_0000;
pub const DEFAULT_REGION_CAPACITY: usize = 1 << 20;
/// Open region starts 16 MiB above the closed one by default
pub const DEFAULT_OPEN_BASE: u64 = DEFAULT_CLOSED_BASE + (16 << 20);
pub const DEFAULT_SHIFT: u32 = 3;

/// Largest shift a dump accepts; archived objects are only word aligned
pub const MAX_DUMP_SHIFT: u32 = WORD_SIZE.trailing_zeros();

/// Dump-time placement of one region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Address of the region at dump time
    pub base: u64,
    /// Bytes the heap allocator granted for archived objects
    pub capacity: usize,
}

impl RegionConfig {
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.capacity as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub closed_region: RegionConfig,
    pub open_region: RegionConfig,
    pub shift: u32,
    /// Re-walk every archived root after the dump
    pub verify_subgraphs: bool,
    pub roots: Vec<RootSpec>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            closed_region: RegionConfig {
                base: DEFAULT_CLOSED_BASE,
                capacity: DEFAULT_REGION_CAPACITY,
            },
            open_region: RegionConfig {
                base: DEFAULT_OPEN_BASE,
                capacity: DEFAULT_REGION_CAPACITY,
            },
            shift: DEFAULT_SHIFT,
            verify_subgraphs: cfg!(debug_assertions),
            roots: Vec::new(),
        }
    }
}

impl ArchiveConfig {
    /// Parse and validate a TOML configuration
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ArchiveConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn region(&self, kind: RegionKind) -> &RegionConfig {
        match kind {
            RegionKind::Closed => &self.closed_region,
            RegionKind::Open => &self.open_region,
        }
    }

    /// Dump-time codec: based at the lower of the two regions
    pub fn codec(&self) -> Result<ArchiveCodec> {
        let base = self.closed_region.base.min(self.open_region.base);
        ArchiveCodec::new(base, self.shift)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shift > MAX_DUMP_SHIFT {
            return Err(ArchiveError::InvalidConfig(format!(
                "Shift {} exceeds the object alignment shift of {}",
                self.shift, MAX_DUMP_SHIFT
            )));
        }

        let alignment = 1u64 << self.shift;
        for kind in RegionKind::ALL {
            let region = self.region(kind);
            if region.capacity == 0 || region.capacity % WORD_SIZE != 0 {
                return Err(ArchiveError::InvalidConfig(format!(
                    "{} region capacity {} must be a non-zero multiple of {}",
                    kind, region.capacity, WORD_SIZE
                )));
            }
            if region.capacity > MAX_REGION_CAPACITY {
                return Err(ArchiveError::InvalidConfig(format!(
                    "{} region capacity {} exceeds the {} byte offset limit",
                    kind, region.capacity, MAX_REGION_CAPACITY
                )));
            }
            if region.base % alignment != 0 || region.base % WORD_SIZE as u64 != 0 {
                return Err(ArchiveError::InvalidConfig(format!(
                    "{} region base {:#x} is not aligned",
                    kind, region.base
                )));
            }
            if region.base.checked_add(region.capacity as u64).is_none() {
                return Err(ArchiveError::InvalidConfig(format!(
                    "{} region wraps the address space",
                    kind
                )));
            }
        }

        let (closed, open) = (&self.closed_region, &self.open_region);
        if closed.base < open.end() && open.base < closed.end() {
            return Err(ArchiveError::InvalidConfig(format!(
                "Regions overlap: closed {:#x}..{:#x}, open {:#x}..{:#x}",
                closed.base,
                closed.end(),
                open.base,
                open.end()
            )));
        }

        let codec = self.codec()?;
        let span = closed.end().max(open.end()) - codec.base();
        if span > codec.max_span() {
            return Err(ArchiveError::InvalidConfig(format!(
                "Regions span {:#x} bytes, more than the {:#x} a narrow reference can reach",
                span,
                codec.max_span()
            )));
        }

        Ok(())
    }
}
