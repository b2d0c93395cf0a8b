//! Reference codec
//!
//! Embedded references inside archived objects are stored as 32-bit
//! narrow values: the distance from the codec base, scaled down by the
//! object alignment. Narrow value 0 is null. The top bit tags a reference
//! to a live object that is not part of the archive (open region only);
//! the remaining bits then carry the runtime-assigned external index.
//!
//! The archive's (base, shift) pair is independent of whatever scheme the
//! live heap uses for its own compressed references. At dump time the pair
//! comes from the configured region layout; at load time the runtime
//! supplies its own pair once through [`DecodingState::init_decoding`].

use crate::core::error::{ArchiveError, Result};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU64;
use std::sync::OnceLock;

/// Size of one heap word in bytes
pub const WORD_SIZE: usize = 8;

/// Tag bit marking an external (non-archived) reference
pub const EXTERNAL_TAG: u32 = 1 << 31;

/// Largest supported alignment shift (64-byte objects)
pub const MAX_SHIFT: u32 = 6;

/// Position-independent encoded reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NarrowRef(u32);

impl NarrowRef {
    pub const NULL: NarrowRef = NarrowRef(0);

    pub fn from_raw(raw: u32) -> Self {
        NarrowRef(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_external(self) -> bool {
        self.0 & EXTERNAL_TAG != 0
    }

    /// Encode a reference to a live object the runtime recreates itself
    pub fn external(index: u32) -> Result<Self> {
        if index >= EXTERNAL_TAG {
            return Err(ArchiveError::ExternalIndexOutOfRange(index));
        }
        Ok(NarrowRef(EXTERNAL_TAG | index))
    }

    pub fn external_index(self) -> Option<u32> {
        if self.is_external() {
            Some(self.0 & !EXTERNAL_TAG)
        } else {
            None
        }
    }
}

/// Address of an archived object in the running process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LiveRef(NonZeroU64);

impl LiveRef {
    pub fn new(addr: u64) -> Option<Self> {
        NonZeroU64::new(addr).map(LiveRef)
    }

    pub fn addr(self) -> u64 {
        self.0.get()
    }
}

/// A (base, shift) encoding scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveCodec {
    base: u64,
    shift: u32,
}

impl ArchiveCodec {
    pub fn new(base: u64, shift: u32) -> Result<Self> {
        if shift > MAX_SHIFT {
            return Err(ArchiveError::InvalidConfig(format!(
                "Codec shift {} exceeds maximum of {}",
                shift, MAX_SHIFT
            )));
        }
        if base % (1u64 << shift) != 0 {
            return Err(ArchiveError::InvalidConfig(format!(
                "Codec base {:#x} is not aligned to {} bytes",
                base,
                1u64 << shift
            )));
        }
        Ok(ArchiveCodec { base, shift })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn alignment(&self) -> u64 {
        1u64 << self.shift
    }

    /// Number of bytes above the base that can be encoded
    pub fn max_span(&self) -> u64 {
        (EXTERNAL_TAG as u64) << self.shift
    }

    pub fn encode(&self, addr: u64) -> Result<NarrowRef> {
        let out_of_range = || ArchiveError::EncodeOutOfRange {
            addr,
            base: self.base,
            shift: self.shift,
        };

        let delta = addr.checked_sub(self.base).ok_or_else(out_of_range)?;
        if delta == 0 || delta % self.alignment() != 0 {
            return Err(out_of_range());
        }

        let scaled = delta >> self.shift;
        if scaled >= EXTERNAL_TAG as u64 {
            return Err(out_of_range());
        }

        Ok(NarrowRef(scaled as u32))
    }

    /// Decode an archived reference. Null and external references have no address.
    pub fn decode(&self, narrow: NarrowRef) -> Option<u64> {
        if narrow.is_null() || narrow.is_external() {
            return None;
        }
        self.base.checked_add((narrow.0 as u64) << self.shift)
    }
}

/// Load-direction codec state, established exactly once per load session
#[derive(Debug, Default)]
pub struct DecodingState {
    codec: OnceLock<ArchiveCodec>,
}

impl DecodingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_decoding(&self, base: u64, shift: u32) -> Result<()> {
        let codec = ArchiveCodec::new(base, shift)?;
        self.codec
            .set(codec)
            .map_err(|_| ArchiveError::DecodingAlreadyInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.codec.get().is_some()
    }

    pub fn codec(&self) -> Result<&ArchiveCodec> {
        self.codec.get().ok_or(ArchiveError::DecodingNotInitialized)
    }

    pub fn decode(&self, narrow: NarrowRef) -> Result<Option<u64>> {
        Ok(self.codec()?.decode(narrow))
    }
}
