//! Relocation bitmap
//!
//! One bit per word of a region; a set bit means the word holds an embedded
//! reference that must be rewritten when the region is mapped somewhere
//! other than its dump-time address.
//! Serialized as `ceil(region_bytes / WORD_SIZE / 8)` little-endian bytes.

use crate::core::codec::WORD_SIZE;
use crate::core::error::{ArchiveError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationBitmap {
    /// Bitmap words (each word = 64 region words)
    words: Vec<u64>,

    /// Number of region words tracked
    bits: usize,
}

impl RelocationBitmap {
    pub fn new(bits: usize) -> Self {
        RelocationBitmap {
            words: vec![0u64; (bits + 63) / 64],
            bits,
        }
    }

    /// Serialized size for a region of `region_bytes`
    pub fn byte_len_for(region_bytes: usize) -> usize {
        (region_bytes / WORD_SIZE + 7) / 8
    }

    pub fn bit_count(&self) -> usize {
        self.bits
    }

    pub fn set(&mut self, bit: usize) {
        if bit < self.bits {
            self.words[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    pub fn clear(&mut self, bit: usize) {
        if bit < self.bits {
            self.words[bit / 64] &= !(1u64 << (bit % 64));
        }
    }

    pub fn is_set(&self, bit: usize) -> bool {
        if bit >= self.bits {
            return false;
        }
        (self.words[bit / 64] & (1u64 << (bit % 64))) != 0
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Set bits in ascending order
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_idx, &word)| {
                let mut remaining = word;
                std::iter::from_fn(move || {
                    if remaining == 0 {
                        return None;
                    }
                    let bit = remaining.trailing_zeros() as usize;
                    remaining &= remaining - 1;
                    Some(word_idx * 64 + bit)
                })
            })
    }

    /// Copy of the first `bits` bits
    pub fn truncated(&self, bits: usize) -> Self {
        let limit = bits.min(self.bits);
        let mut out = RelocationBitmap::new(limit);
        for bit in self.iter_ones().take_while(|&b| b < limit) {
            out.set(bit);
        }
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let len = (self.bits + 7) / 8;
        let mut bytes = Vec::with_capacity(len);
        for word in &self.words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes.truncate(len);
        bytes
    }

    /// Parse the bitmap of a region that is `region_bytes` long
    pub fn from_bytes(bytes: &[u8], region_bytes: usize) -> Result<Self> {
        let expected = Self::byte_len_for(region_bytes);
        if bytes.len() != expected {
            return Err(ArchiveError::BitmapLengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let mut bitmap = RelocationBitmap::new(region_bytes / WORD_SIZE);
        for (i, chunk) in bytes.chunks(8).enumerate() {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            bitmap.words[i] = u64::from_le_bytes(word);
        }

        // Padding bits past the last region word must be clear
        let tail = bitmap.bits % 64;
        if tail != 0 {
            if let Some(last) = bitmap.words.last() {
                if last >> tail != 0 {
                    return Err(ArchiveError::BitmapLengthMismatch {
                        expected,
                        actual: bytes.len(),
                    });
                }
            }
        }

        Ok(bitmap)
    }
}
