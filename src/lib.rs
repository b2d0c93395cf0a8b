//! # Heap Archive - Boot-time Heap Snapshots
//!
//! `heap-archive` copies the object graphs reachable from selected static
//! fields into a compact, relocatable archive, and materializes them again
//! at the next start without running the types' initializers.
//!
//! - **Two regions**: a closed region that is never written after load and
//!   an open region whose objects may be mutated and may reference objects
//!   the runtime recreates itself
//! - **Narrow references**: 32-bit base/shift encoded pointers, rewritten in
//!   place at load time from a per-region relocation bitmap
//! - **Per-type subgraph table**: a static hash table the loader consults
//!   once per type to install archived static field values
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use heap_archive::{ArchiveBuilder, Heap, RegionKind, Result, Slot, TypeBuilder};
//!
//! # fn main() -> Result<()> {
//! let mut heap = Heap::new();
//! let list = heap.define_type(TypeBuilder::ref_array("List"))?;
//! let boot = heap.define_type(TypeBuilder::instance("Boot").static_ref("MODULES", "List"))?;
//! let modules = heap.alloc_ref_array(list, vec![None, None])?;
//! heap.set_static(boot, "MODULES", Slot::Ref(Some(modules)))?;
//!
//! let output = ArchiveBuilder::new()
//!     .root("Boot", "MODULES", RegionKind::Closed)
//!     .dump(&heap)?;
//! heap_archive::core::io::write_archive("boot.harc", &output.image)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Loading
//!
//! ```rust,no_run
//! use heap_archive::{LoadSession, RegionKind, Result};
//!
//! # fn main() -> Result<()> {
//! let mut mmap = heap_archive::core::io::map_archive("boot.harc")?;
//! let mut session = LoadSession::new(&mut mmap[..])?;
//! let closed_base = session.header().closed.dump_base;
//! let open_base = session.header().open.dump_base;
//! session.map_region(RegionKind::Closed, closed_base)?;
//! session.map_region(RegionKind::Open, open_base)?;
//! session.init_decoding(session.header().codec_base, session.header().codec_shift)?;
//! session.fixup_mapped_regions()?;
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    ArchiveCodec, ArchiveConfig, ArchiveError, ArchiveHeader, ArchiveImage, ArchiveLayout,
    CompiledSubgraphTable, DecodingState, DumpOutput, DumpSession, DumpStats, FieldKind,
    FieldValue, GraphArchiver, Heap, HeapSource, InitOutcome, LiveRef, LoadSession, NarrowRef,
    ObjId, PreservabilityChecker, RegionConfig, RegionKind, RelocationBitmap, Result,
    RootFieldDescriptor, RootOutcome, RootRegistry, RootSpec, Slot, StaticFieldStore,
    SubgraphTable, TypeBuilder, TypeInitializer, TypeKey, Verdicts, PAGE_SIZE,
};

use std::path::Path;
use tracing::info;

/// Builder for a dump configuration
///
/// # Examples
///
/// ```rust,no_run
/// use heap_archive::{ArchiveBuilder, RegionKind, Result};
///
/// # fn main() -> Result<()> {
/// let config = ArchiveBuilder::new()
///     .closed_region(0x1_0000_0000, 4 << 20)
///     .open_region(0x1_0100_0000, 1 << 20)
///     .shift(3)
///     .root("Boot", "MODULES", RegionKind::Closed)
///     .build_config()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ArchiveBuilder {
    config: ArchiveConfig,
}

impl ArchiveBuilder {
    /// Create a builder with the default region placement
    pub fn new() -> Self {
        ArchiveBuilder {
            config: ArchiveConfig::default(),
        }
    }

    /// Start from an existing configuration
    pub fn with_config(config: ArchiveConfig) -> Self {
        ArchiveBuilder { config }
    }

    /// Start from a TOML configuration file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(ArchiveBuilder {
            config: ArchiveConfig::from_toml_str(&text)?,
        })
    }

    pub fn closed_region(mut self, base: u64, capacity: usize) -> Self {
        self.config.closed_region = RegionConfig { base, capacity };
        self
    }

    pub fn open_region(mut self, base: u64, capacity: usize) -> Self {
        self.config.open_region = RegionConfig { base, capacity };
        self
    }

    pub fn shift(mut self, shift: u32) -> Self {
        self.config.shift = shift;
        self
    }

    /// Re-walk every archived root after the dump
    pub fn verify_subgraphs(mut self, enabled: bool) -> Self {
        self.config.verify_subgraphs = enabled;
        self
    }

    /// Register a root; a duplicate registration is ignored
    pub fn root<S: Into<String>, F: Into<String>>(
        mut self,
        type_name: S,
        field_name: F,
        region: RegionKind,
    ) -> Self {
        self.config
            .roots
            .push(RootSpec::new(type_name, field_name, region));
        self
    }

    /// Validate and return the configuration
    pub fn build_config(self) -> Result<ArchiveConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Dump `heap` with this configuration
    pub fn dump<H: HeapSource>(self, heap: &H) -> Result<DumpOutput> {
        let config = self.build_config()?;
        info!(
            "Building archive: closed {:#x}+{}, open {:#x}+{}",
            config.closed_region.base,
            config.closed_region.capacity,
            config.open_region.base,
            config.open_region.capacity
        );
        DumpSession::new(heap, config)?.run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_config() {
        let config = ArchiveBuilder::new()
            .closed_region(0x10_0000, 4096)
            .open_region(0x20_0000, 8192)
            .shift(2)
            .verify_subgraphs(true)
            .root("Boot", "MODULES", RegionKind::Closed)
            .root("Boot", "CACHE", RegionKind::Open)
            .build_config()
            .unwrap();

        assert_eq!(config.closed_region.capacity, 4096);
        assert_eq!(config.open_region.base, 0x20_0000);
        assert_eq!(config.shift, 2);
        assert!(config.verify_subgraphs);
        assert_eq!(config.roots.len(), 2);
    }

    #[test]
    fn test_builder_rejects_overlap() {
        let result = ArchiveBuilder::new()
            .closed_region(0x10_0000, 8192)
            .open_region(0x10_1000, 4096)
            .build_config();
        assert!(matches!(result, Err(ArchiveError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_dump() {
        let mut heap = Heap::new();
        let list = heap.define_type(TypeBuilder::ref_array("List")).unwrap();
        let boot = heap
            .define_type(TypeBuilder::instance("Boot").static_ref("MODULES", "List"))
            .unwrap();
        let modules = heap.alloc_ref_array(list, vec![None]).unwrap();
        heap.set_static(boot, "MODULES", Slot::Ref(Some(modules)))
            .unwrap();

        let output = ArchiveBuilder::new()
            .root("Boot", "MODULES", RegionKind::Closed)
            .dump(&heap)
            .unwrap();
        assert_eq!(output.stats.archived, 1);
        assert!(ArchiveImage::from_bytes(&output.image.to_bytes()).is_ok());
    }
}
