//! Dump session
//!
//! Drives one dump end to end: decide every registered root, archive the
//! closed-region roots and then the open-region roots, optionally verify
//! each archived subgraph, and assemble the archive image.

use crate::core::archiver::GraphArchiver;
use crate::core::checker::{PreservabilityChecker, Verdicts};
use crate::core::config::ArchiveConfig;
use crate::core::error::Result;
use crate::core::heap::HeapSource;
use crate::core::image::{ArchiveImage, RegionImage};
use crate::core::region::{RegionBuffer, RegionKind};
use crate::core::registry::RootRegistry;
use crate::core::stats::DumpStats;
use crate::core::subgraph::CompiledSubgraphTable;
use tracing::{debug, info};

/// Everything a dump produces
#[derive(Debug)]
pub struct DumpOutput {
    pub image: ArchiveImage,
    pub stats: DumpStats,
    pub verdicts: Verdicts,
}

pub struct DumpSession<'h, H: HeapSource> {
    heap: &'h H,
    config: ArchiveConfig,
    registry: RootRegistry,
}

impl<'h, H: HeapSource> DumpSession<'h, H> {
    /// Validate the configuration and seed the registry with its roots
    pub fn new(heap: &'h H, config: ArchiveConfig) -> Result<Self> {
        config.validate()?;
        let registry = RootRegistry::from_specs(config.roots.iter().cloned());
        Ok(DumpSession {
            heap,
            config,
            registry,
        })
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn registry(&self) -> &RootRegistry {
        &self.registry
    }

    /// Register one more root; duplicates are ignored
    pub fn register_root(&mut self, type_name: &str, field_name: &str, region: RegionKind) -> bool {
        self.registry.register_root(type_name, field_name, region)
    }

    pub fn run(self) -> Result<DumpOutput> {
        info!(
            "Dumping {} roots (shift {})",
            self.registry.len(),
            self.config.shift
        );

        let mut checker = PreservabilityChecker::new(self.heap);
        let verdicts = checker.check_all(&self.registry)?;
        let negative = checker.into_negative_cache();

        let codec = self.config.codec()?;
        let closed = RegionBuffer::new(
            RegionKind::Closed,
            self.config.closed_region.base,
            self.config.closed_region.capacity,
        )?;
        let open = RegionBuffer::new(
            RegionKind::Open,
            self.config.open_region.base,
            self.config.open_region.capacity,
        )?;
        let mut archiver = GraphArchiver::new(self.heap, codec, closed, open, negative)?;

        for kind in RegionKind::ALL {
            for desc in verdicts.preservable(kind) {
                let outcome = archiver.archive_root(desc)?;
                debug!(
                    "{}.{} -> {:?} ({} region)",
                    desc.type_name, desc.field_name, outcome, kind
                );
            }
        }

        let owners: Vec<_> = archiver.table().iter().map(|r| r.owner()).collect();
        for owner in owners {
            let partial = verdicts.is_partial(owner) == Some(true);
            if let Some(record) = archiver.table_mut().get_mut(owner) {
                record.set_partial(partial);
            }
        }

        if self.config.verify_subgraphs {
            for kind in RegionKind::ALL {
                for desc in verdicts.preservable(kind) {
                    if !archiver.is_unrecordable(desc.owner) {
                        archiver.verify_subgraph_from_static_field(desc)?;
                    }
                }
            }
        }

        let output = archiver.finish();
        let table = output.table.compile(self.heap)?;
        let table_entries = CompiledSubgraphTable::from_bytes(&table)?.len();

        let image = ArchiveImage {
            codec,
            closed: RegionImage::from_buffer(&output.closed),
            open: RegionImage::from_buffer(&output.open),
            table,
        };

        let mut stats = output.stats;
        stats.roots_checked = verdicts.fields().len();
        stats.disqualified_roots = verdicts.disqualified_count();
        stats.recorded_types = output.table.iter().map(|r| r.dependent_types().len()).sum();
        stats.closed_bytes = image.closed.bytes.len();
        stats.open_bytes = image.open.bytes.len();
        stats.closed_relocations = image.closed.bitmap.count_ones();
        stats.open_relocations = image.open.bitmap.count_ones();
        stats.table_entries = table_entries;
        stats.table_bytes = image.table.len();
        stats.log_summary();

        Ok(DumpOutput {
            image,
            stats,
            verdicts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ArchiveError;
    use crate::core::heap::{FieldKind, Heap, Slot, TypeBuilder, TypeKey};
    use crate::core::registry::RootSpec;

    fn boot_heap() -> (Heap, TypeKey) {
        let mut heap = Heap::new();
        let list = heap.define_type(TypeBuilder::ref_array("List")).unwrap();
        let socket = heap
            .define_type(TypeBuilder::instance("Socket").with_native_state())
            .unwrap();
        let boot = heap
            .define_type(
                TypeBuilder::instance("Boot")
                    .static_ref("MODULES", "List")
                    .static_ref("CACHE", "List")
                    .static_ref("CONN", "Socket"),
            )
            .unwrap();

        let leaf = heap.alloc_ref_array(list, vec![None]).unwrap();
        let modules = heap.alloc_ref_array(list, vec![Some(leaf), None]).unwrap();
        let cache = heap.alloc_ref_array(list, vec![Some(leaf)]).unwrap();
        let conn = heap.alloc_instance(socket, vec![]).unwrap();
        heap.set_static(boot, "MODULES", Slot::Ref(Some(modules))).unwrap();
        heap.set_static(boot, "CACHE", Slot::Ref(Some(cache))).unwrap();
        heap.set_static(boot, "CONN", Slot::Ref(Some(conn))).unwrap();
        (heap, boot)
    }

    fn config() -> ArchiveConfig {
        ArchiveConfig {
            verify_subgraphs: true,
            ..ArchiveConfig::default()
        }
    }

    #[test]
    fn test_run_dump() {
        let (heap, boot) = boot_heap();
        let mut session = DumpSession::new(&heap, config()).unwrap();
        session.register_root("Boot", "MODULES", RegionKind::Closed);
        session.register_root("Boot", "CACHE", RegionKind::Open);
        session.register_root("Boot", "CONN", RegionKind::Open);

        let output = session.run().unwrap();
        assert_eq!(output.stats.roots_checked, 3);
        assert_eq!(output.stats.disqualified_roots, 1);
        assert_eq!(output.verdicts.verdict("Boot", "CONN"), Some(false));
        assert!(output.stats.verifications > 0);
        assert_eq!(output.stats.table_entries, 1);
        assert_eq!(output.stats.closed_relocations, 1);
        // The open list reuses the leaf already copied into the closed region
        assert_eq!(output.stats.open_relocations, 1);

        let table = CompiledSubgraphTable::from_bytes(&output.image.table).unwrap();
        let record = table.lookup(boot).unwrap();
        assert!(record.is_partial());
        assert_eq!(record.field_count(), 2);
    }

    #[test]
    fn test_roots_from_config() {
        let (heap, _) = boot_heap();
        let mut config = config();
        config.roots = vec![
            RootSpec::new("Boot", "MODULES", RegionKind::Closed),
            RootSpec::new("Boot", "MODULES", RegionKind::Closed),
        ];
        let session = DumpSession::new(&heap, config).unwrap();
        assert_eq!(session.registry().len(), 1);

        let output = session.run().unwrap();
        assert_eq!(output.stats.recordings, 1);
    }

    #[test]
    fn test_unknown_root_is_config_error() {
        let (heap, _) = boot_heap();
        let mut session = DumpSession::new(&heap, config()).unwrap();
        session.register_root("Boot", "MISSING", RegionKind::Closed);
        assert!(matches!(
            session.run(),
            Err(ArchiveError::UnknownField { .. })
        ));

        let mut bad = config();
        bad.shift = 5;
        assert!(DumpSession::new(&heap, bad).is_err());
    }

    #[test]
    fn test_field_kind_prim_root_rejected() {
        let mut heap = Heap::new();
        heap.define_type(
            TypeBuilder::instance("Counter")
                .field(FieldKind::Prim)
                .static_prim("COUNT"),
        )
        .unwrap();
        let mut session = DumpSession::new(&heap, config()).unwrap();
        session.register_root("Counter", "COUNT", RegionKind::Closed);
        assert!(matches!(
            session.run(),
            Err(ArchiveError::NotAReferenceField { .. })
        ));
    }
}
