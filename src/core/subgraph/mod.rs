//! Subgraph table
//!
//! At dump time every type whose roots were archived gets a
//! [`SubgraphRecord`]: the entry fields to write into its static storage
//! and the types that must be initialized before those fields are exposed.
//! [`SubgraphTable::compile`] flattens the records into the immutable blob
//! read at load time through [`CompiledSubgraphTable`].

pub mod compiled;

pub use compiled::{ArchivedSubgraphRecord, CompiledSubgraphTable};

use crate::core::codec::NarrowRef;
use crate::core::error::{ArchiveError, Result};
use crate::core::heap::{HeapSource, TypeKey};
use crate::core::region::RegionKind;
use ahash::AHashSet;
use std::collections::BTreeMap;

/// One archived static field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryField {
    /// Byte offset into the owner's static storage
    pub offset: u32,
    pub value: NarrowRef,
    /// Region the root was archived for
    pub region: RegionKind,
}

#[derive(Debug, Clone)]
pub struct SubgraphRecord {
    owner: TypeKey,
    dependent_types: Vec<TypeKey>,
    dependent_set: AHashSet<TypeKey>,
    entry_fields: Vec<EntryField>,
    partial: bool,
}

impl SubgraphRecord {
    pub fn new(owner: TypeKey) -> Self {
        SubgraphRecord {
            owner,
            dependent_types: Vec::new(),
            dependent_set: AHashSet::new(),
            entry_fields: Vec::new(),
            partial: false,
        }
    }

    pub fn owner(&self) -> TypeKey {
        self.owner
    }

    /// Record a type reached by one of this record's roots.
    /// The owner itself is never a dependency. Returns true if newly added.
    pub fn add_dependent_type(&mut self, ty: TypeKey) -> bool {
        if ty == self.owner || !self.dependent_set.insert(ty) {
            return false;
        }
        self.dependent_types.push(ty);
        true
    }

    pub fn dependent_types(&self) -> &[TypeKey] {
        &self.dependent_types
    }

    pub fn add_entry_field(&mut self, field: EntryField) {
        self.entry_fields.push(field);
    }

    pub fn entry_fields(&self) -> &[EntryField] {
        &self.entry_fields
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn set_partial(&mut self, partial: bool) {
        self.partial = partial;
    }
}

/// Dump-time table, keyed by owning type
#[derive(Debug, Clone, Default)]
pub struct SubgraphTable {
    records: BTreeMap<TypeKey, SubgraphRecord>,
}

impl SubgraphTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for `owner`, created on first use
    pub fn record_mut(&mut self, owner: TypeKey) -> &mut SubgraphRecord {
        self.records
            .entry(owner)
            .or_insert_with(|| SubgraphRecord::new(owner))
    }

    pub fn get(&self, owner: TypeKey) -> Option<&SubgraphRecord> {
        self.records.get(&owner)
    }

    pub fn get_mut(&mut self, owner: TypeKey) -> Option<&mut SubgraphRecord> {
        self.records.get_mut(&owner)
    }

    pub fn remove(&mut self, owner: TypeKey) -> Option<SubgraphRecord> {
        self.records.remove(&owner)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubgraphRecord> {
        self.records.values()
    }

    /// Flatten into the runtime lookup table.
    ///
    /// Every dependent type must be known to `heap`, otherwise the loader
    /// would be told to initialize a type it cannot resolve.
    pub fn compile<H: HeapSource>(&self, heap: &H) -> Result<Vec<u8>> {
        for record in self.records.values() {
            for dep in record.dependent_types() {
                if heap.type_info(*dep).is_none() {
                    return Err(ArchiveError::UnknownType(format!(
                        "#{} (dependency of #{})",
                        dep.0, record.owner.0
                    )));
                }
            }
        }
        compiled::build(self.records.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::heap::{Heap, TypeBuilder};

    #[test]
    fn test_dependent_types_are_a_set() {
        let mut record = SubgraphRecord::new(TypeKey(1));
        assert!(record.add_dependent_type(TypeKey(2)));
        assert!(record.add_dependent_type(TypeKey(3)));
        assert!(!record.add_dependent_type(TypeKey(2)));
        assert!(!record.add_dependent_type(TypeKey(1)));
        assert_eq!(record.dependent_types(), &[TypeKey(2), TypeKey(3)]);
    }

    #[test]
    fn test_compile_rejects_unknown_dependency() {
        let mut heap = Heap::new();
        let owner = heap.define_type(TypeBuilder::instance("Owner")).unwrap();

        let mut table = SubgraphTable::new();
        table.record_mut(owner).add_dependent_type(TypeKey(99));
        assert!(matches!(
            table.compile(&heap),
            Err(ArchiveError::UnknownType(_))
        ));

        table.remove(owner);
        assert!(table.is_empty());
        assert!(table.compile(&heap).is_ok());
    }
}
