//! Preservability checker
//!
//! Runs once per dump, before anything is copied. For each registered root
//! it walks everything reachable from the field's current value and
//! rejects the root if the walk meets an object that cannot be frozen:
//! an instance of a type holding native or identity-sensitive state, an
//! instance of a type with a finalizer, or (closed region only) a live
//! object the runtime recreates on its own.
//!
//! A rejected object and every object on the path that led to it go into
//! the [`NegativeCache`], so later roots reaching any of them are rejected
//! without walking the same subgraph again.

use crate::core::error::{ArchiveError, Result};
use crate::core::heap::{FieldKind, HeapSource, ObjId, Slot, TypeKey};
use crate::core::region::RegionKind;
use crate::core::registry::{RootRegistry, RootSpec};
use ahash::{AHashMap, AHashSet};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disqualification {
    /// The object, or something it reaches, can never be frozen
    Intrinsic,
    /// Reaches a runtime-recreated object; fine for the open region only
    ReachesExternal,
}

/// Objects already proven non-preservable
#[derive(Debug, Clone, Default)]
pub struct NegativeCache {
    objects: AHashMap<ObjId, Disqualification>,
}

impl NegativeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, id: ObjId, reason: Disqualification) {
        let entry = self.objects.entry(id).or_insert(reason);
        if reason == Disqualification::Intrinsic {
            *entry = reason;
        }
    }

    pub fn reason(&self, id: ObjId) -> Option<Disqualification> {
        self.objects.get(&id).copied()
    }

    /// The object cannot be archived into `region`
    pub fn disqualifies(&self, id: ObjId, region: RegionKind) -> bool {
        match self.reason(id) {
            Some(Disqualification::Intrinsic) => true,
            Some(Disqualification::ReachesExternal) => region == RegionKind::Closed,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// A registered root resolved against the heap's type table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootFieldDescriptor {
    pub type_name: String,
    pub field_name: String,
    pub owner: TypeKey,
    pub offset: u32,
    pub declared_type: String,
    pub region: RegionKind,
    preservable: bool,
}

impl RootFieldDescriptor {
    pub fn is_preservable(&self) -> bool {
        self.preservable
    }
}

/// Output of [`PreservabilityChecker::check_all`]
#[derive(Debug, Clone, Default)]
pub struct Verdicts {
    fields: Vec<RootFieldDescriptor>,
    partial: BTreeMap<TypeKey, bool>,
}

impl Verdicts {
    pub fn fields(&self) -> &[RootFieldDescriptor] {
        &self.fields
    }

    /// Preservable roots destined for `region`, in registration order
    pub fn preservable(&self, region: RegionKind) -> impl Iterator<Item = &RootFieldDescriptor> {
        self.fields
            .iter()
            .filter(move |f| f.preservable && f.region == region)
    }

    pub fn verdict(&self, type_name: &str, field_name: &str) -> Option<bool> {
        self.fields
            .iter()
            .find(|f| f.type_name == type_name && f.field_name == field_name)
            .map(|f| f.preservable)
    }

    /// `Some(true)` if only some of the type's static fields can be frozen,
    /// `None` if none of them can
    pub fn is_partial(&self, owner: TypeKey) -> Option<bool> {
        self.partial.get(&owner).copied()
    }

    pub fn disqualified_count(&self) -> usize {
        self.fields.iter().filter(|f| !f.preservable).count()
    }
}

enum Step {
    Walk,
    Skip,
    Reject(Disqualification),
}

pub struct PreservabilityChecker<'h, H: HeapSource> {
    heap: &'h H,
    negative: NegativeCache,
}

impl<'h, H: HeapSource> PreservabilityChecker<'h, H> {
    pub fn new(heap: &'h H) -> Self {
        PreservabilityChecker {
            heap,
            negative: NegativeCache::new(),
        }
    }

    pub fn negative_cache(&self) -> &NegativeCache {
        &self.negative
    }

    pub fn into_negative_cache(self) -> NegativeCache {
        self.negative
    }

    fn resolve(&self, spec: &RootSpec) -> Result<RootFieldDescriptor> {
        let owner = self
            .heap
            .find_type(&spec.type_name)
            .ok_or_else(|| ArchiveError::UnknownType(spec.type_name.clone()))?;
        let info = self
            .heap
            .type_info(owner)
            .ok_or_else(|| ArchiveError::UnknownType(spec.type_name.clone()))?;
        let field = info
            .static_field(&spec.field_name)
            .ok_or_else(|| ArchiveError::UnknownField {
                type_name: spec.type_name.clone(),
                field: spec.field_name.clone(),
            })?;
        if field.kind != FieldKind::Ref {
            return Err(ArchiveError::NotAReferenceField {
                type_name: spec.type_name.clone(),
                field: spec.field_name.clone(),
            });
        }

        Ok(RootFieldDescriptor {
            type_name: spec.type_name.clone(),
            field_name: spec.field_name.clone(),
            owner,
            offset: field.offset,
            declared_type: field.declared_type.clone(),
            region: spec.region,
            preservable: true,
        })
    }

    /// Decide every registered root. Unknown types or fields are configuration errors.
    pub fn check_all(&mut self, registry: &RootRegistry) -> Result<Verdicts> {
        let mut fields = registry
            .iter()
            .map(|spec| self.resolve(spec))
            .collect::<Result<Vec<_>>>()?;

        for desc in fields.iter_mut() {
            let value = match self.heap.static_slot(desc.owner, desc.offset) {
                Some(Slot::Ref(value)) => value,
                _ => {
                    return Err(ArchiveError::NotAReferenceField {
                        type_name: desc.type_name.clone(),
                        field: desc.field_name.clone(),
                    })
                }
            };

            desc.preservable = match value {
                Some(root) => self.check_reachable(root, desc.region)?,
                None => true,
            };

            if desc.preservable {
                debug!("Root {}.{} is preservable", desc.type_name, desc.field_name);
            } else {
                warn!(
                    "Root {}.{} reaches an object that cannot be archived in the {} region",
                    desc.type_name, desc.field_name, desc.region
                );
            }
        }

        let mut counts: BTreeMap<TypeKey, usize> = BTreeMap::new();
        for desc in fields.iter().filter(|f| f.preservable) {
            *counts.entry(desc.owner).or_default() += 1;
        }
        let partial = counts
            .into_iter()
            .map(|(owner, count)| {
                let total = self
                    .heap
                    .type_info(owner)
                    .map(|t| t.static_fields.len())
                    .unwrap_or(0);
                (owner, count < total)
            })
            .collect();

        let verdicts = Verdicts { fields, partial };
        info!(
            "Checked {} roots: {} preservable, {} disqualified, {} objects in negative cache",
            verdicts.fields.len(),
            verdicts.fields.len() - verdicts.disqualified_count(),
            verdicts.disqualified_count(),
            self.negative.len()
        );
        Ok(verdicts)
    }

    fn classify(&self, id: ObjId, region: RegionKind) -> Result<Step> {
        if let Some(reason) = self.negative.reason(id) {
            if self.negative.disqualifies(id, region) {
                return Ok(Step::Reject(reason));
            }
        }

        if self.heap.external_index(id).is_some() {
            return Ok(match region {
                RegionKind::Open => Step::Skip,
                RegionKind::Closed => Step::Reject(Disqualification::ReachesExternal),
            });
        }

        let object = self
            .heap
            .object(id)
            .ok_or(ArchiveError::UnknownObject(id.index()))?;
        let info = self
            .heap
            .type_info(object.ty)
            .ok_or_else(|| ArchiveError::UnknownType(format!("#{}", object.ty.0)))?;

        if info.is_freezable() {
            Ok(Step::Walk)
        } else {
            debug!("Object {} of type {} cannot be frozen", id.index(), info.name);
            Ok(Step::Reject(Disqualification::Intrinsic))
        }
    }

    /// Walk everything reachable from `root`; false if any of it cannot be archived into `region`
    pub fn check_reachable(&mut self, root: ObjId, region: RegionKind) -> Result<bool> {
        match self.classify(root, region)? {
            Step::Skip => return Ok(true),
            Step::Reject(reason) => {
                self.negative.mark(root, reason);
                return Ok(false);
            }
            Step::Walk => {}
        }

        let mut seen = AHashSet::new();
        seen.insert(root);

        // Depth-first with an explicit path so a rejection can blame every ancestor
        let mut path: Vec<(ObjId, usize)> = vec![(root, 0)];
        while let Some(top) = path.last_mut() {
            let (id, next) = *top;
            let object = self
                .heap
                .object(id)
                .ok_or(ArchiveError::UnknownObject(id.index()))?;

            let child = object
                .slots
                .iter()
                .enumerate()
                .skip(next)
                .find_map(|(i, slot)| match slot {
                    Slot::Ref(Some(child)) => Some((i, *child)),
                    _ => None,
                });

            let Some((index, child)) = child else {
                path.pop();
                continue;
            };
            top.1 = index + 1;

            if !seen.insert(child) {
                continue;
            }

            match self.classify(child, region)? {
                Step::Skip => {}
                Step::Walk => path.push((child, 0)),
                Step::Reject(reason) => {
                    self.negative.mark(child, reason);
                    for (ancestor, _) in &path {
                        self.negative.mark(*ancestor, reason);
                    }
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}
