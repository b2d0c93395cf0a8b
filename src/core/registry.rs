//! Root registry
//!
//! The static list of (type, field) pairs nominated as archive entry points.

use crate::core::region::RegionKind;
use serde::{Deserialize, Serialize};

/// A candidate archive root
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RootSpec {
    pub type_name: String,
    pub field_name: String,
    #[serde(default)]
    pub region: RegionKind,
}

impl RootSpec {
    pub fn new<S: Into<String>, F: Into<String>>(type_name: S, field_name: F, region: RegionKind) -> Self {
        RootSpec {
            type_name: type_name.into(),
            field_name: field_name.into(),
            region,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RootRegistry {
    roots: Vec<RootSpec>,
}

impl RootRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs<I: IntoIterator<Item = RootSpec>>(specs: I) -> Self {
        let mut registry = RootRegistry::new();
        for spec in specs {
            registry.register(spec);
        }
        registry
    }

    /// Add a candidate root. Returns false if the field was already registered.
    pub fn register_root(&mut self, type_name: &str, field_name: &str, region: RegionKind) -> bool {
        self.register(RootSpec::new(type_name, field_name, region))
    }

    pub fn register(&mut self, spec: RootSpec) -> bool {
        let duplicate = self
            .roots
            .iter()
            .any(|r| r.type_name == spec.type_name && r.field_name == spec.field_name);
        if duplicate {
            tracing::warn!(
                "Root {}.{} registered twice, keeping the first registration",
                spec.type_name,
                spec.field_name
            );
            return false;
        }
        self.roots.push(spec);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &RootSpec> {
        self.roots.iter()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}
