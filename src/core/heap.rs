//! Dump-time view of the managed heap
//!
//! The archiver never touches raw heap memory. It walks the source heap
//! through [`HeapSource`], addressing objects by arena handle ([`ObjId`])
//! and types by their stable identity ([`TypeKey`]). [`Heap`] is an
//! in-memory implementation used by embedders that build their boot graph
//! directly, and by the tests.

use crate::core::codec::WORD_SIZE;
use crate::core::error::{ArchiveError, Result};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Stable type identity shared by the dumping and the loading process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeKey(pub u32);

/// Handle to an object in the source heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(u32);

impl ObjId {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Object shape
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Fixed layout described by [`TypeInfo::instance_layout`]
    Instance = 0,
    /// Array of references
    RefArray = 1,
    /// Array of primitive words
    PrimArray = 2,
}

impl ObjectKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ObjectKind::Instance),
            1 => Some(ObjectKind::RefArray),
            2 => Some(ObjectKind::PrimArray),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Ref,
    Prim,
}

/// A type-scoped (static) field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticField {
    pub name: String,
    /// Byte offset into the type's static storage
    pub offset: u32,
    pub kind: FieldKind,
    pub declared_type: String,
}

#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub key: TypeKey,
    pub name: String,
    pub kind: ObjectKind,
    pub instance_layout: Vec<FieldKind>,
    pub static_fields: Vec<StaticField>,
    /// Instances run custom code when collected
    pub has_finalizer: bool,
    /// Instances wrap native resources or identity-sensitive state
    /// (file and socket handles, threads, locks)
    pub holds_native_state: bool,
}

impl TypeInfo {
    pub fn static_field(&self, name: &str) -> Option<&StaticField> {
        self.static_fields.iter().find(|f| f.name == name)
    }

    pub fn static_field_at(&self, offset: u32) -> Option<&StaticField> {
        self.static_fields.iter().find(|f| f.offset == offset)
    }

    /// Instances of this type can be frozen into an archive
    pub fn is_freezable(&self) -> bool {
        !self.has_finalizer && !self.holds_native_state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Ref(Option<ObjId>),
    Prim(u64),
}

#[derive(Debug, Clone)]
pub struct HeapObject {
    pub ty: TypeKey,
    pub slots: Vec<Slot>,
}

impl HeapObject {
    /// Non-null references held by this object, in slot order
    pub fn references(&self) -> impl Iterator<Item = (usize, ObjId)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Ref(Some(id)) => Some((i, *id)),
            _ => None,
        })
    }
}

/// Read access to the heap being dumped
pub trait HeapSource {
    fn type_info(&self, key: TypeKey) -> Option<&TypeInfo>;

    fn find_type(&self, name: &str) -> Option<TypeKey>;

    fn object(&self, id: ObjId) -> Option<&HeapObject>;

    /// Current value of a static field
    fn static_slot(&self, ty: TypeKey, offset: u32) -> Option<Slot>;

    /// Index of a live object the runtime recreates itself on every start.
    ///
    /// Such objects are never copied. The open region may reference them by
    /// index; the closed region may not reference them at all.
    fn external_index(&self, id: ObjId) -> Option<u32>;
}

/// Describes a type before it is added to a [`Heap`]
#[derive(Debug, Clone)]
pub struct TypeBuilder {
    name: String,
    kind: ObjectKind,
    instance_layout: Vec<FieldKind>,
    static_fields: Vec<(String, FieldKind, String)>,
    has_finalizer: bool,
    holds_native_state: bool,
}

impl TypeBuilder {
    pub fn instance<S: Into<String>>(name: S) -> Self {
        Self::with_kind(name, ObjectKind::Instance)
    }

    pub fn ref_array<S: Into<String>>(name: S) -> Self {
        Self::with_kind(name, ObjectKind::RefArray)
    }

    pub fn prim_array<S: Into<String>>(name: S) -> Self {
        Self::with_kind(name, ObjectKind::PrimArray)
    }

    fn with_kind<S: Into<String>>(name: S, kind: ObjectKind) -> Self {
        TypeBuilder {
            name: name.into(),
            kind,
            instance_layout: Vec::new(),
            static_fields: Vec::new(),
            has_finalizer: false,
            holds_native_state: false,
        }
    }

    /// Append an instance field
    pub fn field(mut self, kind: FieldKind) -> Self {
        self.instance_layout.push(kind);
        self
    }

    pub fn static_ref<S: Into<String>, T: Into<String>>(mut self, name: S, declared_type: T) -> Self {
        self.static_fields
            .push((name.into(), FieldKind::Ref, declared_type.into()));
        self
    }

    pub fn static_prim<S: Into<String>>(mut self, name: S) -> Self {
        self.static_fields
            .push((name.into(), FieldKind::Prim, "word".to_string()));
        self
    }

    pub fn with_finalizer(mut self) -> Self {
        self.has_finalizer = true;
        self
    }

    pub fn with_native_state(mut self) -> Self {
        self.holds_native_state = true;
        self
    }
}

/// In-memory source heap: a type table plus an object arena
#[derive(Debug, Default)]
pub struct Heap {
    types: Vec<TypeInfo>,
    type_names: AHashMap<String, TypeKey>,
    objects: Vec<HeapObject>,
    statics: AHashMap<TypeKey, Vec<Slot>>,
    externals: AHashMap<ObjId, u32>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_type(&mut self, builder: TypeBuilder) -> Result<TypeKey> {
        if self.type_names.contains_key(&builder.name) {
            return Err(ArchiveError::InvalidConfig(format!(
                "Type {} is already defined",
                builder.name
            )));
        }

        let key = TypeKey(self.types.len() as u32);
        let static_fields: Vec<StaticField> = builder
            .static_fields
            .into_iter()
            .enumerate()
            .map(|(i, (name, kind, declared_type))| StaticField {
                name,
                offset: (i * WORD_SIZE) as u32,
                kind,
                declared_type,
            })
            .collect();

        let initial = static_fields
            .iter()
            .map(|f| match f.kind {
                FieldKind::Ref => Slot::Ref(None),
                FieldKind::Prim => Slot::Prim(0),
            })
            .collect();

        self.statics.insert(key, initial);
        self.type_names.insert(builder.name.clone(), key);
        self.types.push(TypeInfo {
            key,
            name: builder.name,
            kind: builder.kind,
            instance_layout: builder.instance_layout,
            static_fields,
            has_finalizer: builder.has_finalizer,
            holds_native_state: builder.holds_native_state,
        });

        Ok(key)
    }

    fn type_checked(&self, ty: TypeKey, expected: ObjectKind) -> Result<&TypeInfo> {
        let info = self
            .types
            .get(ty.0 as usize)
            .ok_or_else(|| ArchiveError::UnknownType(format!("#{}", ty.0)))?;
        if info.kind != expected {
            return Err(ArchiveError::ShapeMismatch(format!(
                "{} is a {:?}, not a {:?}",
                info.name, info.kind, expected
            )));
        }
        Ok(info)
    }

    fn push(&mut self, object: HeapObject) -> ObjId {
        let id = ObjId(self.objects.len() as u32);
        self.objects.push(object);
        id
    }

    pub fn alloc_instance(&mut self, ty: TypeKey, slots: Vec<Slot>) -> Result<ObjId> {
        let info = self.type_checked(ty, ObjectKind::Instance)?;
        if slots.len() != info.instance_layout.len() {
            return Err(ArchiveError::ShapeMismatch(format!(
                "{} has {} fields, got {} slots",
                info.name,
                info.instance_layout.len(),
                slots.len()
            )));
        }
        for (slot, kind) in slots.iter().zip(&info.instance_layout) {
            let matches = matches!(
                (slot, kind),
                (Slot::Ref(_), FieldKind::Ref) | (Slot::Prim(_), FieldKind::Prim)
            );
            if !matches {
                return Err(ArchiveError::ShapeMismatch(format!(
                    "Slot kind does not match field layout of {}",
                    info.name
                )));
            }
        }
        Ok(self.push(HeapObject { ty, slots }))
    }

    pub fn alloc_ref_array(&mut self, ty: TypeKey, elements: Vec<Option<ObjId>>) -> Result<ObjId> {
        self.type_checked(ty, ObjectKind::RefArray)?;
        let slots = elements.into_iter().map(Slot::Ref).collect();
        Ok(self.push(HeapObject { ty, slots }))
    }

    pub fn alloc_prim_array(&mut self, ty: TypeKey, words: Vec<u64>) -> Result<ObjId> {
        self.type_checked(ty, ObjectKind::PrimArray)?;
        let slots = words.into_iter().map(Slot::Prim).collect();
        Ok(self.push(HeapObject { ty, slots }))
    }

    /// Overwrite one slot of an existing object, e.g. to close a cycle
    pub fn set_slot(&mut self, id: ObjId, index: usize, value: Slot) -> Result<()> {
        let object = self
            .objects
            .get_mut(id.0 as usize)
            .ok_or(ArchiveError::UnknownObject(id.0))?;
        let slot = object.slots.get_mut(index).ok_or_else(|| {
            ArchiveError::ShapeMismatch(format!("Object {} has no slot {}", id.0, index))
        })?;
        if std::mem::discriminant(slot) != std::mem::discriminant(&value) {
            return Err(ArchiveError::ShapeMismatch(format!(
                "Slot {} of object {} changes kind",
                index, id.0
            )));
        }
        *slot = value;
        Ok(())
    }

    pub fn set_static(&mut self, ty: TypeKey, field: &str, value: Slot) -> Result<()> {
        let info = self
            .types
            .get(ty.0 as usize)
            .ok_or_else(|| ArchiveError::UnknownType(format!("#{}", ty.0)))?;
        let index = info
            .static_fields
            .iter()
            .position(|f| f.name == field)
            .ok_or_else(|| ArchiveError::UnknownField {
                type_name: info.name.clone(),
                field: field.to_string(),
            })?;
        let kind_matches = matches!(
            (&value, info.static_fields[index].kind),
            (Slot::Ref(_), FieldKind::Ref) | (Slot::Prim(_), FieldKind::Prim)
        );
        if !kind_matches {
            return Err(ArchiveError::ShapeMismatch(format!(
                "Static field {}.{} has a different kind",
                info.name, field
            )));
        }
        if let Some(statics) = self.statics.get_mut(&ty) {
            statics[index] = value;
        }
        Ok(())
    }

    /// Mark an object as recreated by the runtime and return its external index
    pub fn register_external(&mut self, id: ObjId) -> Result<u32> {
        if id.0 as usize >= self.objects.len() {
            return Err(ArchiveError::UnknownObject(id.0));
        }
        let next = self.externals.len() as u32;
        Ok(*self.externals.entry(id).or_insert(next))
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

impl HeapSource for Heap {
    fn type_info(&self, key: TypeKey) -> Option<&TypeInfo> {
        self.types.get(key.0 as usize)
    }

    fn find_type(&self, name: &str) -> Option<TypeKey> {
        self.type_names.get(name).copied()
    }

    fn object(&self, id: ObjId) -> Option<&HeapObject> {
        self.objects.get(id.0 as usize)
    }

    fn static_slot(&self, ty: TypeKey, offset: u32) -> Option<Slot> {
        let index = offset as usize / WORD_SIZE;
        self.statics.get(&ty)?.get(index).copied()
    }

    fn external_index(&self, id: ObjId) -> Option<u32> {
        self.externals.get(&id).copied()
    }
}
