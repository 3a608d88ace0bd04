use std::sync::Arc;

use ahash::AHashMap;

use crate::{Descriptor, Value};

/// Entry of a dispatch table: where the implementing procedure lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualMethod {
    pub segment: u32,
    pub call_index: u32,
    pub proc_offset: u32,
}

/// Dispatch table of a class, enum, instance, struct, existential or
/// concept.
///
/// Methods are keyed by the call descriptor they implement. Extensions are
/// keyed by the (concept, action) pair, so one type can implement many
/// unrelated concepts side by side. Members map a field descriptor to its
/// layout slot; slots continue where the parent's end.
#[derive(Debug)]
pub struct VirtualTable {
    descriptor: Value,
    parent: Option<Arc<VirtualTable>>,
    layout_base: u32,
    members: AHashMap<Descriptor, u32>,
    methods: AHashMap<Descriptor, VirtualMethod>,
    extensions: AHashMap<(Descriptor, Descriptor), VirtualMethod>,
}

impl VirtualTable {
    #[must_use]
    pub fn new(descriptor: Value, parent: Option<Arc<VirtualTable>>) -> Self {
        let layout_base = parent.as_ref().map_or(0, |parent| parent.layout_total());
        Self {
            descriptor,
            parent,
            layout_base,
            members: AHashMap::new(),
            methods: AHashMap::new(),
            extensions: AHashMap::new(),
        }
    }

    /// Appends `field` after the members already laid out, returning its slot.
    pub fn insert_member(&mut self, field: Descriptor) -> u32 {
        let slot = self.layout_total();
        *self.members.entry(field).or_insert(slot)
    }

    pub fn insert_method(&mut self, call: Descriptor, method: VirtualMethod) {
        self.methods.insert(call, method);
    }

    pub fn insert_extension(
        &mut self,
        concept: Descriptor,
        action: Descriptor,
        method: VirtualMethod,
    ) {
        self.extensions.insert((concept, action), method);
    }

    #[must_use]
    pub fn descriptor(&self) -> Value {
        self.descriptor
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<VirtualTable>> {
        self.parent.as_ref()
    }

    /// Number of member slots including every ancestor's.
    #[must_use]
    pub fn layout_total(&self) -> u32 {
        self.layout_base + self.members.len() as u32
    }

    #[must_use]
    pub fn get_member(&self, field: Descriptor) -> Option<u32> {
        let mut table = Some(self);
        while let Some(current) = table {
            if let Some(slot) = current.members.get(&field) {
                return Some(*slot);
            }
            table = current.parent.as_deref();
        }
        None
    }

    #[must_use]
    pub fn get_method(&self, call: Descriptor) -> Option<VirtualMethod> {
        let mut table = Some(self);
        while let Some(current) = table {
            if let Some(method) = current.methods.get(&call) {
                return Some(*method);
            }
            table = current.parent.as_deref();
        }
        None
    }

    #[must_use]
    pub fn get_extension(&self, concept: Descriptor, action: Descriptor) -> Option<VirtualMethod> {
        let mut table = Some(self);
        while let Some(current) = table {
            if let Some(method) = current.extensions.get(&(concept, action)) {
                return Some(*method);
            }
            table = current.parent.as_deref();
        }
        None
    }

    #[must_use]
    pub fn num_methods(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn num_extensions(&self) -> usize {
        self.extensions.len()
    }
}

/// Capability of heap residents that take part in dynamic dispatch.
pub trait HasVirtualTable {
    fn virtual_table(&self) -> Option<&VirtualTable>;
}
