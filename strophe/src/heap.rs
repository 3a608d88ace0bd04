use std::{any::Any, fmt, sync::Arc};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::{HasVirtualTable, Value};

/// Non-owning, generation-checked reference into an [`ObjectHeap`].
///
/// Once the referent is collected its slot generation moves on, so a stale
/// reference resolves to nothing instead of aliasing the slot's next tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapRef {
    index: u32,
    generation: u32,
}

impl HeapRef {
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Permanent root, keeps its referent alive until released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle(u64);

pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    String,
    Url,
    Bytes,
    Rest,
    /// Class instances and instance singletons.
    Instance,
    Enum,
    Struct,
}

pub trait HeapObject: HasVirtualTable + fmt::Debug + Send + Sync {
    fn kind(&self) -> ObjectKind;

    /// Reports every value this object references.
    fn visit_edges(&self, visitor: &mut dyn FnMut(&Value)) {
        let _ = visitor;
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub marked: usize,
    pub freed: usize,
}

/// A heap the engine allocates from. The heap owns every object; values
/// only carry [`HeapRef`]s.
pub trait ObjectHeap: fmt::Debug + Send + Sync {
    fn insert(&mut self, object: Box<dyn HeapObject>) -> HeapRef;

    fn get(&self, reference: HeapRef) -> Option<&(dyn HeapObject + 'static)>;

    fn get_mut(&mut self, reference: HeapRef) -> Option<&mut (dyn HeapObject + 'static)>;

    fn create_handle(&mut self, reference: HeapRef) -> Option<RootHandle>;

    fn release_handle(&mut self, handle: RootHandle) -> bool;

    fn handle_ref(&self, handle: RootHandle) -> Option<HeapRef>;

    fn collect(&mut self, roots: &mut dyn RootProvider) -> CollectionStats;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type SharedHeap = Arc<RwLock<dyn ObjectHeap>>;

#[derive(Debug, Clone)]
pub struct HeapCreateInfo {
    pub initial_capacity: usize,
}

impl Default for HeapCreateInfo {
    fn default() -> Self {
        Self { initial_capacity: 256 }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    marked: bool,
    object: Option<Box<dyn HeapObject>>,
}

/// Slot arena with a free list and a mark & sweep collector.
#[derive(Debug)]
pub struct ArenaHeap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    handles: AHashMap<RootHandle, HeapRef>,
    next_handle: u64,
    live: usize,
}

impl ArenaHeap {
    #[must_use]
    pub fn new(info: HeapCreateInfo) -> Self {
        Self {
            slots: Vec::with_capacity(info.initial_capacity),
            free: Vec::new(),
            handles: AHashMap::new(),
            next_handle: 0,
            live: 0,
        }
    }

    #[must_use]
    pub fn shared(info: HeapCreateInfo) -> SharedHeap {
        Arc::new(RwLock::new(Self::new(info)))
    }

    fn slot(&self, reference: HeapRef) -> Option<&Slot> {
        self.slots
            .get(reference.index as usize)
            .filter(|slot| slot.generation == reference.generation && slot.object.is_some())
    }

    #[must_use]
    pub fn num_handles(&self) -> usize {
        self.handles.len()
    }
}

impl ObjectHeap for ArenaHeap {
    fn insert(&mut self, object: Box<dyn HeapObject>) -> HeapRef {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            slot.marked = false;
            return HeapRef::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, marked: false, object: Some(object) });
        HeapRef::new(index, 0)
    }

    fn get(&self, reference: HeapRef) -> Option<&(dyn HeapObject + 'static)> {
        self.slot(reference)?.object.as_deref()
    }

    fn get_mut(&mut self, reference: HeapRef) -> Option<&mut (dyn HeapObject + 'static)> {
        let slot = self.slots.get_mut(reference.index as usize)?;
        if slot.generation != reference.generation {
            return None;
        }
        slot.object.as_deref_mut()
    }

    fn create_handle(&mut self, reference: HeapRef) -> Option<RootHandle> {
        self.slot(reference)?;
        let handle = RootHandle(self.next_handle);
        self.next_handle += 1;
        self.handles.insert(handle, reference);
        Some(handle)
    }

    fn release_handle(&mut self, handle: RootHandle) -> bool {
        self.handles.remove(&handle).is_some()
    }

    fn handle_ref(&self, handle: RootHandle) -> Option<HeapRef> {
        self.handles.get(&handle).copied()
    }

    fn collect(&mut self, roots: &mut dyn RootProvider) -> CollectionStats {
        let mut stats = CollectionStats::default();
        for slot in &mut self.slots {
            slot.marked = false;
        }

        let mut worklist: Vec<HeapRef> = self.handles.values().copied().collect();
        roots.visit_roots(&mut |value| {
            if let Some(reference) = value.heap_ref() {
                worklist.push(reference);
            }
        });

        while let Some(reference) = worklist.pop() {
            let Some(slot) = self.slots.get_mut(reference.index as usize) else {
                continue;
            };
            if slot.marked || slot.generation != reference.generation || slot.object.is_none() {
                continue;
            }
            slot.marked = true;
            stats.marked += 1;
            if let Some(object) = &slot.object {
                object.visit_edges(&mut |edge| {
                    if let Some(reference) = edge.heap_ref() {
                        worklist.push(reference);
                    }
                });
            }
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.is_some() && !slot.marked {
                slot.object = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                self.live -= 1;
                stats.freed += 1;
            }
        }
        log::debug!("heap collection marked {} freed {}", stats.marked, stats.freed);
        stats
    }

    fn len(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VirtualTable;

    #[derive(Debug)]
    struct Cell {
        next: Value,
    }

    impl HasVirtualTable for Cell {
        fn virtual_table(&self) -> Option<&VirtualTable> {
            None
        }
    }

    impl HeapObject for Cell {
        fn kind(&self) -> ObjectKind {
            ObjectKind::Instance
        }

        fn visit_edges(&self, visitor: &mut dyn FnMut(&Value)) {
            visitor(&self.next);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Roots(Vec<Value>);

    impl RootProvider for Roots {
        fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
            for value in &mut self.0 {
                visitor(value);
            }
        }
    }

    fn mk_heap() -> ArenaHeap {
        ArenaHeap::new(HeapCreateInfo::default())
    }

    #[test]
    fn unreachable_objects_are_freed() {
        let mut heap = mk_heap();
        let tail = heap.insert(Box::new(Cell { next: Value::Nil }));
        let head = heap.insert(Box::new(Cell { next: Value::Ref(tail) }));
        let garbage = heap.insert(Box::new(Cell { next: Value::Nil }));
        assert_eq!(heap.len(), 3);

        let stats = heap.collect(&mut Roots(vec![Value::Ref(head)]));
        assert_eq!(stats, CollectionStats { marked: 2, freed: 1 });
        assert!(heap.get(head).is_some());
        assert!(heap.get(tail).is_some());
        assert!(heap.get(garbage).is_none());
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn stale_references_do_not_alias_reused_slots() {
        let mut heap = mk_heap();
        let old = heap.insert(Box::new(Cell { next: Value::Nil }));
        heap.collect(&mut Roots(Vec::new()));

        let new = heap.insert(Box::new(Cell { next: Value::Nil }));
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert!(heap.get(old).is_none());
        assert!(heap.get_mut(old).is_none());
        assert!(heap.get(new).is_some());
    }

    #[test]
    fn handles_pin_objects_until_released() {
        let mut heap = mk_heap();
        let pinned = heap.insert(Box::new(Cell { next: Value::Nil }));
        let handle = heap.create_handle(pinned).expect("live object");
        assert_eq!(heap.handle_ref(handle), Some(pinned));

        heap.collect(&mut Roots(Vec::new()));
        assert!(heap.get(pinned).is_some());

        assert!(heap.release_handle(handle));
        assert!(!heap.release_handle(handle));
        heap.collect(&mut Roots(Vec::new()));
        assert!(heap.get(pinned).is_none());
        assert!(heap.create_handle(pinned).is_none());
    }
}
