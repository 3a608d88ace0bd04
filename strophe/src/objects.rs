use std::{any::Any, sync::Arc};

use crate::{
    CallFrame, Descriptor, HasVirtualTable, HeapObject, LinkageSection, ObjectKind, Result,
    RootHandle, RuntimeError, SegmentManager, SharedHeap, SymbolPath, Value, VirtualMethod,
    VirtualTable,
};

macro_rules! dispatch_via_table {
    ($ty:ty) => {
        impl HasVirtualTable for $ty {
            fn virtual_table(&self) -> Option<&VirtualTable> {
                Some(&self.table)
            }
        }
    };
}

#[derive(Debug)]
pub struct StringObject {
    value: String,
    table: Arc<VirtualTable>,
}

impl StringObject {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

dispatch_via_table!(StringObject);

impl HeapObject for StringObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::String
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct UrlObject {
    url: String,
    table: Arc<VirtualTable>,
}

impl UrlObject {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.url
    }
}

dispatch_via_table!(UrlObject);

impl HeapObject for UrlObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Url
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct BytesObject {
    bytes: Vec<u8>,
    table: Arc<VirtualTable>,
}

impl BytesObject {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

dispatch_via_table!(BytesObject);

impl HeapObject for BytesObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Bytes
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Rest arguments of a frame, packed into one value.
#[derive(Debug)]
pub struct RestObject {
    values: Vec<Value>,
    table: Arc<VirtualTable>,
}

impl RestObject {
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

dispatch_via_table!(RestObject);

impl HeapObject for RestObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Rest
    }

    fn visit_edges(&self, visitor: &mut dyn FnMut(&Value)) {
        self.values.iter().for_each(visitor);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Object laid out by a class, enum, instance or struct table. Member slots
/// follow the table's member layout.
#[derive(Debug)]
pub struct InstanceObject {
    members: Vec<Value>,
    table: Arc<VirtualTable>,
}

impl InstanceObject {
    #[must_use]
    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn member(&self, i: usize) -> Value {
        self.members.get(i).copied().unwrap_or(Value::Invalid)
    }

    pub fn set_member(&mut self, i: usize, value: Value) -> bool {
        match self.members.get_mut(i) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

dispatch_via_table!(InstanceObject);

impl HeapObject for InstanceObject {
    fn kind(&self) -> ObjectKind {
        match self.table.descriptor() {
            Value::Enum(_) => ObjectKind::Enum,
            Value::Struct(_) => ObjectKind::Struct,
            _ => ObjectKind::Instance,
        }
    }

    fn visit_edges(&self, visitor: &mut dyn FnMut(&Value)) {
        self.members.iter().for_each(visitor);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn invalid_member_receiver(receiver: Value) -> RuntimeError {
    RuntimeError::invariant(format!("invalid member receiver {receiver}"))
}

/// Dispatch tables of the fundamental types, taken from the prelude.
#[derive(Debug, Clone)]
pub struct PreludeTables {
    pub bytes: Arc<VirtualTable>,
    pub rest: Arc<VirtualTable>,
    pub string: Arc<VirtualTable>,
    pub url: Arc<VirtualTable>,
}

impl PreludeTables {
    pub fn resolve(segments: &mut SegmentManager, prelude: u32) -> Result<Self> {
        Ok(Self {
            bytes: Self::table(segments, prelude, "Bytes")?,
            rest: Self::table(segments, prelude, "Rest")?,
            string: Self::table(segments, prelude, "String")?,
            url: Self::table(segments, prelude, "Url")?,
        })
    }

    fn table(segments: &mut SegmentManager, prelude: u32, name: &str) -> Result<Arc<VirtualTable>> {
        let path = SymbolPath::parse(name);
        let symbol = segments
            .get_segment(prelude)
            .and_then(|segment| segment.object().find_symbol(&path))
            .filter(|symbol| symbol.section == LinkageSection::Existential)
            .ok_or_else(|| RuntimeError::MissingSymbol(path.to_string()))?;
        let existential = Value::Existential(Descriptor::new(prelude, symbol.index));
        segments.resolve_existential_table(existential)
    }
}

/// Allocation front end over the shared heap.
#[derive(Debug)]
pub struct HeapManager {
    heap: SharedHeap,
    prelude: PreludeTables,
}

impl HeapManager {
    #[must_use]
    pub fn new(heap: SharedHeap, prelude: PreludeTables) -> Self {
        Self { heap, prelude }
    }

    #[must_use]
    pub fn heap(&self) -> &SharedHeap {
        &self.heap
    }

    #[must_use]
    pub fn prelude(&self) -> &PreludeTables {
        &self.prelude
    }

    fn insert(&self, object: Box<dyn HeapObject>) -> crate::HeapRef {
        self.heap.write().insert(object)
    }

    pub fn allocate_string(&self, value: &str) -> Value {
        let table = self.prelude.string.clone();
        Value::String(self.insert(Box::new(StringObject { value: value.to_owned(), table })))
    }

    pub fn allocate_url(&self, url: &str) -> Value {
        let table = self.prelude.url.clone();
        Value::Url(self.insert(Box::new(UrlObject { url: url.to_owned(), table })))
    }

    pub fn allocate_bytes(&self, bytes: &[u8]) -> Value {
        let table = self.prelude.bytes.clone();
        Value::Bytes(self.insert(Box::new(BytesObject { bytes: bytes.to_vec(), table })))
    }

    /// Packs the rest arguments of `frame` into a single value.
    pub fn allocate_rest(&self, frame: &CallFrame) -> Value {
        let table = self.prelude.rest.clone();
        Value::Rest(self.insert(Box::new(RestObject { values: frame.rest().to_vec(), table })))
    }

    /// Allocates an object of `table`'s layout. Members beyond those given
    /// start out invalid.
    pub fn allocate_instance(&self, table: Arc<VirtualTable>, mut members: Vec<Value>) -> Value {
        let total = table.layout_total() as usize;
        if members.len() < total {
            members.resize(total, Value::Invalid);
        }
        Value::Ref(self.insert(Box::new(InstanceObject { members, table })))
    }

    /// Reads member `field` of a layout object.
    pub fn load_member(&self, receiver: Value, field: Descriptor) -> Result<Value> {
        let reference = receiver.heap_ref().ok_or_else(|| invalid_member_receiver(receiver))?;
        let heap = self.heap.read();
        let object = heap
            .get(reference)
            .and_then(|object| object.as_any().downcast_ref::<InstanceObject>())
            .ok_or_else(|| invalid_member_receiver(receiver))?;
        let slot = object
            .table
            .get_member(field)
            .ok_or_else(|| RuntimeError::invariant("missing member"))?;
        Ok(object.member(slot as usize))
    }

    pub fn store_member(&self, receiver: Value, field: Descriptor, value: Value) -> Result<()> {
        let reference = receiver.heap_ref().ok_or_else(|| invalid_member_receiver(receiver))?;
        let mut heap = self.heap.write();
        let object = heap
            .get_mut(reference)
            .and_then(|object| object.as_any_mut().downcast_mut::<InstanceObject>())
            .ok_or_else(|| invalid_member_receiver(receiver))?;
        let slot = object
            .table
            .get_member(field)
            .ok_or_else(|| RuntimeError::invariant("missing member"))?;
        if !object.set_member(slot as usize, value) {
            return Err(RuntimeError::invariant("missing member"));
        }
        Ok(())
    }

    pub fn create_handle(&self, value: Value) -> Option<RootHandle> {
        self.heap.write().create_handle(value.heap_ref()?)
    }

    pub fn release_handle(&self, handle: RootHandle) -> bool {
        self.heap.write().release_handle(handle)
    }

    /// Runs `f` on the referent of `value`, `None` if it has none or it died.
    pub fn with_object<R>(&self, value: Value, f: impl FnOnce(&dyn HeapObject) -> R) -> Option<R> {
        let reference = value.heap_ref()?;
        let heap = self.heap.read();
        heap.get(reference).map(|object| f(object))
    }

    #[must_use]
    pub fn read_string(&self, value: Value) -> Option<String> {
        self.with_object(value, |object| {
            let any = object.as_any();
            any.downcast_ref::<StringObject>()
                .map(|s| s.as_str().to_owned())
                .or_else(|| any.downcast_ref::<UrlObject>().map(|u| u.as_str().to_owned()))
        })
        .flatten()
    }

    fn with_table<R>(
        &self,
        receiver: Value,
        f: impl FnOnce(&VirtualTable) -> Option<R>,
    ) -> Result<Option<R>> {
        let invalid = || {
            RuntimeError::invariant(format!("cannot resolve method; invalid receiver {receiver}"))
        };
        if !matches!(
            receiver,
            Value::Bytes(_) | Value::Ref(_) | Value::Rest(_) | Value::String(_) | Value::Url(_)
        ) {
            return Err(invalid());
        }
        self.with_object(receiver, |object| object.virtual_table().map(f))
            .flatten()
            .ok_or_else(invalid)
    }

    /// Looks up the implementation of `call` in the receiver's dispatch table.
    pub fn lookup_method(
        &self,
        receiver: Value,
        call: Descriptor,
    ) -> Result<Option<VirtualMethod>> {
        self.with_table(receiver, |table| table.get_method(call))
    }

    pub fn lookup_extension(
        &self,
        receiver: Value,
        concept: Descriptor,
        action: Descriptor,
    ) -> Result<Option<VirtualMethod>> {
        self.with_table(receiver, |table| table.get_extension(concept, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PRELUDE, prelude_builder, segments_with};
    use crate::{
        ArenaHeap, CallFrameInfo, HeapCreateInfo, InstructionPointer, LayoutDescriptor,
        ObjectBuilder,
    };

    fn mk_heap_manager() -> (SegmentManager, HeapManager) {
        let mut segments = segments_with(vec![(PRELUDE, prelude_builder().build())]);
        let prelude = segments.get_or_load_segment(&PRELUDE.into()).expect("prelude");
        let tables = PreludeTables::resolve(&mut segments, prelude).expect("tables");
        let heap = HeapManager::new(ArenaHeap::shared(HeapCreateInfo::default()), tables);
        (segments, heap)
    }

    #[test]
    fn strings_get_the_string_table() {
        let (_segments, heap) = mk_heap_manager();
        let value = heap.allocate_string("hello");
        assert!(matches!(value, Value::String(_)));
        assert_eq!(heap.read_string(value).as_deref(), Some("hello"));

        let descriptor = heap
            .with_object(value, |object| object.virtual_table().map(VirtualTable::descriptor))
            .flatten();
        assert_eq!(descriptor, Some(heap.prelude().string.descriptor()));
        assert_eq!(heap.heap().read().len(), 1);
    }

    #[test]
    fn rest_arguments_are_packed() {
        let (_segments, heap) = mk_heap_manager();
        let info = CallFrameInfo {
            call_index: 0,
            call_segment: 0,
            proc_offset: 0,
            return_segment: None,
            return_ip: InstructionPointer::INVALID,
            stack_guard: 0,
            num_arguments: 1,
            num_locals: 0,
            num_lexicals: 0,
        };
        let frame = CallFrame::new(info, vec![Value::I64(0), Value::I64(1), Value::I64(2)], None);
        let rest = heap.allocate_rest(&frame);
        let packed = heap
            .with_object(rest, |object| {
                object.as_any().downcast_ref::<RestObject>().map(|r| r.values().to_vec())
            })
            .flatten();
        assert_eq!(packed, Some(vec![Value::I64(1), Value::I64(2)]));
    }

    #[test]
    fn layout_objects_take_their_kind_and_members_from_the_table() {
        let mut module = ObjectBuilder::new();
        let x = module.declare(LinkageSection::Field, "Point.x");
        let y = module.declare(LinkageSection::Field, "Point.y");
        let tag = module.declare(LinkageSection::Field, "Color.tag");
        let mut point = LayoutDescriptor::new("Point");
        point.members = vec![crate::Address::near(x), crate::Address::near(y)];
        let point = module.add_struct(point);
        let mut color = LayoutDescriptor::new("Color");
        color.members.push(crate::Address::near(tag));
        let color = module.add_enum(color);

        let (_, heap) = mk_heap_manager();
        let mut segments = segments_with(vec![("/m", module.build())]);
        let m = segments.get_or_load_segment(&"/m".into()).expect("load");
        let point_table = segments
            .resolve_struct_virtual_table(Value::Struct(Descriptor::new(m, point)))
            .expect("struct table");
        let color_table = segments
            .resolve_enum_virtual_table(Value::Enum(Descriptor::new(m, color)))
            .expect("enum table");

        let origin = heap.allocate_instance(point_table, vec![Value::I64(0)]);
        let red = heap.allocate_instance(color_table, Vec::new());
        assert_eq!(heap.with_object(origin, |o| o.kind()), Some(ObjectKind::Struct));
        assert_eq!(heap.with_object(red, |o| o.kind()), Some(ObjectKind::Enum));

        let members = heap
            .with_object(origin, |o| {
                o.as_any().downcast_ref::<InstanceObject>().map(InstanceObject::num_members)
            })
            .flatten();
        assert_eq!(members, Some(2));
        assert!(!heap.load_member(origin, Descriptor::new(m, y)).expect("unset").is_valid());

        heap.store_member(origin, Descriptor::new(m, y), Value::I64(5)).expect("store");
        assert_eq!(heap.load_member(origin, Descriptor::new(m, x)), Ok(Value::I64(0)));
        assert_eq!(heap.load_member(origin, Descriptor::new(m, y)), Ok(Value::I64(5)));

        let err = heap.load_member(red, Descriptor::new(m, x)).expect_err("not a member");
        assert_eq!(err, RuntimeError::invariant("missing member"));
        let text = heap.allocate_string("red");
        let err = heap.store_member(text, Descriptor::new(m, tag), Value::Nil).expect_err("string");
        assert!(err.message().starts_with("invalid member receiver"));
    }

    #[test]
    fn non_heap_receivers_are_rejected() {
        let (_segments, heap) = mk_heap_manager();
        let err = heap.lookup_method(Value::I64(3), Descriptor::new(0, 0)).expect_err("receiver");
        assert_eq!(err, RuntimeError::invariant("cannot resolve method; invalid receiver 3"));
    }

    #[test]
    fn handles_survive_collection() {
        let (mut segments, heap) = mk_heap_manager();
        let kept = heap.allocate_bytes(&[1, 2, 3]);
        let dropped = heap.allocate_url("dev.zuri://x");
        let handle = heap.create_handle(kept).expect("handle");

        heap.heap().write().collect(&mut segments);
        assert!(heap.with_object(kept, |_| ()).is_some());
        assert!(heap.with_object(dropped, |_| ()).is_none());
        assert!(heap.release_handle(handle));
    }
}
