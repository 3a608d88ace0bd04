use std::{fmt, sync::Arc};

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;

use crate::{
    Address, Descriptor, ImplDescriptor, LinkageSection, ModuleLocation, ModuleObject, Result,
    RootProvider, RuntimeError, Value, VirtualMethod, VirtualTable,
};

/// Source of module objects. Returns `Ok(None)` when nothing lives at the
/// location and [`RuntimeError::LoaderFailure`] when the module exists but
/// cannot be produced.
pub trait ModuleLoader: Send + Sync {
    fn load_module(&self, location: &ModuleLocation) -> Result<Option<Arc<ModuleObject>>>;
}

/// Loader backed by a map of already assembled modules.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    modules: RwLock<AHashMap<ModuleLocation, Arc<ModuleObject>>>,
}

impl MemoryLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, location: impl Into<ModuleLocation>, object: ModuleObject) {
        self.modules.write().insert(location.into(), Arc::new(object));
    }

    #[must_use]
    pub fn with_module(self, location: impl Into<ModuleLocation>, object: ModuleObject) -> Self {
        self.insert(location, object);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModuleLoader for MemoryLoader {
    fn load_module(&self, location: &ModuleLocation) -> Result<Option<Arc<ModuleObject>>> {
        Ok(self.modules.read().get(location).cloned())
    }
}

/// A resolved link: the descriptor `index` of `section` in `segment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEntry {
    pub segment: u32,
    pub section: LinkageSection,
    pub index: u32,
}

impl LinkEntry {
    #[must_use]
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(self.segment, self.index)
    }

    /// Descriptor value of the target, [`Value::Invalid`] for statics.
    #[must_use]
    pub fn value(&self) -> Value {
        Value::from_descriptor(self.section, self.descriptor()).unwrap_or(Value::Invalid)
    }
}

/// A loaded module: immutable code plus per-run storage and link cache.
///
/// Storage holds one cell per static, per instance singleton and per enum
/// singleton the module defines.
#[derive(Debug)]
pub struct BytecodeSegment {
    index: u32,
    location: ModuleLocation,
    object: Arc<ModuleObject>,
    links: Vec<Option<LinkEntry>>,
    statics: Vec<Value>,
    instances: Vec<Value>,
    enums: Vec<Value>,
}

impl BytecodeSegment {
    fn new(index: u32, location: ModuleLocation, object: Arc<ModuleObject>) -> Self {
        let cells = |section| vec![Value::Invalid; object.num_descriptors(section) as usize];
        let links = vec![None; object.num_links()];
        let statics = cells(LinkageSection::Static);
        let instances = cells(LinkageSection::Instance);
        let enums = cells(LinkageSection::Enum);
        Self { index, location, object, links, statics, instances, enums }
    }

    fn storage(&self, section: LinkageSection) -> &[Value] {
        match section {
            LinkageSection::Instance => &self.instances,
            LinkageSection::Enum => &self.enums,
            _ => &self.statics,
        }
    }

    fn storage_mut(&mut self, section: LinkageSection) -> &mut [Value] {
        match section {
            LinkageSection::Instance => &mut self.instances,
            LinkageSection::Enum => &mut self.enums,
            _ => &mut self.statics,
        }
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn location(&self) -> &ModuleLocation {
        &self.location
    }

    #[must_use]
    pub fn object(&self) -> &Arc<ModuleObject> {
        &self.object
    }

    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        self.object.bytecode()
    }

    #[must_use]
    pub fn link_entry(&self, offset: u32) -> Option<LinkEntry> {
        self.links.get(offset as usize).copied().flatten()
    }

    #[must_use]
    pub fn static_value(&self, index: u32) -> Value {
        self.stored_value(LinkageSection::Static, index)
    }

    /// Cell `index` of the static, instance or enum storage.
    #[must_use]
    pub fn stored_value(&self, section: LinkageSection, index: u32) -> Value {
        self.storage(section).get(index as usize).copied().unwrap_or(Value::Invalid)
    }
}

fn section_name(section: LinkageSection) -> String {
    section.to_string().to_lowercase()
}

/// Loads segments, resolves cross-segment links and builds dispatch tables.
pub struct SegmentManager {
    loader: Arc<dyn ModuleLoader>,
    origin: ModuleLocation,
    segments: Vec<BytecodeSegment>,
    by_location: AHashMap<ModuleLocation, u32>,
    tables: AHashMap<(LinkageSection, Descriptor), Arc<VirtualTable>>,
    // tables whose construction is underway, to catch loops in super chains
    resolving: AHashSet<(LinkageSection, Descriptor)>,
}

impl fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentManager")
            .field("origin", &self.origin)
            .field("segments", &self.segments.len())
            .field("tables", &self.tables.len())
            .finish_non_exhaustive()
    }
}

impl SegmentManager {
    #[must_use]
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            loader,
            origin: ModuleLocation::new(""),
            segments: Vec::new(),
            by_location: AHashMap::new(),
            tables: AHashMap::new(),
            resolving: AHashSet::new(),
        }
    }

    #[must_use]
    pub fn loader(&self) -> &Arc<dyn ModuleLoader> {
        &self.loader
    }

    /// Relative locations are resolved against the origin from now on.
    pub fn set_origin(&mut self, origin: ModuleLocation) {
        self.origin = origin;
    }

    #[must_use]
    pub fn origin(&self) -> &ModuleLocation {
        &self.origin
    }

    #[must_use]
    pub fn get_segment(&self, index: u32) -> Option<&BytecodeSegment> {
        self.segments.get(index as usize)
    }

    #[must_use]
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn find_segment(&self, location: &ModuleLocation) -> Option<u32> {
        self.by_location.get(&location.resolve(&self.origin)).copied()
    }

    pub fn get_or_load_segment(&mut self, location: &ModuleLocation) -> Result<u32> {
        let location = location.resolve(&self.origin);
        if let Some(index) = self.by_location.get(&location) {
            return Ok(*index);
        }
        let object = self
            .loader
            .load_module(&location)?
            .ok_or_else(|| RuntimeError::MissingObject(location.to_string()))?;

        let index = self.segments.len() as u32;
        log::debug!("loaded segment {index} from {location}");
        self.by_location.insert(location.clone(), index);
        self.segments.push(BytecodeSegment::new(index, location, object));
        Ok(index)
    }

    fn segment(&self, index: u32) -> Result<&BytecodeSegment> {
        self.get_segment(index)
            .ok_or_else(|| RuntimeError::invariant(format!("invalid segment {index}")))
    }

    pub fn resolve_link(&mut self, segment: u32, link_offset: u32) -> Result<LinkEntry> {
        let current = self.segment(segment)?;
        if let Some(entry) = current.link_entry(link_offset) {
            return Ok(entry);
        }
        let link = current
            .object
            .link(link_offset)
            .cloned()
            .ok_or_else(|| RuntimeError::invariant("missing linkage"))?;

        let target = self.get_or_load_segment(&link.location)?;
        let symbol = self
            .segment(target)?
            .object
            .find_symbol(&link.symbol)
            .ok_or_else(|| RuntimeError::MissingSymbol(link.symbol.to_string()))?;
        if symbol.section != link.section {
            return Err(RuntimeError::invariant(format!("invalid linkage for {}", link.symbol)));
        }

        let entry = LinkEntry { segment: target, section: symbol.section, index: symbol.index };
        log::debug!(
            "resolved link {link_offset} of segment {segment} to {} {}",
            entry.section,
            link.symbol
        );
        if let Some(slot) = self.segments[segment as usize].links.get_mut(link_offset as usize) {
            *slot = Some(entry);
        }
        Ok(entry)
    }

    /// Resolves `address`, near to `segment` or far through its links, to a
    /// descriptor of `section`.
    pub fn resolve_descriptor(
        &mut self,
        segment: u32,
        section: LinkageSection,
        address: Address,
    ) -> Result<Value> {
        let descriptor = if address.is_near() {
            let index = address.offset();
            if index >= self.segment(segment)?.object.num_descriptors(section) {
                return Err(RuntimeError::invariant(format!("invalid {section} descriptor")));
            }
            Descriptor::new(segment, index)
        } else if address.is_far() {
            let entry = self.resolve_link(segment, address.offset())?;
            if entry.section != section {
                return Err(RuntimeError::invariant(format!("invalid {section} linkage")));
            }
            entry.descriptor()
        } else {
            return Err(RuntimeError::invariant("invalid address"));
        };
        Value::from_descriptor(section, descriptor)
            .ok_or_else(|| RuntimeError::invariant(format!("{section} has no descriptor value")))
    }

    /// Resolves a static address to its (segment, static index).
    pub fn resolve_static(&mut self, segment: u32, address: Address) -> Result<Descriptor> {
        self.resolve_storage(segment, LinkageSection::Static, address)
    }

    fn resolve_storage(
        &mut self,
        segment: u32,
        section: LinkageSection,
        address: Address,
    ) -> Result<Descriptor> {
        if address.is_far() {
            let entry = self.resolve_link(segment, address.offset())?;
            if entry.section != section {
                let name = section_name(section);
                return Err(RuntimeError::invariant(format!("invalid {name} linkage")));
            }
            return Ok(entry.descriptor());
        }
        let count = self.segment(segment)?.object.num_descriptors(section);
        if !address.is_near() || address.offset() >= count {
            let name = section_name(section);
            return Err(RuntimeError::invariant(format!("missing {name} symbol")));
        }
        Ok(Descriptor::new(segment, address.offset()))
    }

    fn load(&mut self, segment: u32, section: LinkageSection, address: Address) -> Result<Value> {
        let target = self.resolve_storage(segment, section, address)?;
        Ok(self.segment(target.segment)?.stored_value(section, target.index))
    }

    fn store(
        &mut self,
        segment: u32,
        section: LinkageSection,
        address: Address,
        value: Value,
    ) -> Result<()> {
        let target = self.resolve_storage(segment, section, address)?;
        let slot = self
            .segments
            .get_mut(target.segment as usize)
            .and_then(|s| s.storage_mut(section).get_mut(target.index as usize))
            .ok_or_else(|| {
                RuntimeError::invariant(format!("missing {} symbol", section_name(section)))
            })?;
        *slot = value;
        Ok(())
    }

    pub fn load_static(&mut self, segment: u32, address: Address) -> Result<Value> {
        self.load(segment, LinkageSection::Static, address)
    }

    pub fn store_static(&mut self, segment: u32, address: Address, value: Value) -> Result<()> {
        self.store(segment, LinkageSection::Static, address, value)
    }

    /// Singleton value of the instance at `address`, [`Value::Invalid`] until
    /// stored.
    pub fn load_instance(&mut self, segment: u32, address: Address) -> Result<Value> {
        self.load(segment, LinkageSection::Instance, address)
    }

    pub fn store_instance(&mut self, segment: u32, address: Address, value: Value) -> Result<()> {
        self.store(segment, LinkageSection::Instance, address, value)
    }

    pub fn load_enum(&mut self, segment: u32, address: Address) -> Result<Value> {
        self.load(segment, LinkageSection::Enum, address)
    }

    pub fn store_enum(&mut self, segment: u32, address: Address, value: Value) -> Result<()> {
        self.store(segment, LinkageSection::Enum, address, value)
    }

    /// Dispatch entry for a resolved call descriptor.
    pub fn virtual_method(&self, call: Descriptor) -> Result<VirtualMethod> {
        let descriptor = self
            .segment(call.segment)?
            .object
            .call(call.index)
            .ok_or_else(|| RuntimeError::invariant("missing call"))?;
        Ok(VirtualMethod {
            segment: call.segment,
            call_index: call.index,
            proc_offset: descriptor.proc_offset,
        })
    }

    /// Returns the cached table for `(section, descriptor)`, building it with
    /// `build` on first use. Re-entering a table that is still being built
    /// means its super chain loops.
    fn cached_table(
        &mut self,
        section: LinkageSection,
        descriptor: Descriptor,
        build: impl FnOnce(&mut Self) -> Result<VirtualTable>,
    ) -> Result<Arc<VirtualTable>> {
        let key = (section, descriptor);
        if let Some(table) = self.tables.get(&key) {
            return Ok(table.clone());
        }
        if !self.resolving.insert(key) {
            let name = section_name(section);
            return Err(RuntimeError::invariant(format!("invalid super {name}")));
        }
        let built = build(self);
        self.resolving.remove(&key);

        let table = Arc::new(built?);
        log::trace!("built {section} table for {descriptor:?}");
        self.tables.insert(key, table.clone());
        Ok(table)
    }

    fn parent_table(
        &mut self,
        segment: u32,
        section: LinkageSection,
        super_type: Address,
    ) -> Result<Option<Arc<VirtualTable>>> {
        if !super_type.is_valid() {
            return Ok(None);
        }
        let parent = self.resolve_descriptor(segment, section, super_type)?;
        match section {
            LinkageSection::Existential => self.resolve_existential_table(parent).map(Some),
            LinkageSection::Concept => self.resolve_concept_table(parent).map(Some),
            _ => self.resolve_layout_table(section, parent).map(Some),
        }
    }

    fn resolve_layout_table(
        &mut self,
        section: LinkageSection,
        value: Value,
    ) -> Result<Arc<VirtualTable>> {
        let name = section_name(section);
        let descriptor = value
            .descriptor()
            .filter(|_| value.section() == Some(section))
            .ok_or_else(|| RuntimeError::invariant(format!("invalid {name} descriptor {value}")))?;
        self.cached_table(section, descriptor, |segments| {
            let object = segments.segment(descriptor.segment)?.object.clone();
            let layout = object
                .layout(section, descriptor.index)
                .ok_or_else(|| RuntimeError::invariant(format!("missing {name}")))?;
            let parent = segments.parent_table(descriptor.segment, section, layout.super_type)?;

            let mut table = VirtualTable::new(value, parent);
            for address in &layout.members {
                let field = segments
                    .resolve_descriptor(descriptor.segment, LinkageSection::Field, *address)?
                    .descriptor()
                    .ok_or_else(|| RuntimeError::invariant("missing field"))?;
                table.insert_member(field);
            }
            let (methods, impls) = (&layout.methods, &layout.impls);
            segments.populate_table(&mut table, descriptor.segment, methods, impls)?;
            Ok(table)
        })
    }

    pub fn resolve_class_virtual_table(&mut self, class: Value) -> Result<Arc<VirtualTable>> {
        self.resolve_layout_table(LinkageSection::Class, class)
    }

    pub fn resolve_enum_virtual_table(&mut self, descriptor: Value) -> Result<Arc<VirtualTable>> {
        self.resolve_layout_table(LinkageSection::Enum, descriptor)
    }

    pub fn resolve_instance_virtual_table(
        &mut self,
        descriptor: Value,
    ) -> Result<Arc<VirtualTable>> {
        self.resolve_layout_table(LinkageSection::Instance, descriptor)
    }

    pub fn resolve_struct_virtual_table(&mut self, descriptor: Value) -> Result<Arc<VirtualTable>> {
        self.resolve_layout_table(LinkageSection::Struct, descriptor)
    }

    pub fn resolve_existential_table(&mut self, existential: Value) -> Result<Arc<VirtualTable>> {
        let Value::Existential(descriptor) = existential else {
            return Err(RuntimeError::invariant(format!(
                "invalid existential descriptor {existential}"
            )));
        };
        self.cached_table(LinkageSection::Existential, descriptor, |segments| {
            let object = segments.segment(descriptor.segment)?.object.clone();
            let existential_descriptor = object
                .existential(descriptor.index)
                .ok_or_else(|| RuntimeError::invariant("missing existential"))?;
            let parent = segments.parent_table(
                descriptor.segment,
                LinkageSection::Existential,
                existential_descriptor.super_existential,
            )?;

            let mut table = VirtualTable::new(existential, parent);
            segments.populate_table(
                &mut table,
                descriptor.segment,
                &existential_descriptor.methods,
                &existential_descriptor.impls,
            )?;
            Ok(table)
        })
    }

    /// Table of the concepts a concept itself implements, chained to its
    /// super concept. It carries extensions only.
    pub fn resolve_concept_table(&mut self, concept: Value) -> Result<Arc<VirtualTable>> {
        let Value::Concept(descriptor) = concept else {
            return Err(RuntimeError::invariant(format!("invalid concept descriptor {concept}")));
        };
        self.cached_table(LinkageSection::Concept, descriptor, |segments| {
            let object = segments.segment(descriptor.segment)?.object.clone();
            let concept_descriptor = object
                .concept(descriptor.index)
                .ok_or_else(|| RuntimeError::invariant("missing concept"))?;
            let parent = segments.parent_table(
                descriptor.segment,
                LinkageSection::Concept,
                concept_descriptor.super_concept,
            )?;

            let mut table = VirtualTable::new(concept, parent);
            let impls = &concept_descriptor.impls;
            segments.populate_table(&mut table, descriptor.segment, &[], impls)?;
            Ok(table)
        })
    }

    fn populate_table(
        &mut self,
        table: &mut VirtualTable,
        segment: u32,
        methods: &[Address],
        impls: &[ImplDescriptor],
    ) -> Result<()> {
        for address in methods {
            let call = self.resolve_call_descriptor(segment, *address)?;
            table.insert_method(call, self.virtual_method(call)?);
        }
        for implementation in impls {
            let concept = self
                .resolve_descriptor(segment, LinkageSection::Concept, implementation.concept)?
                .descriptor();
            for extension in &implementation.extensions {
                let action = self
                    .resolve_descriptor(segment, LinkageSection::Action, extension.action)?
                    .descriptor();
                let call = self.resolve_call_descriptor(segment, extension.call)?;
                if let (Some(concept), Some(action)) = (concept, action) {
                    table.insert_extension(concept, action, self.virtual_method(call)?);
                }
            }
        }
        Ok(())
    }

    fn resolve_call_descriptor(&mut self, segment: u32, address: Address) -> Result<Descriptor> {
        self.resolve_descriptor(segment, LinkageSection::Call, address)?
            .descriptor()
            .ok_or_else(|| RuntimeError::invariant("missing call"))
    }
}

impl RootProvider for SegmentManager {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for segment in &mut self.segments {
            let cells = segment.statics.iter_mut();
            for value in cells.chain(&mut segment.instances).chain(&mut segment.enums) {
                visitor(value);
            }
        }
    }
}

impl Drop for SegmentManager {
    fn drop(&mut self) {
        log::debug!("releasing {} segments", self.segments.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingLoader, existential, segments_with};
    use crate::{
        CallFlags, ConceptDescriptor, ExtensionDescriptor, LayoutDescriptor, ObjectBuilder,
        ProcBuilder,
    };

    #[test]
    fn segments_are_loaded_once() {
        let mut segments = segments_with(vec![("/lib", ObjectBuilder::new().build())]);
        let first = segments.get_or_load_segment(&"/lib".into()).expect("load");
        let second = segments.get_or_load_segment(&"/lib".into()).expect("cached");
        assert_eq!(first, second);
        assert_eq!(segments.num_segments(), 1);
        assert_eq!(segments.find_segment(&"/lib".into()), Some(first));

        let err = segments.get_or_load_segment(&"/nope".into()).expect_err("missing");
        assert_eq!(err, RuntimeError::MissingObject("/nope".into()));
    }

    #[test]
    fn relative_locations_use_origin() {
        let mut segments = segments_with(vec![("/app/lib", ObjectBuilder::new().build())]);
        segments.set_origin("/app".into());
        let index = segments.get_or_load_segment(&"lib".into()).expect("load");
        assert_eq!(segments.get_segment(index).map(|s| s.location().as_str()), Some("/app/lib"));
    }

    #[test]
    fn links_resolve_and_cache() {
        let mut lib = ObjectBuilder::new();
        lib.add_proc_call("helper", &ProcBuilder::new(), CallFlags::empty());
        let mut main = ObjectBuilder::new();
        let good = main.add_link(LinkageSection::Call, "/lib", "helper");
        let missing_symbol = main.add_link(LinkageSection::Call, "/lib", "absent");
        let missing_module = main.add_link(LinkageSection::Call, "/gone", "helper");
        let wrong_kind = main.add_link(LinkageSection::Static, "/lib", "helper");

        let mut segments = segments_with(vec![("/main", main.build()), ("/lib", lib.build())]);
        let main = segments.get_or_load_segment(&"/main".into()).expect("main");

        let entry = segments.resolve_link(main, good.offset()).expect("link");
        assert_eq!(entry.section, LinkageSection::Call);
        assert_eq!(entry.index, 0);
        let cached = segments.get_segment(main).and_then(|s| s.link_entry(good.offset()));
        assert_eq!(cached, Some(entry));
        assert_eq!(entry.value(), Value::Call(Descriptor::new(entry.segment, 0)));

        assert_eq!(
            segments.resolve_link(main, missing_symbol.offset()),
            Err(RuntimeError::MissingSymbol("absent".into()))
        );
        assert_eq!(
            segments.resolve_link(main, missing_module.offset()),
            Err(RuntimeError::MissingObject("/gone".into()))
        );
        assert!(segments.resolve_link(main, wrong_kind.offset()).is_err());
        let err = segments.resolve_link(main, 99).expect_err("out of range");
        assert_eq!(err, RuntimeError::invariant("missing linkage"));
    }

    #[test]
    fn near_descriptors_are_bounds_checked() {
        let mut module = ObjectBuilder::new();
        module.declare(LinkageSection::Action, "act");
        let mut segments = segments_with(vec![("/m", module.build())]);
        let m = segments.get_or_load_segment(&"/m".into()).expect("load");

        let action = segments
            .resolve_descriptor(m, LinkageSection::Action, Address::near(0))
            .expect("declared");
        assert_eq!(action, Value::Action(Descriptor::new(m, 0)));
        assert!(segments.resolve_descriptor(m, LinkageSection::Action, Address::near(1)).is_err());
        assert!(segments.resolve_descriptor(m, LinkageSection::Action, Address::INVALID).is_err());
    }

    #[test]
    fn statics_load_and_store() {
        let mut lib = ObjectBuilder::new();
        lib.add_static("counter", Address::INVALID);
        let mut main = ObjectBuilder::new();
        let local = main.add_static("local", Address::INVALID);
        let far = main.add_link(LinkageSection::Static, "/lib", "counter");
        let not_static = main.add_link(LinkageSection::Call, "/lib", "counter");

        let mut segments = segments_with(vec![("/main", main.build()), ("/lib", lib.build())]);
        let main = segments.get_or_load_segment(&"/main".into()).expect("main");

        segments.store_static(main, Address::near(local), Value::I64(1)).expect("store");
        segments.store_static(main, far, Value::I64(2)).expect("store far");
        assert_eq!(segments.load_static(main, Address::near(local)), Ok(Value::I64(1)));
        assert_eq!(segments.load_static(main, far), Ok(Value::I64(2)));
        assert_eq!(
            segments.load_static(main, Address::near(9)),
            Err(RuntimeError::invariant("missing static symbol"))
        );
        assert!(segments.load_static(main, not_static).is_err());
    }

    #[test]
    fn class_tables_chain_to_superclass() {
        let mut module = ObjectBuilder::new();
        let base_method = module.add_proc_call("Base.m", &ProcBuilder::new(), CallFlags::BOUND);
        let derived_method =
            module.add_proc_call("Derived.n", &ProcBuilder::new(), CallFlags::BOUND);
        let show_impl = module.add_proc_call("Derived.show", &ProcBuilder::new(), CallFlags::BOUND);
        let concept = module.add_concept(ConceptDescriptor::new("Show"));
        let action = module.declare(LinkageSection::Action, "Show.show");

        let mut base = LayoutDescriptor::new("Base");
        base.methods.push(Address::near(base_method));
        let base = module.add_class(base);
        let mut derived = LayoutDescriptor::new("Derived");
        derived.super_type = Address::near(base);
        derived.methods.push(Address::near(derived_method));
        derived.impls.push(ImplDescriptor {
            concept: Address::near(concept),
            extensions: vec![ExtensionDescriptor {
                action: Address::near(action),
                call: Address::near(show_impl),
            }],
        });
        let derived = module.add_class(derived);

        let mut segments = segments_with(vec![("/m", module.build())]);
        let m = segments.get_or_load_segment(&"/m".into()).expect("load");
        let table = segments
            .resolve_class_virtual_table(Value::Class(Descriptor::new(m, derived)))
            .expect("table");

        let inherited = table.get_method(Descriptor::new(m, base_method)).expect("inherited");
        assert_eq!(inherited.call_index, base_method);
        assert!(table.get_method(Descriptor::new(m, derived_method)).is_some());
        let show = table
            .get_extension(Descriptor::new(m, concept), Descriptor::new(m, action))
            .expect("extension");
        assert_eq!(show.call_index, show_impl);

        let again = segments
            .resolve_class_virtual_table(Value::Class(Descriptor::new(m, derived)))
            .expect("cached");
        assert!(Arc::ptr_eq(&table, &again));
        assert!(segments.resolve_class_virtual_table(Value::Nil).is_err());
    }

    #[test]
    fn cyclic_super_class_is_rejected() {
        let mut module = ObjectBuilder::new();
        let mut a = LayoutDescriptor::new("A");
        a.super_type = Address::near(1);
        module.add_class(a);
        let mut b = LayoutDescriptor::new("B");
        b.super_type = Address::near(0);
        let b = module.add_class(b);

        let mut segments = segments_with(vec![("/m", module.build())]);
        let m = segments.get_or_load_segment(&"/m".into()).expect("load");
        let class = Value::Class(Descriptor::new(m, b));
        let err = segments.resolve_class_virtual_table(class).expect_err("cycle");
        assert_eq!(err, RuntimeError::invariant("invalid super class"));

        // a failed build leaves nothing half registered
        let err = segments.resolve_class_virtual_table(class).expect_err("cycle again");
        assert_eq!(err, RuntimeError::invariant("invalid super class"));
    }

    #[test]
    fn cyclic_super_existential_is_rejected() {
        let mut module = ObjectBuilder::new();
        let ty = module.declare(LinkageSection::Type, "LoopType");
        let mut looping = existential("Loop", Address::near(ty));
        looping.super_existential = Address::near(0);
        let index = module.add_existential(looping);

        let mut segments = segments_with(vec![("/m", module.build())]);
        let m = segments.get_or_load_segment(&"/m".into()).expect("load");
        let err = segments
            .resolve_existential_table(Value::Existential(Descriptor::new(m, index)))
            .expect_err("cycle");
        assert_eq!(err, RuntimeError::invariant("invalid super existential"));
    }

    #[test]
    fn struct_members_extend_the_super_layout() {
        let mut module = ObjectBuilder::new();
        let x = module.declare(LinkageSection::Field, "Point.x");
        let y = module.declare(LinkageSection::Field, "Point.y");
        let z = module.declare(LinkageSection::Field, "Point3.z");
        let norm = module.add_proc_call("Point3.norm", &ProcBuilder::new(), CallFlags::BOUND);

        let mut point = LayoutDescriptor::new("Point");
        point.members = vec![Address::near(x), Address::near(y)];
        let point = module.add_struct(point);
        let mut point3 = LayoutDescriptor::new("Point3");
        point3.super_type = Address::near(point);
        point3.members.push(Address::near(z));
        point3.methods.push(Address::near(norm));
        let point3 = module.add_struct(point3);

        let mut segments = segments_with(vec![("/m", module.build())]);
        let m = segments.get_or_load_segment(&"/m".into()).expect("load");
        let table = segments
            .resolve_struct_virtual_table(Value::Struct(Descriptor::new(m, point3)))
            .expect("table");

        assert_eq!(table.descriptor(), Value::Struct(Descriptor::new(m, point3)));
        assert_eq!(table.layout_total(), 3);
        assert_eq!(table.get_member(Descriptor::new(m, y)), Some(1));
        assert_eq!(table.get_member(Descriptor::new(m, z)), Some(2));
        assert!(table.get_method(Descriptor::new(m, norm)).is_some());

        let as_class = Value::Class(Descriptor::new(m, point3));
        let err = segments.resolve_struct_virtual_table(as_class).expect_err("wrong kind");
        assert_eq!(err, RuntimeError::invariant(format!("invalid struct descriptor {as_class}")));
        let err = segments
            .resolve_struct_virtual_table(Value::Struct(Descriptor::new(m, 7)))
            .expect_err("out of range");
        assert_eq!(err, RuntimeError::invariant("missing struct"));
    }

    #[test]
    fn enum_and_instance_tables_are_cached_per_section() {
        let mut module = ObjectBuilder::new();
        let name = module.add_proc_call("Color.name", &ProcBuilder::new(), CallFlags::BOUND);
        let tag = module.declare(LinkageSection::Field, "Color.tag");
        let mut color = LayoutDescriptor::new("Color");
        color.members.push(Address::near(tag));
        color.methods.push(Address::near(name));
        let color = module.add_enum(color);
        let mut unit = LayoutDescriptor::new("Unit");
        unit.methods.push(Address::near(name));
        let unit = module.add_instance(unit);

        let mut segments = segments_with(vec![("/m", module.build())]);
        let m = segments.get_or_load_segment(&"/m".into()).expect("load");
        let enum_table = segments
            .resolve_enum_virtual_table(Value::Enum(Descriptor::new(m, color)))
            .expect("enum table");
        let instance_table = segments
            .resolve_instance_virtual_table(Value::Instance(Descriptor::new(m, unit)))
            .expect("instance table");

        // both live at index 0 of their section
        assert!(!Arc::ptr_eq(&enum_table, &instance_table));
        assert_eq!(enum_table.get_member(Descriptor::new(m, tag)), Some(0));
        assert_eq!(instance_table.layout_total(), 0);
        assert!(instance_table.get_method(Descriptor::new(m, name)).is_some());

        let again = segments
            .resolve_enum_virtual_table(Value::Enum(Descriptor::new(m, color)))
            .expect("cached");
        assert!(Arc::ptr_eq(&enum_table, &again));
    }

    #[test]
    fn concept_tables_carry_impls_and_super_concept() {
        let mut module = ObjectBuilder::new();
        let show_all = module.add_proc_call("Show.all", &ProcBuilder::new(), CallFlags::BOUND);
        let iterable = module.add_concept(ConceptDescriptor::new("Iterable"));
        let each = module.declare(LinkageSection::Action, "Iterable.each");
        let base = module.add_concept(ConceptDescriptor::new("Display"));
        let mut show = ConceptDescriptor::new("Show");
        show.super_concept = Address::near(base);
        show.impls.push(ImplDescriptor {
            concept: Address::near(iterable),
            extensions: vec![ExtensionDescriptor {
                action: Address::near(each),
                call: Address::near(show_all),
            }],
        });
        let show = module.add_concept(show);

        let mut segments = segments_with(vec![("/m", module.build())]);
        let m = segments.get_or_load_segment(&"/m".into()).expect("load");
        let table = segments
            .resolve_concept_table(Value::Concept(Descriptor::new(m, show)))
            .expect("concept table");
        assert_eq!(table.num_methods(), 0);
        let each = table
            .get_extension(Descriptor::new(m, iterable), Descriptor::new(m, each))
            .expect("extension");
        assert_eq!(each.call_index, show_all);

        let parent = segments
            .resolve_concept_table(Value::Concept(Descriptor::new(m, base)))
            .expect("super concept");
        assert_eq!(parent.descriptor(), Value::Concept(Descriptor::new(m, base)));
        assert!(segments.resolve_concept_table(Value::Nil).is_err());
    }

    #[test]
    fn singletons_load_and_store() {
        let mut lib = ObjectBuilder::new();
        lib.add_instance(LayoutDescriptor::new("Unit"));
        lib.add_enum(LayoutDescriptor::new("Color"));
        let mut main = ObjectBuilder::new();
        let local = main.add_enum(LayoutDescriptor::new("Mode"));
        let far_instance = main.add_link(LinkageSection::Instance, "/lib", "Unit");
        let far_enum = main.add_link(LinkageSection::Enum, "/lib", "Color");

        let mut segments = segments_with(vec![("/main", main.build()), ("/lib", lib.build())]);
        let main = segments.get_or_load_segment(&"/main".into()).expect("main");

        let unset = segments.load_instance(main, far_instance).expect("unset instance");
        assert!(!unset.is_valid());
        segments.store_instance(main, far_instance, Value::I64(7)).expect("store instance");
        segments.store_enum(main, Address::near(local), Value::I64(1)).expect("store enum");
        segments.store_enum(main, far_enum, Value::I64(2)).expect("store far enum");

        assert_eq!(segments.load_instance(main, far_instance), Ok(Value::I64(7)));
        assert_eq!(segments.load_enum(main, Address::near(local)), Ok(Value::I64(1)));
        assert_eq!(segments.load_enum(main, far_enum), Ok(Value::I64(2)));

        let lib = segments.find_segment(&"/lib".into()).expect("lib loaded");
        let stored = segments.get_segment(lib).map(|s| s.stored_value(LinkageSection::Enum, 0));
        assert_eq!(stored, Some(Value::I64(2)));

        assert_eq!(
            segments.load_instance(main, far_enum),
            Err(RuntimeError::invariant("invalid instance linkage"))
        );
        assert_eq!(
            segments.store_enum(main, Address::near(3), Value::Nil),
            Err(RuntimeError::invariant("missing enum symbol"))
        );
    }

    #[test]
    fn singletons_are_roots() {
        let mut module = ObjectBuilder::new();
        let unit = module.add_instance(LayoutDescriptor::new("Unit"));
        module.add_static("counter", Address::INVALID);
        let mut segments = segments_with(vec![("/m", module.build())]);
        let m = segments.get_or_load_segment(&"/m".into()).expect("load");
        segments.store_instance(m, Address::near(unit), Value::I64(3)).expect("store");

        let mut seen = Vec::new();
        segments.visit_roots(&mut |value| seen.push(*value));
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].is_valid());
        assert_eq!(seen[1], Value::I64(3));
    }

    #[test]
    fn loader_failures_propagate() {
        let mut segments = SegmentManager::new(Arc::new(FailingLoader));
        let err = segments.get_or_load_segment(&"/main".into()).expect_err("unreadable");
        assert_eq!(err, RuntimeError::LoaderFailure("cannot read /main".into()));
        assert_eq!(segments.num_segments(), 0);
    }

    #[test]
    fn existential_tables_resolve_methods() {
        let mut module = ObjectBuilder::new();
        let length = module.add_proc_call("String.length", &ProcBuilder::new(), CallFlags::BOUND);
        let ty = module.declare(LinkageSection::Type, "StringType");
        let mut string = existential("String", Address::near(ty));
        string.methods.push(Address::near(length));
        let index = module.add_existential(string);

        let mut segments = segments_with(vec![("/m", module.build())]);
        let m = segments.get_or_load_segment(&"/m".into()).expect("load");
        let table = segments
            .resolve_existential_table(Value::Existential(Descriptor::new(m, index)))
            .expect("table");
        assert_eq!(table.num_methods(), 1);
        assert!(table.get_method(Descriptor::new(m, length)).is_some());
    }
}
