//! In-memory modules shared by the unit tests.

use std::sync::Arc;

use crate::{
    Address, ExistentialDescriptor, IntrinsicType, LinkageSection, MemoryLoader, ModuleLoader,
    ModuleLocation, ModuleObject, ObjectBuilder, Result, RuntimeError, SegmentManager,
};

pub(crate) const PRELUDE: &str = "/prelude";
pub(crate) const MAIN: &str = "/app/main";

pub(crate) fn existential(name: &str, existential_type: Address) -> ExistentialDescriptor {
    ExistentialDescriptor {
        symbol: name.into(),
        intrinsic: None,
        existential_type,
        super_existential: Address::INVALID,
        methods: Vec::new(),
        impls: Vec::new(),
    }
}

/// A prelude declaring the fundamental existentials.
pub(crate) fn prelude_builder() -> ObjectBuilder {
    let mut builder = ObjectBuilder::new();
    for (name, intrinsic) in [
        ("Bool", IntrinsicType::Bool),
        ("Int", IntrinsicType::Int),
        ("Float", IntrinsicType::Float),
        ("Char", IntrinsicType::Char),
        ("Bytes", IntrinsicType::Bytes),
        ("Rest", IntrinsicType::Rest),
        ("String", IntrinsicType::String),
        ("Url", IntrinsicType::Url),
    ] {
        let ty = builder.declare(LinkageSection::Type, format!("{name}Type").as_str());
        let mut descriptor = existential(name, Address::near(ty));
        descriptor.intrinsic = Some(intrinsic);
        builder.add_existential(descriptor);
    }
    builder
}

pub(crate) fn loader_with(modules: Vec<(&str, ModuleObject)>) -> Arc<MemoryLoader> {
    let loader = MemoryLoader::new();
    for (location, object) in modules {
        loader.insert(location, object);
    }
    Arc::new(loader)
}

pub(crate) fn segments_with(modules: Vec<(&str, ModuleObject)>) -> SegmentManager {
    SegmentManager::new(loader_with(modules))
}

/// Loader whose backing store is unreadable.
#[derive(Debug)]
pub(crate) struct FailingLoader;

impl ModuleLoader for FailingLoader {
    fn load_module(&self, location: &ModuleLocation) -> Result<Option<Arc<ModuleObject>>> {
        Err(RuntimeError::LoaderFailure(format!("cannot read {location}")))
    }
}
