use std::fmt;

use ahash::AHashMap;
use bitflags::bitflags;

use crate::{IntrinsicType, ModuleLocation, SymbolPath};

/// Descriptor reference as it appears in bytecode and descriptor tables.
///
/// High bit clear: near, an index into the current segment's own table.
/// High bit set: far, an offset into the segment's link table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(u32);

impl Address {
    pub const INVALID: Address = Address(u32::MAX);
    const FAR_BIT: u32 = 0x8000_0000;

    #[must_use]
    pub const fn near(index: u32) -> Self {
        Address(index & !Self::FAR_BIT)
    }

    #[must_use]
    pub const fn far(link_offset: u32) -> Self {
        Address(link_offset | Self::FAR_BIT)
    }

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Address(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    #[inline]
    #[must_use]
    pub const fn is_near(self) -> bool {
        self.is_valid() && self.0 & Self::FAR_BIT == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_far(self) -> bool {
        self.is_valid() && self.0 & Self::FAR_BIT != 0
    }

    /// Descriptor index for near addresses, link offset for far ones.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u32 {
        self.0 & !Self::FAR_BIT
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            f.write_str("invalid")
        } else if self.is_near() {
            write!(f, "near:{}", self.offset())
        } else {
            write!(f, "far:{}", self.offset())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkageSection {
    Type,
    Existential,
    Call,
    Field,
    Action,
    Concept,
    Class,
    Struct,
    Instance,
    Enum,
    Static,
    Namespace,
}

impl fmt::Display for LinkageSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkageSection::Type => "TYPE",
            LinkageSection::Existential => "EXISTENTIAL",
            LinkageSection::Call => "CALL",
            LinkageSection::Field => "FIELD",
            LinkageSection::Action => "ACTION",
            LinkageSection::Concept => "CONCEPT",
            LinkageSection::Class => "CLASS",
            LinkageSection::Struct => "STRUCT",
            LinkageSection::Instance => "INSTANCE",
            LinkageSection::Enum => "ENUM",
            LinkageSection::Static => "STATIC",
            LinkageSection::Namespace => "NAMESPACE",
        };
        f.write_str(name)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CallFlags: u8 {
        /// Takes a receiver.
        const BOUND = 1 << 0;
        const CONSTRUCTOR = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor {
    pub symbol: SymbolPath,
    pub proc_offset: u32,
    pub flags: CallFlags,
}

impl CallDescriptor {
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.flags.contains(CallFlags::BOUND)
    }

    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.flags.contains(CallFlags::CONSTRUCTOR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticDescriptor {
    pub symbol: SymbolPath,
    /// Near call address of the initializer procedure.
    pub initializer: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDescriptor {
    pub location: ModuleLocation,
    pub system_bootstrap: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDescriptor {
    pub section: LinkageSection,
    pub location: ModuleLocation,
    pub symbol: SymbolPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionDescriptor {
    pub action: Address,
    pub call: Address,
}

/// Implementation of a concept by a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplDescriptor {
    pub concept: Address,
    pub extensions: Vec<ExtensionDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistentialDescriptor {
    pub symbol: SymbolPath,
    pub intrinsic: Option<IntrinsicType>,
    /// Type address, may be invalid for intrinsic markers that were never typed.
    pub existential_type: Address,
    pub super_existential: Address,
    pub methods: Vec<Address>,
    pub impls: Vec<ImplDescriptor>,
}

/// Shape shared by classes, enums, instances and structs.
///
/// `members` are field addresses; a member's layout slot is its position
/// after the slots of the super type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutDescriptor {
    pub symbol: SymbolPath,
    pub super_type: Address,
    pub members: Vec<Address>,
    pub methods: Vec<Address>,
    pub impls: Vec<ImplDescriptor>,
}

impl LayoutDescriptor {
    #[must_use]
    pub fn new(symbol: impl Into<SymbolPath>) -> Self {
        Self {
            symbol: symbol.into(),
            super_type: Address::INVALID,
            members: Vec::new(),
            methods: Vec::new(),
            impls: Vec::new(),
        }
    }
}

pub type ClassDescriptor = LayoutDescriptor;
pub type EnumDescriptor = LayoutDescriptor;
pub type InstanceDescriptor = LayoutDescriptor;
pub type StructDescriptor = LayoutDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptDescriptor {
    pub symbol: SymbolPath,
    pub super_concept: Address,
    pub impls: Vec<ImplDescriptor>,
}

impl ConceptDescriptor {
    #[must_use]
    pub fn new(symbol: impl Into<SymbolPath>) -> Self {
        Self { symbol: symbol.into(), super_concept: Address::INVALID, impls: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolEntry {
    pub section: LinkageSection,
    pub index: u32,
}

/// An assembled module as handed over by the module loader. Immutable once
/// loaded.
#[derive(Debug, Default)]
pub struct ModuleObject {
    pub(crate) bytecode: Vec<u8>,
    pub(crate) calls: Vec<CallDescriptor>,
    pub(crate) statics: Vec<StaticDescriptor>,
    pub(crate) imports: Vec<ImportDescriptor>,
    pub(crate) links: Vec<LinkDescriptor>,
    pub(crate) existentials: Vec<ExistentialDescriptor>,
    pub(crate) classes: Vec<ClassDescriptor>,
    pub(crate) enums: Vec<EnumDescriptor>,
    pub(crate) instances: Vec<InstanceDescriptor>,
    pub(crate) structs: Vec<StructDescriptor>,
    pub(crate) concepts: Vec<ConceptDescriptor>,
    // sections that carry no payload the engine needs, only a count
    pub(crate) declared: AHashMap<LinkageSection, u32>,
    pub(crate) symbols: AHashMap<SymbolPath, SymbolEntry>,
}

impl ModuleObject {
    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[must_use]
    pub fn call(&self, index: u32) -> Option<&CallDescriptor> {
        self.calls.get(index as usize)
    }

    #[must_use]
    pub fn static_descriptor(&self, index: u32) -> Option<&StaticDescriptor> {
        self.statics.get(index as usize)
    }

    #[must_use]
    pub fn imports(&self) -> &[ImportDescriptor] {
        &self.imports
    }

    #[must_use]
    pub fn link(&self, offset: u32) -> Option<&LinkDescriptor> {
        self.links.get(offset as usize)
    }

    #[must_use]
    pub fn num_links(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn existential(&self, index: u32) -> Option<&ExistentialDescriptor> {
        self.existentials.get(index as usize)
    }

    #[must_use]
    pub fn existentials(&self) -> &[ExistentialDescriptor] {
        &self.existentials
    }

    #[must_use]
    pub fn class(&self, index: u32) -> Option<&ClassDescriptor> {
        self.classes.get(index as usize)
    }

    /// Layout of a class, enum, instance or struct descriptor.
    #[must_use]
    pub fn layout(&self, section: LinkageSection, index: u32) -> Option<&LayoutDescriptor> {
        let layouts = match section {
            LinkageSection::Class => &self.classes,
            LinkageSection::Enum => &self.enums,
            LinkageSection::Instance => &self.instances,
            LinkageSection::Struct => &self.structs,
            _ => return None,
        };
        layouts.get(index as usize)
    }

    #[must_use]
    pub fn concept(&self, index: u32) -> Option<&ConceptDescriptor> {
        self.concepts.get(index as usize)
    }

    #[must_use]
    pub fn find_symbol(&self, path: &SymbolPath) -> Option<SymbolEntry> {
        self.symbols.get(path).copied()
    }

    #[must_use]
    pub fn num_descriptors(&self, section: LinkageSection) -> u32 {
        let len = match section {
            LinkageSection::Call => self.calls.len(),
            LinkageSection::Static => self.statics.len(),
            LinkageSection::Existential => self.existentials.len(),
            LinkageSection::Class => self.classes.len(),
            LinkageSection::Enum => self.enums.len(),
            LinkageSection::Instance => self.instances.len(),
            LinkageSection::Struct => self.structs.len(),
            LinkageSection::Concept => self.concepts.len(),
            other => return self.declared.get(&other).copied().unwrap_or(0),
        };
        len as u32
    }
}
