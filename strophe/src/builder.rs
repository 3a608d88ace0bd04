use crate::{
    Address, CallDescriptor, CallFlags, ConceptDescriptor, ExistentialDescriptor,
    ImportDescriptor, LayoutDescriptor, LexicalTarget, LinkDescriptor, LinkageSection,
    ModuleLocation, ModuleObject, ProcLexical, StaticDescriptor, SymbolEntry, SymbolPath,
};

/// Encodes a procedure: header, lexical table and body.
#[derive(Debug, Clone, Default)]
pub struct ProcBuilder {
    num_arguments: u16,
    num_locals: u16,
    lexicals: Vec<ProcLexical>,
    body: Vec<u8>,
}

impl ProcBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn arguments(mut self, n: u16) -> Self {
        self.num_arguments = n;
        self
    }

    #[must_use]
    pub fn locals(mut self, n: u16) -> Self {
        self.num_locals = n;
        self
    }

    #[must_use]
    pub fn lexical(
        mut self,
        activation_call: u32,
        target_offset: u32,
        target: LexicalTarget,
    ) -> Self {
        self.lexicals.push(ProcLexical { activation_call, target_offset, target });
        self
    }

    #[must_use]
    pub fn body(mut self, bytes: &[u8]) -> Self {
        self.body.extend_from_slice(bytes);
        self
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let proc_size = 6 + 9 * self.lexicals.len() + self.body.len();
        let mut buf = Vec::with_capacity(4 + proc_size);
        buf.extend_from_slice(&(proc_size as u32).to_be_bytes());
        buf.extend_from_slice(&self.num_arguments.to_be_bytes());
        buf.extend_from_slice(&self.num_locals.to_be_bytes());
        buf.extend_from_slice(&(self.lexicals.len() as u16).to_be_bytes());
        for lexical in &self.lexicals {
            buf.extend_from_slice(&lexical.activation_call.to_be_bytes());
            buf.extend_from_slice(&lexical.target_offset.to_be_bytes());
            buf.push(lexical.target as u8);
        }
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Assembles an in-memory [`ModuleObject`].
///
/// Every `add_*` returns the near index (or link offset) of the new entry.
#[derive(Debug, Default)]
pub struct ObjectBuilder {
    object: ModuleObject,
}

impl ObjectBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn define(&mut self, symbol: &SymbolPath, section: LinkageSection, index: u32) {
        if symbol.is_valid() {
            self.object.symbols.insert(symbol.clone(), SymbolEntry { section, index });
        }
    }

    /// Appends raw bytes to the bytecode, returning their offset.
    pub fn append_bytecode(&mut self, bytes: &[u8]) -> u32 {
        let offset = self.object.bytecode.len() as u32;
        self.object.bytecode.extend_from_slice(bytes);
        offset
    }

    pub fn add_proc(&mut self, proc: &ProcBuilder) -> u32 {
        self.append_bytecode(&proc.encode())
    }

    pub fn add_call(
        &mut self,
        symbol: impl Into<SymbolPath>,
        proc_offset: u32,
        flags: CallFlags,
    ) -> u32 {
        let symbol = symbol.into();
        let index = self.object.calls.len() as u32;
        self.define(&symbol, LinkageSection::Call, index);
        self.object.calls.push(CallDescriptor { symbol, proc_offset, flags });
        index
    }

    /// Adds a procedure together with the call descriptor pointing at it.
    pub fn add_proc_call(
        &mut self,
        symbol: impl Into<SymbolPath>,
        proc: &ProcBuilder,
        flags: CallFlags,
    ) -> u32 {
        let offset = self.add_proc(proc);
        self.add_call(symbol, offset, flags)
    }

    pub fn add_static(&mut self, symbol: impl Into<SymbolPath>, initializer: Address) -> u32 {
        let symbol = symbol.into();
        let index = self.object.statics.len() as u32;
        self.define(&symbol, LinkageSection::Static, index);
        self.object.statics.push(StaticDescriptor { symbol, initializer });
        index
    }

    pub fn add_import(
        &mut self,
        location: impl Into<ModuleLocation>,
        system_bootstrap: bool,
    ) -> u32 {
        let index = self.object.imports.len() as u32;
        self.object
            .imports
            .push(ImportDescriptor { location: location.into(), system_bootstrap });
        index
    }

    /// Returns the far address of the new link.
    pub fn add_link(
        &mut self,
        section: LinkageSection,
        location: impl Into<ModuleLocation>,
        symbol: impl Into<SymbolPath>,
    ) -> Address {
        let offset = self.object.links.len() as u32;
        self.object.links.push(LinkDescriptor {
            section,
            location: location.into(),
            symbol: symbol.into(),
        });
        Address::far(offset)
    }

    pub fn add_existential(&mut self, existential: ExistentialDescriptor) -> u32 {
        let index = self.object.existentials.len() as u32;
        self.define(&existential.symbol, LinkageSection::Existential, index);
        self.object.existentials.push(existential);
        index
    }

    fn push_layout(&mut self, section: LinkageSection, layout: LayoutDescriptor) -> u32 {
        let layouts = match section {
            LinkageSection::Enum => &mut self.object.enums,
            LinkageSection::Instance => &mut self.object.instances,
            LinkageSection::Struct => &mut self.object.structs,
            _ => &mut self.object.classes,
        };
        let index = layouts.len() as u32;
        let symbol = layout.symbol.clone();
        layouts.push(layout);
        self.define(&symbol, section, index);
        index
    }

    pub fn add_class(&mut self, class: LayoutDescriptor) -> u32 {
        self.push_layout(LinkageSection::Class, class)
    }

    pub fn add_enum(&mut self, layout: LayoutDescriptor) -> u32 {
        self.push_layout(LinkageSection::Enum, layout)
    }

    pub fn add_instance(&mut self, layout: LayoutDescriptor) -> u32 {
        self.push_layout(LinkageSection::Instance, layout)
    }

    pub fn add_struct(&mut self, layout: LayoutDescriptor) -> u32 {
        self.push_layout(LinkageSection::Struct, layout)
    }

    pub fn add_concept(&mut self, concept: ConceptDescriptor) -> u32 {
        let index = self.object.concepts.len() as u32;
        self.define(&concept.symbol, LinkageSection::Concept, index);
        self.object.concepts.push(concept);
        index
    }

    /// Declares a descriptor in a section whose payload the engine does not
    /// read (types, fields, actions, ...).
    pub fn declare(&mut self, section: LinkageSection, symbol: impl Into<SymbolPath>) -> u32 {
        debug_assert!(!matches!(
            section,
            LinkageSection::Call
                | LinkageSection::Static
                | LinkageSection::Existential
                | LinkageSection::Class
                | LinkageSection::Enum
                | LinkageSection::Instance
                | LinkageSection::Struct
                | LinkageSection::Concept
        ));
        let count = self.object.declared.entry(section).or_insert(0);
        let index = *count;
        *count += 1;
        self.define(&symbol.into(), section, index);
        index
    }

    #[must_use]
    pub fn build(self) -> ModuleObject {
        self.object
    }
}
