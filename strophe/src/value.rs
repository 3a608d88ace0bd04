use std::fmt;

use crate::{HeapRef, LinkageSection};

/// Identifies a statically resolved entity inside a loaded segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor {
    pub segment: u32,
    pub index: u32,
}

impl Descriptor {
    #[must_use]
    pub const fn new(segment: u32, index: u32) -> Self {
        Self { segment, index }
    }
}

/// A runtime value cell.
///
/// Heap variants hold a non-owning [`HeapRef`]; copying a value copies the
/// handle, the heap decides when the referent dies.
#[derive(Debug, Clone, Copy, Default)]
pub enum Value {
    #[default]
    Invalid,
    Nil,
    Undef,
    Bool(bool),
    I64(i64),
    F64(f64),
    Char(char),
    String(HeapRef),
    Url(HeapRef),
    Bytes(HeapRef),
    Rest(HeapRef),
    Ref(HeapRef),
    Type(Descriptor),
    Class(Descriptor),
    Struct(Descriptor),
    Instance(Descriptor),
    Concept(Descriptor),
    Enum(Descriptor),
    Field(Descriptor),
    Call(Descriptor),
    Action(Descriptor),
    Existential(Descriptor),
    Namespace(Descriptor),
}

impl Value {
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !matches!(self, Value::Invalid)
    }

    /// Builds the descriptor value for `section`, `None` for sections that
    /// have no value form (statics).
    #[must_use]
    pub fn from_descriptor(section: LinkageSection, descriptor: Descriptor) -> Option<Self> {
        let value = match section {
            LinkageSection::Type => Value::Type(descriptor),
            LinkageSection::Class => Value::Class(descriptor),
            LinkageSection::Struct => Value::Struct(descriptor),
            LinkageSection::Instance => Value::Instance(descriptor),
            LinkageSection::Concept => Value::Concept(descriptor),
            LinkageSection::Enum => Value::Enum(descriptor),
            LinkageSection::Field => Value::Field(descriptor),
            LinkageSection::Call => Value::Call(descriptor),
            LinkageSection::Action => Value::Action(descriptor),
            LinkageSection::Existential => Value::Existential(descriptor),
            LinkageSection::Namespace => Value::Namespace(descriptor),
            LinkageSection::Static => return None,
        };
        Some(value)
    }

    #[must_use]
    pub fn descriptor(&self) -> Option<Descriptor> {
        match *self {
            Value::Type(d)
            | Value::Class(d)
            | Value::Struct(d)
            | Value::Instance(d)
            | Value::Concept(d)
            | Value::Enum(d)
            | Value::Field(d)
            | Value::Call(d)
            | Value::Action(d)
            | Value::Existential(d)
            | Value::Namespace(d) => Some(d),
            _ => None,
        }
    }

    #[must_use]
    pub fn section(&self) -> Option<LinkageSection> {
        let section = match self {
            Value::Type(_) => LinkageSection::Type,
            Value::Class(_) => LinkageSection::Class,
            Value::Struct(_) => LinkageSection::Struct,
            Value::Instance(_) => LinkageSection::Instance,
            Value::Concept(_) => LinkageSection::Concept,
            Value::Enum(_) => LinkageSection::Enum,
            Value::Field(_) => LinkageSection::Field,
            Value::Call(_) => LinkageSection::Call,
            Value::Action(_) => LinkageSection::Action,
            Value::Existential(_) => LinkageSection::Existential,
            Value::Namespace(_) => LinkageSection::Namespace,
            _ => return None,
        };
        Some(section)
    }

    #[must_use]
    pub fn heap_ref(&self) -> Option<HeapRef> {
        match *self {
            Value::String(r) | Value::Url(r) | Value::Bytes(r) | Value::Rest(r) | Value::Ref(r) => {
                Some(r)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I64(i) => Some(i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Invalid => "invalid",
            Value::Nil => "nil",
            Value::Undef => "undef",
            Value::Bool(_) => "bool",
            Value::I64(_) => "i64",
            Value::F64(_) => "f64",
            Value::Char(_) => "char",
            Value::String(_) => "string",
            Value::Url(_) => "url",
            Value::Bytes(_) => "bytes",
            Value::Rest(_) => "rest",
            Value::Ref(_) => "ref",
            Value::Type(_) => "type",
            Value::Class(_) => "class",
            Value::Struct(_) => "struct",
            Value::Instance(_) => "instance",
            Value::Concept(_) => "concept",
            Value::Enum(_) => "enum",
            Value::Field(_) => "field",
            Value::Call(_) => "call",
            Value::Action(_) => "action",
            Value::Existential(_) => "existential",
            Value::Namespace(_) => "namespace",
        }
    }
}

// Invalid never equals anything, itself included.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Nil, Nil) | (Undef, Undef) => true,
            (Bool(a), Bool(b)) => a == b,
            (I64(a), I64(b)) => a == b,
            (F64(a), F64(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (String(a), String(b))
            | (Url(a), Url(b))
            | (Bytes(a), Bytes(b))
            | (Rest(a), Rest(b))
            | (Ref(a), Ref(b)) => a == b,
            (a, b) => match (a.descriptor(), b.descriptor()) {
                (Some(x), Some(y)) => a.section() == b.section() && x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Invalid => f.write_str("<INVALID>"),
            Value::Nil => f.write_str("Nil"),
            Value::Undef => f.write_str("Undef"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::I64(i) => write!(f, "{i}"),
            Value::F64(d) => write!(f, "{d}"),
            Value::Char(c) => write!(f, "{c:?}"),
            Value::String(r)
            | Value::Url(r)
            | Value::Bytes(r)
            | Value::Rest(r)
            | Value::Ref(r) => write!(f, "<{} {r}>", self.type_name()),
            _ => match self.descriptor() {
                Some(d) => write!(f, "<segment={}, {}={}>", d.segment, self.type_name(), d.index),
                None => f.write_str("<INVALID>"),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::F64(value)
    }
}

impl From<char> for Value {
    fn from(value: char) -> Self {
        Value::Char(value)
    }
}
