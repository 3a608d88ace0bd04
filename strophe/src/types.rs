use std::fmt;

use crate::{Descriptor, LinkageSection, Result, RuntimeError, SegmentManager, Value};

/// Types the engine knows natively; the prelude tags the existentials that
/// implement them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntrinsicType {
    Nil,
    Undef,
    Bool,
    Char,
    Int,
    Float,
    String,
    Url,
    Bytes,
    Rest,
    Class,
    Concept,
    Call,
    Action,
    Existential,
    Namespace,
}

impl IntrinsicType {
    pub const COUNT: usize = 16;

    #[must_use]
    pub fn of(value: &Value) -> Option<Self> {
        let ty = match value {
            Value::Nil => IntrinsicType::Nil,
            Value::Undef => IntrinsicType::Undef,
            Value::Bool(_) => IntrinsicType::Bool,
            Value::Char(_) => IntrinsicType::Char,
            Value::I64(_) => IntrinsicType::Int,
            Value::F64(_) => IntrinsicType::Float,
            Value::String(_) => IntrinsicType::String,
            Value::Url(_) => IntrinsicType::Url,
            Value::Bytes(_) => IntrinsicType::Bytes,
            Value::Rest(_) => IntrinsicType::Rest,
            Value::Class(_) => IntrinsicType::Class,
            Value::Concept(_) => IntrinsicType::Concept,
            Value::Call(_) => IntrinsicType::Call,
            Value::Action(_) => IntrinsicType::Action,
            Value::Existential(_) => IntrinsicType::Existential,
            Value::Namespace(_) => IntrinsicType::Namespace,
            _ => return None,
        };
        Some(ty)
    }
}

/// Exit status recorded by `halt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StatusCode {
    Ok,
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unimplemented,
    Internal,
    Unavailable,
    #[default]
    Unknown,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Cache of intrinsic type descriptors, built once from the prelude.
#[derive(Debug)]
pub struct TypeManager {
    intrinsics: [Value; IntrinsicType::COUNT],
}

impl TypeManager {
    pub fn create(segments: &mut SegmentManager, prelude: u32) -> Result<Self> {
        let object = segments
            .get_segment(prelude)
            .map(|segment| segment.object().clone())
            .ok_or_else(|| RuntimeError::invariant("invalid prelude segment"))?;

        let mut intrinsics = [Value::Invalid; IntrinsicType::COUNT];
        for existential in object.existentials() {
            let Some(intrinsic) = existential.intrinsic else {
                continue;
            };
            let slot = &mut intrinsics[intrinsic as usize];
            if slot.is_valid() {
                return Err(RuntimeError::invariant("duplicate intrinsic mapping detected"));
            }
            if !existential.existential_type.is_valid() {
                return Err(RuntimeError::invariant("invalid intrinsic mapping detected"));
            }
            *slot = segments.resolve_descriptor(
                prelude,
                LinkageSection::Type,
                existential.existential_type,
            )?;
            log::debug!("intrinsic {intrinsic:?} mapped to {slot}");
        }
        Ok(Self { intrinsics })
    }

    /// Type descriptor of `ty`, [`Value::Invalid`] when the prelude has none.
    #[must_use]
    pub fn intrinsic(&self, ty: IntrinsicType) -> Value {
        self.intrinsics[ty as usize]
    }

    #[must_use]
    pub fn type_of(&self, value: &Value) -> Value {
        IntrinsicType::of(value).map_or(Value::Invalid, |ty| self.intrinsic(ty))
    }

    #[must_use]
    pub fn type_descriptor(&self, ty: IntrinsicType) -> Option<Descriptor> {
        self.intrinsic(ty).descriptor()
    }
}
