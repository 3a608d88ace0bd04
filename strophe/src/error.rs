use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Failures surfaced by the execution engine.
///
/// Program completion is not an error, see [`crate::ReturnOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// Malformed or inconsistent bytecode/descriptor state.
    #[error("runtime invariant violated: {0}")]
    RuntimeInvariant(String),

    #[error("missing object {0}")]
    MissingObject(String),

    #[error("missing symbol {0}")]
    MissingSymbol(String),

    #[error("module loader failed: {0}")]
    LoaderFailure(String),
}

impl RuntimeError {
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::RuntimeInvariant(message.into())
    }

    /// The message without the category prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::RuntimeInvariant(m)
            | Self::MissingObject(m)
            | Self::MissingSymbol(m)
            | Self::LoaderFailure(m) => m,
        }
    }

    #[must_use]
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::RuntimeInvariant(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_category() {
        let err = RuntimeError::invariant("missing lexical");
        assert_eq!(err.to_string(), "runtime invariant violated: missing lexical");
        assert_eq!(err.message(), "missing lexical");
        assert!(err.is_invariant());

        let err = RuntimeError::MissingObject("/app/main".into());
        assert_eq!(err.to_string(), "missing object /app/main");
        assert!(!err.is_invariant());
    }
}
