use std::fmt;

/// Location of a module, either absolute (`/path` or `scheme://...`) or
/// relative to the origin of the resolver loading it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleLocation(String);

impl ModuleLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }

    #[must_use]
    pub fn is_absolute(&self) -> bool {
        self.0.starts_with('/') || self.scheme().is_some()
    }

    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        let (scheme, _) = self.0.split_once("://")?;
        let well_formed = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        well_formed.then_some(scheme)
    }

    /// The location with its last path component removed.
    #[must_use]
    pub fn parent(&self) -> ModuleLocation {
        let path_start = self.0.find("://").map_or(0, |at| at + 3);
        match self.0[path_start..].rfind('/') {
            Some(at) => ModuleLocation(self.0[..path_start + at].to_owned()),
            None => self.clone(),
        }
    }

    /// Resolves `self` against `origin`. Absolute locations are returned as is.
    #[must_use]
    pub fn resolve(&self, origin: &ModuleLocation) -> ModuleLocation {
        if self.is_absolute() || !origin.is_valid() {
            return self.clone();
        }
        let base = origin.0.trim_end_matches('/');
        let path = self.0.trim_start_matches("./");
        ModuleLocation(format!("{base}/{path}"))
    }
}

impl fmt::Display for ModuleLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleLocation {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Dotted symbol path inside a module, e.g. `Foo.bar`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolPath(Vec<String>);

pub const ENTRY_SYMBOL: &str = "$entry";

impl SymbolPath {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn parse(path: &str) -> Self {
        Self::new(path.split('.').filter(|p| !p.is_empty()))
    }

    #[must_use]
    pub fn entry() -> Self {
        Self::new([ENTRY_SYMBOL])
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for SymbolPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for SymbolPath {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_locations() {
        assert!(ModuleLocation::new("/app/main").is_absolute());
        assert!(ModuleLocation::new("dev.zuri.pkg://std-0.0.1/prelude").is_absolute());
        assert!(!ModuleLocation::new("lib/util").is_absolute());
        assert!(!ModuleLocation::new("").is_valid());
        assert_eq!(ModuleLocation::new("://x").scheme(), None);
    }

    #[test]
    fn relative_locations_resolve_against_origin() {
        let origin = ModuleLocation::new("/app/");
        assert_eq!(ModuleLocation::new("./lib/util").resolve(&origin).as_str(), "/app/lib/util");
        assert_eq!(ModuleLocation::new("/abs").resolve(&origin).as_str(), "/abs");
        assert_eq!(ModuleLocation::new("/app/main").parent().as_str(), "/app");
        assert_eq!(ModuleLocation::new("dev.zuri://pkg/main").parent().as_str(), "dev.zuri://pkg");
    }

    #[test]
    fn symbol_paths() {
        let path = SymbolPath::parse("Foo.bar");
        assert_eq!(path.parts().len(), 2);
        assert_eq!(path.name(), Some("bar"));
        assert_eq!(path.to_string(), "Foo.bar");
        assert_eq!(SymbolPath::entry().to_string(), ENTRY_SYMBOL);
        assert!(!SymbolPath::parse("").is_valid());
    }
}
