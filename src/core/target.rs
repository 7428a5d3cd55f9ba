//! Target identity: stable labels, kinds, and language tags

use super::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable target label of the form `//path/segment:name`.
///
/// Identity is the label string; two ids are equal exactly when their
/// strings are equal. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(String);

impl TargetId {
    /// Parse a label, validating the `//path:name` shape.
    pub fn parse(label: &str) -> super::Result<Self> {
        let rest = label
            .strip_prefix("//")
            .ok_or_else(|| CoreError::InvalidTargetId(label.to_string()))?;

        let (package, name) = rest
            .rsplit_once(':')
            .ok_or_else(|| CoreError::InvalidTargetId(label.to_string()))?;

        if name.is_empty() || name.contains('/') || package.contains(':') {
            return Err(CoreError::InvalidTargetId(label.to_string()));
        }

        Ok(TargetId(label.to_string()))
    }

    /// Construct from a package path and a target name.
    pub fn new(package: &str, name: &str) -> Self {
        let package = package.trim_matches('/');
        TargetId(format!("//{}:{}", package, name))
    }

    /// The package path segment (between `//` and `:`).
    pub fn package(&self) -> &str {
        let rest = &self.0[2..];
        match rest.rsplit_once(':') {
            Some((package, _)) => package,
            None => rest,
        }
    }

    /// The target name (after `:`).
    pub fn name(&self) -> &str {
        match self.0.rsplit_once(':') {
            Some((_, name)) => name,
            None => &self.0,
        }
    }

    /// The full label string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classification of what a target produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    /// A runnable program
    Executable,
    /// A linkable library
    Library,
    /// A test suite
    Test,
    /// Anything driven by a custom handler
    Custom,
}

impl TargetKind {
    /// Parse from a lowercase kind string.
    pub fn parse(s: &str) -> super::Result<Self> {
        match s {
            "executable" | "binary" => Ok(TargetKind::Executable),
            "library" => Ok(TargetKind::Library),
            "test" => Ok(TargetKind::Test),
            "custom" => Ok(TargetKind::Custom),
            other => Err(CoreError::UnknownTargetKind(other.to_string())),
        }
    }

    /// Stable lowercase name, used in cache keys and query output.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Executable => "executable",
            TargetKind::Library => "library",
            TargetKind::Test => "test",
            TargetKind::Custom => "custom",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form language tag (e.g. `python`, `cpp`), normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Language(String);

impl Language {
    /// Create a tag, lowercasing the input.
    pub fn new(tag: &str) -> Self {
        Language(tag.to_ascii_lowercase())
    }

    /// The tag string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
