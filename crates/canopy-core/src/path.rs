//! Typed path primitives.
//!
//! A [`PathComponent`] is a single directory-entry name; a [`RelativePath`]
//! is a `/`-joined sequence of components rooted at the mount. Keeping these
//! as distinct types (rather than bare strings) lets the entry maps sort the
//! same way source-control trees do and keeps separators out of names.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path component")]
    Empty,
    #[error("path component may not contain '/': {0:?}")]
    Separator(String),
    #[error("reserved path component: {0:?}")]
    Reserved(String),
}

/// A single, validated directory-entry name.
///
/// Ordering is plain byte ordering, identical to the ordering of
/// source-control tree entries.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathComponent(String);

impl PathComponent {
    pub fn new(name: impl Into<String>) -> Result<Self, PathError> {
        let name = name.into();
        if name.is_empty() {
            return Err(PathError::Empty);
        }
        if name.contains('/') {
            return Err(PathError::Separator(name));
        }
        if name == "." || name == ".." {
            return Err(PathError::Reserved(name));
        }
        Ok(PathComponent(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PathComponent {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PathComponent::new(s)
    }
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl Serialize for PathComponent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PathComponent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PathComponent::new(s).map_err(serde::de::Error::custom)
    }
}

/// A mount-relative path. The empty path names the mount root.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RelativePath(String);

impl RelativePath {
    pub fn root() -> Self {
        RelativePath(String::new())
    }

    /// Parse a `/`-separated path, validating every component.
    pub fn parse(s: &str) -> Result<Self, PathError> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        for part in s.split('/') {
            PathComponent::new(part)?;
        }
        Ok(RelativePath(s.to_string()))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn join(&self, name: &PathComponent) -> RelativePath {
        if self.0.is_empty() {
            RelativePath(name.as_str().to_string())
        } else {
            RelativePath(format!("{}/{}", self.0, name.as_str()))
        }
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// The final component, if any.
    pub fn basename(&self) -> Option<&str> {
        self.components().last()
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl FromStr for RelativePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RelativePath::parse(s)
    }
}
