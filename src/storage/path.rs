use std::fmt;
use std::str::FromStr;

use crate::limits::MAX_PATH_DEPTH;

use super::StorageError;

/// Hierarchical storage address such as `reservations/42`.
/// The empty path addresses the root of the tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPath {
    segments: Vec<String>,
}

impl KeyPath {
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let segments: Vec<String> = raw
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if segments.len() > MAX_PATH_DEPTH {
            return Err(StorageError::InvalidPath(format!("path too deep: {raw}")));
        }
        if segments.iter().any(|s| s == "." || s == "..") {
            return Err(StorageError::InvalidPath(format!("relative segment in path: {raw}")));
        }
        Ok(Self { segments })
    }

    pub fn child(&self, segment: impl fmt::Display) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if `self` equals `other` or is one of its ancestors.
    pub fn is_prefix_of(&self, other: &KeyPath) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// True if a change at one path changes the value visible at the other.
    pub fn is_related(&self, other: &KeyPath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl FromStr for KeyPath {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
