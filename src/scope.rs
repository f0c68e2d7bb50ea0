//! Hierarchical scopes bounding the lifetime of shared resources.
//!
//! A scope is a dot-separated path from the root (`""`). Resources are
//! registered under a scope and torn down together when that scope or
//! any of its ancestors is closed.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::ipc::codec::Value;
use crate::resolver::Properties;

/// Property carrying the scope of a resolution request.
pub const PROPERTY_KEY: &str = "test-resources.scope";

/// Scope construction errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("scope segment must not be empty")]
    EmptySegment,
    #[error("scope segment {0:?} must not contain '.'")]
    DottedSegment(String),
}

/// An immutable node in the scope tree.
///
/// Equality and hashing are structural: two scopes are equal iff their
/// paths from the root are equal.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    segments: Arc<[String]>,
}

impl Scope {
    /// The root scope. Includes every other scope.
    pub fn root() -> Self {
        Self::default()
    }

    /// Derive a child scope named `id`.
    pub fn child(&self, id: &str) -> Result<Self, ScopeError> {
        if id.is_empty() {
            return Err(ScopeError::EmptySegment);
        }
        if id.contains('.') {
            return Err(ScopeError::DottedSegment(id.to_string()));
        }
        let mut segments = self.segments.to_vec();
        segments.push(id.to_string());
        Ok(Self {
            segments: segments.into(),
        })
    }

    /// Parse a dot-separated path. Empty input (and empty segments) map
    /// to the root.
    pub fn parse(path: &str) -> Self {
        let segments: Vec<String> = path
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            segments: segments.into(),
        }
    }

    /// Read the scope from a property map, defaulting to the root.
    pub fn from_properties(properties: &Properties) -> Self {
        match properties.get(PROPERTY_KEY) {
            Some(Value::String(path)) => Self::parse(path),
            Some(Value::Null) | None => Self::root(),
            Some(other) => Self::parse(&other.to_string()),
        }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The parent scope, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        let (_, parent) = self.segments.split_last()?;
        Some(Self {
            segments: parent.to_vec().into(),
        })
    }

    /// Last path segment, `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Whether `self` is `other` or one of its ancestors.
    pub fn includes(&self, other: &Scope) -> bool {
        other.segments.starts_with(&self.segments)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({:?})", self.to_string())
    }
}

impl FromStr for Scope {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}
