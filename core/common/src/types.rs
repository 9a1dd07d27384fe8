//! Common types used throughout SnapMatch.

use serde::{Deserialize, Serialize};
use std::fmt;

fn validate_segment(segment: &str, what: &str) -> crate::Result<()> {
    if segment.is_empty() {
        return Err(crate::Error::InvalidInput(format!("{} cannot be empty", what)));
    }
    if segment.contains('/') || segment.contains('\\') {
        return Err(crate::Error::InvalidInput(format!(
            "{} cannot contain separators: {}",
            what, segment
        )));
    }
    if segment == "." || segment == ".." {
        return Err(crate::Error::InvalidInput(format!(
            "{} cannot be a relative reference: {}",
            what, segment
        )));
    }
    Ok(())
}

/// Identifier of an event (one photo collection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    /// Create a new EventId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or would escape its path segment
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        validate_segment(&id, "EventId")?;
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a recipient (a guest who uploaded reference selfies).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecipientId(String);

impl RecipientId {
    /// Create a new RecipientId from a string.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        validate_segment(&id, "RecipientId")?;
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A virtual path, independent of underlying storage.
///
/// Identifies an object uniformly across remote providers and the local
/// mirror. Always slash-delimited; backslashes are normalized away on parse
/// so no provider ever sees one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoragePath {
    components: Vec<String>,
}

impl StoragePath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if any component is empty, contains a separator,
    ///   or is a relative reference
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            validate_segment(comp, "Path component")?;
        }
        Ok(Self { components })
    }

    /// Parse a path string into a StoragePath.
    ///
    /// Both '/' and '\\' are accepted as separators; empty segments are
    /// dropped, so leading, trailing and doubled separators are harmless.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let normalized = path.replace('\\', "/");
        let components: Vec<String> = normalized
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        Self::from_components(components)
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Extension of the last component, without the dot.
    pub fn extension(&self) -> Option<&str> {
        let name = self.name()?;
        match name.rfind('.') {
            Some(0) | None => None,
            Some(idx) => Some(&name[idx + 1..]),
        }
    }

    /// Join this path with a single child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        validate_segment(child, "Child component")?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Append every component of `other` to this path.
    pub fn join_path(&self, other: &StoragePath) -> Self {
        let mut components = self.components.clone();
        components.extend(other.components.iter().cloned());
        Self { components }
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Whether `prefix` is a component-wise prefix of this path.
    pub fn starts_with(&self, prefix: &StoragePath) -> bool {
        self.components.starts_with(&prefix.components)
    }

    /// Remove a component-wise prefix, returning the remainder.
    pub fn strip_prefix(&self, prefix: &StoragePath) -> Option<StoragePath> {
        if !self.starts_with(prefix) {
            return None;
        }
        Some(Self {
            components: self.components[prefix.components.len()..].to_vec(),
        })
    }

    /// Provider key form: components joined by '/', no leading slash.
    pub fn as_key(&self) -> String {
        self.components.join("/")
    }

    /// Key form with a trailing slash, suitable for prefix listings.
    ///
    /// The root prefix is the empty string.
    pub fn as_prefix(&self) -> String {
        if self.is_root() {
            String::new()
        } else {
            format!("{}/", self.as_key())
        }
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.as_key())
        }
    }
}
