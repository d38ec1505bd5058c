//! Common types used throughout minutesync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a remote item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteId(String);

impl RemoteId {
    /// Create a new RemoteId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or only whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "RemoteId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RemoteId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<RemoteId> for String {
    fn from(id: RemoteId) -> Self {
        id.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file location relative to the mirror root.
///
/// Always '/'-separated regardless of platform, and never escapes the root:
/// `.` and `..` components are rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MirrorPath {
    components: Vec<String>,
}

impl MirrorPath {
    /// Create the root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if any component is empty, contains a separator, or is `.`/`..`
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            Self::validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a path string into a MirrorPath.
    ///
    /// Leading and trailing separators are ignored; backslashes are treated as separators.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let normalized = path.replace('\\', "/");
        let trimmed = normalized.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let components: Vec<String> = trimmed.split('/').map(String::from).collect();
        Self::from_components(components)
    }

    fn validate_component(comp: &str) -> crate::Result<()> {
        if comp.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Path component cannot be empty".to_string(),
            ));
        }
        if comp.contains('/') || comp.contains('\\') {
            return Err(crate::Error::InvalidInput(
                "Path component cannot contain separators".to_string(),
            ));
        }
        if comp == "." || comp == ".." {
            return Err(crate::Error::InvalidInput(format!(
                "Path component '{}' is not allowed",
                comp
            )));
        }
        Ok(())
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

    /// Get the file name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        Self::validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Derive a sibling path with ` (n)` inserted before the extension.
    ///
    /// `Meetings/Standup.md` with `n = 2` becomes `Meetings/Standup (2).md`.
    pub fn with_counter(&self, n: u32) -> Self {
        let Some(name) = self.name() else {
            return self.clone();
        };
        let renamed = match name.rfind('.') {
            Some(dot) if dot > 0 => format!("{} ({}){}", &name[..dot], n, &name[dot..]),
            _ => format!("{} ({})", name, n),
        };
        let mut components = self.components.clone();
        components.pop();
        components.push(renamed);
        Self { components }
    }

    /// Whether any component starts with a dot (hidden files and the state directory).
    pub fn is_hidden(&self) -> bool {
        self.components.iter().any(|c| c.starts_with('.'))
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Convert to a '/'-separated relative string.
    pub fn to_string_path(&self) -> String {
        self.components.join("/")
    }
}

impl TryFrom<String> for MirrorPath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<MirrorPath> for String {
    fn from(path: MirrorPath) -> Self {
        path.to_string_path()
    }
}

impl fmt::Display for MirrorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}
