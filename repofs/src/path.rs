//! Repository paths: absolute, `/`-separated, NFC-normalized component
//! sequences rooted at the repository root (`/`).
//!
//! These are not filesystem paths — they never touch the host OS path type.
//! A path is a sequence of validated components; the root itself is the
//! empty sequence.

use std::fmt;

use ref_cast::{ref_cast_custom, RefCastCustom};
use thiserror::Error;
use unicode_normalization::{is_nfc, UnicodeNormalization};

/// A component, or a full path, failed validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathSyntaxError {
    #[error("path component is empty")]
    EmptyComponent,

    #[error("path component {0:?} is reserved")]
    ReservedComponent(String),

    #[error("path component {0:?} contains a '/' or NUL byte")]
    InvalidByte(String),

    #[error("path {0:?} is not absolute")]
    NotAbsolute(String),
}

/// A single validated, NFC-normalized path component, borrowed form.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord, RefCastCustom)]
#[repr(transparent)]
pub struct RepoPathComponent(str);

impl RepoPathComponent {
    #[ref_cast_custom]
    const fn from_validated(s: &str) -> &Self;

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoPathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ToOwned for RepoPathComponent {
    type Owned = RepoPathComponentBuf;

    fn to_owned(&self) -> RepoPathComponentBuf {
        RepoPathComponentBuf(self.0.to_string())
    }
}

/// Owned counterpart of [`RepoPathComponent`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoPathComponentBuf(String);

impl RepoPathComponentBuf {
    /// Validates and NFC-normalizes `name` as a single path component.
    ///
    /// Rejects the empty string, `.`, `..`, and anything containing `/` or
    /// a NUL byte.
    pub fn new(name: impl AsRef<str>) -> Result<Self, PathSyntaxError> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(PathSyntaxError::EmptyComponent);
        }
        if name == "." || name == ".." {
            return Err(PathSyntaxError::ReservedComponent(name.to_string()));
        }
        if name.contains('/') || name.contains('\0') {
            return Err(PathSyntaxError::InvalidByte(name.to_string()));
        }
        let normalized = if is_nfc(name) {
            name.to_string()
        } else {
            name.nfc().collect::<String>()
        };
        Ok(Self(normalized))
    }

    pub fn as_component(&self) -> &RepoPathComponent {
        RepoPathComponent::from_validated(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<RepoPathComponent> for RepoPathComponentBuf {
    fn borrow(&self) -> &RepoPathComponent {
        self.as_component()
    }
}

impl fmt::Display for RepoPathComponentBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An absolute, `/`-separated path rooted at the repository root.
///
/// Stores its components pre-split and validated; `/` is never re-parsed
/// once a `RepoPath` exists. The root path has zero components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RepoPath {
    components: Vec<RepoPathComponentBuf>,
}

impl RepoPath {
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    pub fn from_components(components: Vec<RepoPathComponentBuf>) -> Self {
        Self { components }
    }

    /// Parses an absolute path like `/trunk/src/main.rs`. The leading `/` is
    /// required; a trailing `/` is tolerated and ignored.
    pub fn parse(text: &str) -> Result<Self, PathSyntaxError> {
        let Some(rest) = text.strip_prefix('/') else {
            return Err(PathSyntaxError::NotAbsolute(text.to_string()));
        };
        if rest.is_empty() {
            return Ok(Self::root());
        }
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        let components = rest
            .split('/')
            .map(RepoPathComponentBuf::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { components })
    }

    pub fn components(&self) -> &[RepoPathComponentBuf] {
        &self.components
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.components.is_empty() {
            return None;
        }
        Some(Self {
            components: self.components[..self.components.len() - 1].to_vec(),
        })
    }

    pub fn basename(&self) -> Option<&RepoPathComponent> {
        self.components.last().map(|c| c.as_component())
    }

    pub fn join(&self, child: &RepoPathComponent) -> Self {
        let mut components = self.components.clone();
        components.push(child.to_owned());
        Self { components }
    }

    /// Whether `self` names the same node or an ancestor/descendant path of
    /// `other` (used by the commit pipeline to detect path prefix overlap).
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        other.components.len() >= self.components.len()
            && other.components[..self.components.len()] == self.components[..]
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("/")?;
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(c.as_str())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_rejects_slash_and_dots() {
        assert!(RepoPathComponentBuf::new("a/b").is_err());
        assert!(RepoPathComponentBuf::new(".").is_err());
        assert!(RepoPathComponentBuf::new("..").is_err());
        assert!(RepoPathComponentBuf::new("").is_err());
        assert!(RepoPathComponentBuf::new("ok.txt").is_ok());
    }

    #[test]
    fn path_parse_round_trips() {
        let p = RepoPath::parse("/trunk/src/main.rs").unwrap();
        assert_eq!(p.to_string(), "/trunk/src/main.rs");
        assert_eq!(p.components().len(), 3);
        assert_eq!(p.basename().unwrap().as_str(), "main.rs");
    }

    #[test]
    fn root_path_has_no_components() {
        let root = RepoPath::parse("/").unwrap();
        assert!(root.is_root());
        assert_eq!(root.to_string(), "/");
        assert!(root.parent().is_none());
    }

    #[test]
    fn requires_leading_slash() {
        assert!(RepoPath::parse("trunk/src").is_err());
    }

    #[test]
    fn is_ancestor_of_checks_component_prefix() {
        let trunk = RepoPath::parse("/trunk").unwrap();
        let file = RepoPath::parse("/trunk/src/main.rs").unwrap();
        let other = RepoPath::parse("/branches/x").unwrap();
        assert!(trunk.is_ancestor_of(&file));
        assert!(!trunk.is_ancestor_of(&other));
        assert!(trunk.is_ancestor_of(&trunk));
    }

    #[test]
    fn normalizes_to_nfc() {
        // "e" + combining acute accent U+0301 decomposes "é"
        let decomposed = "cafe\u{0301}";
        let c = RepoPathComponentBuf::new(decomposed).unwrap();
        assert_eq!(c.as_str(), "café");
    }
}
