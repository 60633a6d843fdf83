//! Hierarchical store paths

use std::fmt;

use crate::{Error, Result};

/// Characters the store's path grammar reserves
const RESERVED: &[char] = &['/', '.', '#', '$', '[', ']'];

/// Maximum length of a single path segment
const MAX_SEGMENT_LEN: usize = 768;

/// A validated, slash-separated location in the shared store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    /// The store root
    #[must_use]
    pub const fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Build a path from a single top-level segment
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the segment is empty or contains reserved characters
    pub fn new(segment: &str) -> Result<Self> {
        Self::root().child(segment)
    }

    /// Parse a slash-separated path such as `commands/dev1`
    ///
    /// Leading and trailing slashes are ignored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if any segment is invalid
    pub fn parse(raw: &str) -> Result<Self> {
        raw.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(Self::root(), |path, segment| path.child(segment))
    }

    /// Append a segment, returning the child path
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the segment is empty or contains reserved characters
    pub fn child(&self, segment: &str) -> Result<Self> {
        validate_segment(segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    /// Path segments, root first
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Last segment, or `None` for the root
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Whether this path is the root
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether `self` equals `other` or lies above it
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// Whether a write at `self` can change the value observed at `other`
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        f.write_str(&self.segments.join("/"))
    }
}

/// Check that a value can be used as a single path segment
///
/// Device IDs go through this check because they become path segments.
///
/// # Errors
///
/// Returns `Error::Validation` describing the first problem found
pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.trim().is_empty() {
        return Err(Error::Validation("path segment must not be empty".to_string()));
    }
    if segment.len() > MAX_SEGMENT_LEN {
        return Err(Error::Validation(format!(
            "path segment longer than {MAX_SEGMENT_LEN} bytes"
        )));
    }
    if let Some(c) = segment
        .chars()
        .find(|c| RESERVED.contains(c) || c.is_control())
    {
        return Err(Error::Validation(format!(
            "path segment '{}' contains reserved character {c:?}",
            segment.escape_debug()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let path = StorePath::parse("/responses/dev1/sms/").unwrap();
        assert_eq!(path.segments(), ["responses", "dev1", "sms"]);
        assert_eq!(path.to_string(), "responses/dev1/sms");
        assert_eq!(path.key(), Some("sms"));
        assert_eq!(StorePath::root().to_string(), "/");
    }

    #[test]
    fn rejects_reserved_characters() {
        for bad in ["", "  ", "a.b", "a#b", "a$b", "a[0]", "tab\there"] {
            assert!(StorePath::new(bad).is_err(), "accepted {bad:?}");
        }
        assert!(StorePath::parse("commands/a.b").is_err());
    }

    #[test]
    fn overlap_is_symmetric_along_one_branch() {
        let parent = StorePath::parse("responses/dev1").unwrap();
        let child = parent.child("sms").unwrap();
        let sibling = StorePath::parse("responses/dev2").unwrap();

        assert!(parent.is_ancestor_of(&child));
        assert!(!child.is_ancestor_of(&parent));
        assert!(parent.overlaps(&child));
        assert!(child.overlaps(&parent));
        assert!(!child.overlaps(&sibling));
        assert!(StorePath::root().overlaps(&sibling));
    }
}
