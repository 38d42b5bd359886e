//! Hierarchical tag names and their sortable keys.
//!
//! A tag name is a `/`-separated path such as `bird/duck/mandarin`. Each name maps to a
//! [`TagKey`] built from its segments so that a tag and all of its descendants occupy a
//! contiguous key range, which the database layer scans with a plain `>= AND <` test.

use crate::database::DatabaseError;
use std::{fmt::Display, str::FromStr};
use thiserror::Error;

pub const SEPARATOR: char = '/';

/// Terminates every segment inside a key. Sorts directly below [`SEPARATOR`].
const KEY_TERMINATOR: char = '.';

#[derive(Debug, Error)]
pub enum TagError {
    #[error("invalid tag name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("cannot move `{from}` to `{to}`: destination is inside the moved subtree")]
    InvalidMove { from: String, to: String },

    #[error("tag `{name}` does not exist")]
    NotFound { name: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// A validated tag path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagName {
    segments: Vec<String>,
}

impl TagName {
    /// Splits and validates a tag name.
    ///
    /// # Errors
    /// - `TagError::InvalidName` if a segment is empty or starts or ends with whitespace.
    pub fn parse(name: &str) -> Result<Self, TagError> {
        let invalid = |reason| TagError::InvalidName {
            name: name.to_string(),
            reason,
        };

        let mut segments = Vec::new();
        for segment in name.split(SEPARATOR) {
            if segment.is_empty() {
                return Err(invalid("segments must not be empty"));
            }
            if segment.trim() != segment {
                return Err(invalid(
                    "segments must not start or end with whitespace",
                ));
            }
            segments.push(segment.to_string());
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// The last segment.
    pub fn leaf(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// Every prefix of this name, shortest first, ending with the name itself.
    pub fn lineage(&self) -> impl Iterator<Item = TagName> + '_ {
        (1..=self.segments.len()).map(|n| TagName {
            segments: self.segments[..n].to_vec(),
        })
    }

    pub fn parent(&self) -> Option<TagName> {
        (self.segments.len() > 1).then(|| TagName {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, segment: &str) -> Result<TagName, TagError> {
        TagName::parse(&format!("{self}{SEPARATOR}{segment}"))
    }

    /// Whether this name is `ancestor` or one of its descendants.
    pub fn is_within(&self, ancestor: &TagName) -> bool {
        self.segments.starts_with(&ancestor.segments)
    }

    /// Replaces the `from` prefix of this name with `onto`.
    ///
    /// Returns `None` if this name is not within `from`.
    pub fn rebase(&self, from: &TagName, onto: &TagName) -> Option<TagName> {
        if !self.is_within(from) {
            return None;
        }

        let mut segments = onto.segments.clone();
        segments.extend_from_slice(&self.segments[from.segments.len()..]);
        Some(TagName { segments })
    }

    pub fn key(&self) -> TagKey {
        TagKey::new(&self.segments)
    }
}

impl Display for TagName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.segments.join(&SEPARATOR.to_string()))
    }
}

impl FromStr for TagName {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TagName::parse(s)
    }
}

/// Sortable encoding of a tag name, stored in the `escaped_name` column.
///
/// Each segment is written as the hex of its UTF-8 bytes followed by `.`, so the key
/// alphabet is `[0-9a-f.]` and no segment content can be mistaken for a boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagKey(String);

impl TagKey {
    fn new(segments: &[String]) -> Self {
        let mut key = String::new();
        for segment in segments {
            key.push_str(&hex::encode(segment.as_bytes()));
            key.push(KEY_TERMINATOR);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Half-open range `[lower, upper)` holding this key and all descendant keys.
    ///
    /// Descendant keys extend this key, and bumping the final terminator to the next
    /// character bounds them without reaching siblings such as `bird2` for `bird`.
    pub fn subtree_range(&self) -> (String, String) {
        let mut upper = self.0.clone();
        upper.pop();
        upper.push(SEPARATOR);
        (self.0.clone(), upper)
    }

    /// Decodes the key back to a name.
    pub fn decode(&self) -> Option<TagName> {
        let mut segments = Vec::new();
        for part in self.0.strip_suffix(KEY_TERMINATOR)?.split(KEY_TERMINATOR) {
            let bytes = hex::decode(part).ok()?;
            segments.push(String::from_utf8(bytes).ok()?);
        }
        Some(TagName { segments })
    }
}

impl Display for TagKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tag row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: i64,
    pub name: TagName,
    pub description: Option<String>,
}

/// A tag with the last segments of its immediate children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDescription {
    pub tag: Tag,
    pub children: Vec<String>,
}

/// A node of the nested tag tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagNode {
    pub description: Option<String>,
    pub children: std::collections::BTreeMap<String, TagNode>,
}

#[cfg(test)]
mod tests {
    use super::{TagError, TagName};
    use proptest::prelude::*;

    #[test]
    fn test_parse_validates_segments() {
        assert_eq!(3, TagName::parse("bird/duck/mandarin").unwrap().depth());

        for bad in ["", "bird/", "/bird", "bird//duck", " bird", "bird/duck ", "bird/\tduck"] {
            assert!(
                matches!(TagName::parse(bad), Err(TagError::InvalidName { .. })),
                "{bad:?} should be rejected"
            );
        }

        assert!(TagName::parse("wood duck/mandarin").is_ok());
    }

    #[test]
    fn test_lineage() {
        let name = TagName::parse("bird/duck/mandarin").unwrap();
        let lineage: Vec<String> = name.lineage().map(|n| n.to_string()).collect();

        assert_eq!(vec!["bird", "bird/duck", "bird/duck/mandarin"], lineage);
        assert_eq!("bird/duck", name.parent().unwrap().to_string());
        assert_eq!(None, TagName::parse("bird").unwrap().parent());
        assert_eq!("mandarin", name.leaf());
    }

    #[test]
    fn test_rebase() {
        let from = TagName::parse("bird/duck").unwrap();
        let onto = TagName::parse("waterfowl/duck").unwrap();
        let tag = TagName::parse("bird/duck/mandarin").unwrap();

        assert_eq!(
            "waterfowl/duck/mandarin",
            tag.rebase(&from, &onto).unwrap().to_string()
        );
        assert_eq!(
            None,
            TagName::parse("bird/goose").unwrap().rebase(&from, &onto)
        );
    }

    #[test]
    fn test_is_within_respects_segments() {
        let bird = TagName::parse("bird").unwrap();

        assert!(TagName::parse("bird/duck").unwrap().is_within(&bird));
        assert!(bird.is_within(&bird));
        assert!(!TagName::parse("bird2").unwrap().is_within(&bird));
    }

    #[test]
    fn test_subtree_range_excludes_textual_siblings() {
        let (lower, upper) = TagName::parse("bird").unwrap().key().subtree_range();
        let inside = |name: &str| {
            let key = TagName::parse(name).unwrap().key();
            lower.as_str() <= key.as_str() && key.as_str() < upper.as_str()
        };

        assert!(inside("bird"));
        assert!(inside("bird/duck"));
        assert!(inside("bird/duck/mandarin"));
        assert!(!inside("bird2"));
        assert!(!inside("bir"));
        assert!(!inside("bird.duck"));
        assert!(!inside("birds/duck"));
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-z0-9 ._%é]{0,6}[a-z0-9é]".prop_filter("no padding", |s| s.trim() == s)
    }

    fn name() -> impl Strategy<Value = TagName> {
        prop::collection::vec(segment(), 1..4)
            .prop_map(|segments| TagName::parse(&segments.join("/")).unwrap())
    }

    proptest! {
        /// Key range membership matches segment-wise ancestry.
        #[test]
        fn test_range_matches_ancestry(a in name(), b in name()) {
            let (lower, upper) = a.key().subtree_range();
            let key = b.key();
            let in_range = lower.as_str() <= key.as_str() && key.as_str() < upper.as_str();

            prop_assert_eq!(b.is_within(&a), in_range);
        }

        #[test]
        fn test_key_decodes(a in name()) {
            prop_assert_eq!(Some(a.clone()), a.key().decode());
        }

        #[test]
        fn test_distinct_names_distinct_keys(a in name(), b in name()) {
            prop_assert_eq!(a == b, a.key() == b.key());
        }
    }
}
