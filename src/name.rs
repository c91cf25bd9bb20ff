//! # Structured service names.
//!
//! A [`ServiceName`] is an immutable path of non-empty segments with
//! structural equality. Names are cheap to clone (the segment storage is
//! shared) and are used as keys everywhere a service or registration is
//! addressed.
//!
//! ```
//! use servisor::ServiceName;
//!
//! let db = ServiceName::from("net.db.primary");
//! assert_eq!(db.to_string(), "net.db.primary");
//! assert_eq!(db, ServiceName::of(["net", "db", "primary"]));
//! ```

use std::fmt;
use std::sync::Arc;

/// Immutable, segmented service name.
///
/// Two names are equal iff their segment sequences are equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName {
    segments: Arc<[Box<str>]>,
}

impl ServiceName {
    /// Builds a name from an iterator of segments. Empty segments are skipped.
    pub fn of<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<Box<str>> = segments
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .map(String::into_boxed_str)
            .collect();
        Self {
            segments: segments.into(),
        }
    }

    /// Returns a new name with `segment` appended.
    pub fn append(&self, segment: impl Into<String>) -> Self {
        Self::of(
            self.segments
                .iter()
                .map(|s| s.to_string())
                .chain(Some(segment.into())),
        )
    }

    /// Iterates the segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(AsRef::as_ref)
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True for the empty name (no segments).
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl From<&str> for ServiceName {
    /// Parses a dotted path, skipping empty runs (`"a..b"` equals `"a.b"`).
    fn from(path: &str) -> Self {
        Self::of(path.split('.'))
    }
}

impl From<String> for ServiceName {
    fn from(path: String) -> Self {
        Self::from(path.as_str())
    }
}

impl From<&ServiceName> for ServiceName {
    fn from(name: &ServiceName) -> Self {
        name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_parse_and_display() {
        let name = ServiceName::from("a.b.c");
        assert_eq!(name.len(), 3);
        assert_eq!(name.to_string(), "a.b.c");
        assert_eq!(name, ServiceName::of(["a", "b", "c"]));
    }

    #[test]
    fn empty_segments_are_skipped() {
        assert_eq!(ServiceName::from("a..b"), ServiceName::from("a.b"));
    }

    #[test]
    fn append_builds_a_child_name() {
        let base = ServiceName::from("net");
        assert_eq!(base.append("http"), ServiceName::from("net.http"));
    }
}
