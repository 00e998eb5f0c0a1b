//! Segment identity derived from logical paths.
//!
//! A segment lives at `namespace/<id>.<ext>` relative to a storage root,
//! e.g. `orders-3/00000000000000042137.log`. The namespace groups segments
//! of one stream; ids within a namespace are created in increasing order.

use crate::error::{TierError, TierResult};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Logical identity of a segment: `(namespace, id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId {
    namespace: String,
    id: u64,
}

impl SegmentId {
    /// Create a segment id directly.
    pub fn new(namespace: impl Into<String>, id: u64) -> Self {
        Self {
            namespace: namespace.into(),
            id,
        }
    }

    /// Parse a relative path of the form `namespace/<id>.<ext>`.
    pub fn from_relative(path: &Path) -> TierResult<Self> {
        let parts: Vec<&str> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();

        if parts.len() != 2 || path.is_absolute() {
            return Err(TierError::InvalidPath(format!(
                "{} not in the format of namespace/id.ext",
                path.display()
            )));
        }

        let stem = parts[1].split('.').next().unwrap_or_default();
        let id = stem.parse::<u64>().map_err(|_| {
            TierError::InvalidPath(format!("{}: '{}' is not a numeric id", path.display(), stem))
        })?;

        Ok(Self::new(parts[0], id))
    }

    /// The namespace (parent directory name).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The numeric id (file stem).
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Reduce an absolute path to its last two components.
///
/// Used when a path is not under any known storage root.
pub fn trailing_relative(path: &Path) -> PathBuf {
    let normal: Vec<_> = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    let start = normal.len().saturating_sub(2);
    normal[start..].iter().collect()
}

/// Metadata key for a relative path. Always `/` separated.
pub fn meta_key(relative: &Path) -> String {
    let parts: Vec<_> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy()),
            _ => None,
        })
        .collect();
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relative() {
        let id = SegmentId::from_relative(Path::new("orders-3/00000000000000042137.log")).unwrap();
        assert_eq!(id.namespace(), "orders-3");
        assert_eq!(id.id(), 42137);
        assert_eq!(id.to_string(), "orders-3/42137");
    }

    #[test]
    fn test_parse_without_extension() {
        let id = SegmentId::from_relative(Path::new("ns/7")).unwrap();
        assert_eq!(id.id(), 7);
    }

    #[test]
    fn test_parse_rejects_bad_paths() {
        assert!(SegmentId::from_relative(Path::new("just-a-file.log")).is_err());
        assert!(SegmentId::from_relative(Path::new("a/b/0.log")).is_err());
        assert!(SegmentId::from_relative(Path::new("ns/abc.log")).is_err());
        assert!(SegmentId::from_relative(Path::new("/ns/0.log")).is_err());
    }

    #[test]
    fn test_ordering() {
        let a = SegmentId::new("a", 10);
        let b = SegmentId::new("a", 2);
        let c = SegmentId::new("b", 0);
        assert!(b < a);
        assert!(a < c);
    }

    #[test]
    fn test_trailing_relative() {
        assert_eq!(
            trailing_relative(Path::new("/var/lib/kafka/topic-0/00000.log")),
            PathBuf::from("topic-0/00000.log")
        );
        assert_eq!(trailing_relative(Path::new("x.log")), PathBuf::from("x.log"));
    }

    #[test]
    fn test_meta_key() {
        assert_eq!(meta_key(Path::new("topic-0/00001.log")), "topic-0/00001.log");
        assert_eq!(meta_key(Path::new("./topic-0/00001.log")), "topic-0/00001.log");
    }
}
