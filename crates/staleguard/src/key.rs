use std::fmt;
use std::sync::Arc;

use crate::error::{CacheContents, CacheError};

/// The storage key of a cached item.
///
/// A key is the pair of a segment (a named partition of keys sharing one
/// policy) and an item id within that segment. Both halves are behind
/// [`Arc`]s, so cloning a key for the in-flight registry or a spawned refresh
/// task is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    segment: Arc<str>,
    id: Arc<str>,
}

impl CacheKey {
    pub fn new(segment: impl Into<Arc<str>>, id: impl Into<Arc<str>>) -> Self {
        Self {
            segment: segment.into(),
            id: id.into(),
        }
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.id)
    }
}

/// Validates a segment name.
///
/// Rejects empty names and names containing a NUL byte. Storage engines are
/// free to impose stricter rules on top of this.
pub fn validate_segment_name(name: &str) -> CacheContents {
    if name.is_empty() {
        return Err(CacheError::InvalidKey("empty segment name"));
    }
    if name.contains('\0') {
        return Err(CacheError::InvalidKey("segment name contains NUL"));
    }
    Ok(())
}
