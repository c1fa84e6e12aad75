//! Correlation tags.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation number stamped on a request and echoed on its responses.
///
/// Tags are plumbing only; they carry no domain meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub u64);

impl Tag {
    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out tags that are unique for the allocator's lifetime.
#[derive(Debug)]
pub struct TagAllocator {
    next: u64,
}

impl TagAllocator {
    /// Creates an allocator whose first tag is 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Returns the next tag.
    pub fn next_tag(&mut self) -> Tag {
        let tag = Tag(self.next);
        self.next += 1;
        tag
    }
}

impl Default for TagAllocator {
    fn default() -> Self {
        Self::new()
    }
}
