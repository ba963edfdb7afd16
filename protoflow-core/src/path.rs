//! Element addressing inside a protocol graph.
//!
//! An [`ElementPath`] is the list of child indices walked from the root:
//!
//! ```text
//! root            []
//! ├── step        [0]
//! ├── step        [1]
//! │   └── param   [1, 0]
//! └── step        [2]
//! ```
//!
//! Structural inserts and move destinations read the path as a *gap*: the
//! slot the new node will occupy once it is in place.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest child index an operation may address.
pub const MAX_INDEX: usize = u32::MAX as usize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementPath(Vec<usize>);

impl ElementPath {
    pub fn new(indices: Vec<usize>) -> Self {
        Self(indices)
    }

    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    /// Path of the parent node. The root is its own parent.
    pub fn parent(&self) -> ElementPath {
        match self.0.split_last() {
            Some((_, rest)) => Self(rest.to_vec()),
            None => Self::root(),
        }
    }

    /// Whether every index is at most [`MAX_INDEX`].
    pub fn in_bounds(&self) -> bool {
        self.0.iter().all(|&index| index <= MAX_INDEX)
    }

    /// Index of this node among its siblings.
    pub fn last_index(&self) -> Option<usize> {
        self.0.last().copied()
    }

    /// Whether `prefix` addresses this node or one of its ancestors.
    pub fn starts_with(&self, prefix: &ElementPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Whether both paths have the same parent for the first `depth` levels.
    pub(crate) fn shares_parent_at(&self, other: &ElementPath, depth: usize) -> bool {
        self.0.len() > depth && other.0.len() > depth && self.0[..depth] == other.0[..depth]
    }

    /// Replace the first `prefix_len` levels with `base`.
    pub(crate) fn rebase(&self, prefix_len: usize, base: &ElementPath) -> ElementPath {
        let mut indices = base.0.clone();
        indices.extend_from_slice(&self.0[prefix_len..]);
        Self(indices)
    }

    pub(crate) fn index_mut(&mut self, depth: usize) -> &mut usize {
        &mut self.0[depth]
    }

    pub fn child(&self, index: usize) -> ElementPath {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }
}

impl From<Vec<usize>> for ElementPath {
    fn from(indices: Vec<usize>) -> Self {
        Self(indices)
    }
}

impl<const N: usize> From<[usize; N]> for ElementPath {
    fn from(indices: [usize; N]) -> Self {
        Self(indices.to_vec())
    }
}

impl fmt::Display for ElementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}
