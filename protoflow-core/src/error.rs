//! Error types shared by the document model and the collaboration engine.

use thiserror::Error;

use crate::path::ElementPath;

/// Failure to apply an operation to a concrete tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("no element at path {0}")]
    PathNotFound(ElementPath),

    #[error("index {index} is out of bounds for parent {parent} with {len} children")]
    IndexOutOfBounds {
        parent: ElementPath,
        index: usize,
        len: usize,
    },

    #[error("operation {0} cannot target the root")]
    RootNotAddressable(String),
}

/// An operation or event that is malformed and must be rejected before any
/// state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("operation is missing an id")]
    MissingId,

    #[error("operation {0} is missing an elementPath")]
    MissingElementPath(String),

    #[error("operation {0} sets a field with an empty name")]
    EmptyFieldName(String),

    #[error("operation {0} moves to an empty destination")]
    MissingDestination(String),

    #[error("operation {0} moves a node to a different parent")]
    CrossParentMove(String),

    #[error("operation {0} addresses a child index beyond {max}", max = crate::path::MAX_INDEX)]
    PathIndexOutOfRange(String),

    #[error("operation belongs to document {found}, not {expected}")]
    DocumentMismatch { expected: String, found: String },

    #[error("base version {base_version} is ahead of session version {current}")]
    FutureBaseVersion { base_version: u64, current: u64 },

    #[error("operation id {0} is already used by another author")]
    IdInUse(String),

    #[error("event is missing {0}")]
    MissingField(&'static str),

    #[error("malformed event: {0}")]
    MalformedEvent(String),
}
