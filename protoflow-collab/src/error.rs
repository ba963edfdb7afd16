//! Engine failures and how they are reported to the originating actor.

use protoflow_core::ValidationError;
use thiserror::Error;

/// Coarse classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected before any state changed.
    Validation,
    /// The request raced with another actor and lost.
    Conflict,
    NotFound,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("operation {operation_id} targets an element deleted by a committed operation")]
    TargetDeleted { operation_id: String },

    #[error("base version {base_version} is older than the oldest retained version {oldest_available}")]
    StaleBase {
        base_version: u64,
        oldest_available: u64,
    },

    #[error("actor {actor_id} is not a participant of document {document_id}")]
    NotParticipant {
        document_id: String,
        actor_id: String,
    },

    #[error("document {document_id} already has {limit} participants")]
    SessionFull { document_id: String, limit: usize },

    #[error("no session for document {0}")]
    SessionNotFound(String),

    #[error("session for document {0} was corrupted and has been dropped")]
    SessionCorrupted(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::TargetDeleted { .. }
            | EngineError::StaleBase { .. }
            | EngineError::SessionFull { .. } => ErrorKind::Conflict,
            EngineError::NotParticipant { .. } | EngineError::SessionNotFound(_) => {
                ErrorKind::NotFound
            }
            EngineError::SessionCorrupted(_) => ErrorKind::Internal,
        }
    }

    /// Stable identifier sent to clients in failure replies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::TargetDeleted { .. } => "targetDeleted",
            EngineError::StaleBase { .. } => "staleBase",
            EngineError::NotParticipant { .. } => "notParticipant",
            EngineError::SessionFull { .. } => "sessionFull",
            EngineError::SessionNotFound(_) => "sessionNotFound",
            EngineError::SessionCorrupted(_) => "sessionCorrupted",
        }
    }
}
