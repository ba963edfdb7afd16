//! Orders concurrent edits into one committed history per document.
//!
//! ```text
//!   op (base = 5) ──► validate ──► transform vs log[v6..=v8] ──► commit as v9
//!                        │                  │
//!                        ▼                  ▼
//!                   Validation        TargetDeleted
//! ```
//!
//! The committed (transformed) copy is what the caller broadcasts. Replicas
//! applying committed operations in version order all reach the same tree.

use serde::Serialize;

use protoflow_core::{transform_all, Operation, ValidationError};

use crate::error::EngineError;
use crate::registry::{AtomicEngineStats, SessionRegistry};
use crate::session::Session;

/// An operation as committed by the sequencer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedOperation {
    /// Carries `appliedVersion` and the trusted `authorId`.
    pub operation: Operation,
    /// Rebased over operations committed after its base version.
    pub transformed: bool,
    /// Already committed earlier under the same id; nothing changed.
    pub duplicate: bool,
}

impl Session {
    pub(crate) fn commit(
        &mut self,
        mut op: Operation,
        actor_id: &str,
        now: u64,
        max_log_len: usize,
    ) -> Result<AppliedOperation, EngineError> {
        op.validate()?;
        if !op.document_id.is_empty() && op.document_id != self.document_id {
            return Err(ValidationError::DocumentMismatch {
                expected: self.document_id.clone(),
                found: op.document_id,
            }
            .into());
        }

        if let Some(committed) = self.log.iter().find(|c| c.id == op.id) {
            if committed.author_id != actor_id {
                return Err(ValidationError::IdInUse(op.id).into());
            }
            return Ok(AppliedOperation {
                operation: committed.clone(),
                transformed: false,
                duplicate: true,
            });
        }

        if op.base_version > self.version {
            return Err(ValidationError::FutureBaseVersion {
                base_version: op.base_version,
                current: self.version,
            }
            .into());
        }

        let behind = (self.version - op.base_version) as usize;
        if behind > self.log.len() {
            return Err(EngineError::StaleBase {
                base_version: op.base_version,
                oldest_available: self.version - self.log.len() as u64,
            });
        }

        let concurrent = self.log.iter().skip(self.log.len() - behind);
        let mut committed = transform_all(&op, concurrent).ok_or_else(|| EngineError::TargetDeleted {
            operation_id: op.id.clone(),
        })?;

        self.version += 1;
        committed.author_id = actor_id.to_string();
        committed.document_id = self.document_id.clone();
        committed.applied_version = Some(self.version);

        self.log.push_back(committed.clone());
        while self.log.len() > max_log_len.max(1) {
            self.log.pop_front();
        }
        self.touch(now);

        Ok(AppliedOperation {
            operation: committed,
            transformed: behind > 0,
            duplicate: false,
        })
    }

    pub(crate) fn operations_since(&self, version: u64) -> Result<Vec<Operation>, EngineError> {
        if version >= self.version {
            return Ok(Vec::new());
        }
        let behind = (self.version - version) as usize;
        if behind > self.log.len() {
            return Err(EngineError::StaleBase {
                base_version: version,
                oldest_available: self.version - self.log.len() as u64,
            });
        }
        Ok(self.log.iter().skip(self.log.len() - behind).cloned().collect())
    }
}

impl SessionRegistry {
    /// Commit `operation` on behalf of `actor_id`, transforming it past
    /// anything committed since its base version. A first write to an unseen
    /// document creates its session at version 0.
    pub fn apply_operation(
        &self,
        document_id: &str,
        operation: Operation,
        actor_id: &str,
    ) -> Result<AppliedOperation, EngineError> {
        if actor_id.is_empty() {
            return Err(ValidationError::MissingField("actorId").into());
        }
        // Reject malformed input before a session can be created for it.
        operation.validate()?;

        let now = self.now();
        let max_log_len = self.config.max_log_len;
        let op_id = operation.id.clone();

        let result = self
            .with_session(document_id, true, |session| {
                session.commit(operation.clone(), actor_id, now, max_log_len)
            })
            .and_then(|applied| applied.ok_or_else(|| EngineError::SessionNotFound(document_id.to_string())));

        match &result {
            Ok(applied) if applied.duplicate => {
                log::debug!("Operation {op_id} on {document_id} was already committed");
            }
            Ok(applied) => {
                AtomicEngineStats::bump(&self.stats.operations_applied);
                log::debug!(
                    "Committed operation {op_id} on {document_id} as version {}",
                    applied.operation.applied_version.unwrap_or_default()
                );
            }
            Err(err) => {
                AtomicEngineStats::bump(&self.stats.operations_rejected);
                log::warn!("Rejected operation {op_id} from {actor_id} on {document_id}: {err}");
            }
        }
        result
    }
}
