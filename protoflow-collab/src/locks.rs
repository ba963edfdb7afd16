//! Element-level exclusive locks.
//!
//! Acquisition never waits: a held lock is reported back with its owner and
//! the caller decides whether to retry. Locks die with their owner's last
//! channel, which is what keeps abandoned clients from wedging an element.

use serde::{Deserialize, Serialize};

use protoflow_core::ValidationError;

use crate::error::EngineError;
use crate::registry::{AtomicEngineStats, SessionRegistry};
use crate::session::{ActorId, ElementId, Session};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub element_id: ElementId,
    pub owner_id: ActorId,
    pub acquired_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResult {
    pub success: bool,
    /// Current owner: the caller on success, the blocking actor otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<ActorId>,
}

impl Session {
    pub(crate) fn acquire_lock(
        &mut self,
        element_id: &str,
        actor_id: &str,
        now: u64,
    ) -> Result<LockResult, EngineError> {
        self.require_participant(actor_id)?;

        if let Some(lock) = self.locks.get(element_id) {
            return Ok(LockResult {
                success: lock.owner_id == actor_id,
                locked_by: Some(lock.owner_id.clone()),
            });
        }

        self.locks.insert(
            element_id.to_string(),
            Lock {
                element_id: element_id.to_string(),
                owner_id: actor_id.to_string(),
                acquired_at: now,
            },
        );
        self.touch(now);
        Ok(LockResult {
            success: true,
            locked_by: Some(actor_id.to_string()),
        })
    }

    /// Only the owner can release; anyone else gets `false`.
    pub(crate) fn release_lock(&mut self, element_id: &str, actor_id: &str) -> bool {
        match self.locks.get(element_id) {
            Some(lock) if lock.owner_id == actor_id => {
                self.locks.remove(element_id);
                true
            }
            _ => false,
        }
    }

    /// Release every lock `actor_id` owns, returning the freed element ids.
    pub(crate) fn release_all(&mut self, actor_id: &str) -> Vec<ElementId> {
        let mut released = Vec::new();
        self.locks.retain(|element_id, lock| {
            let owned = lock.owner_id == actor_id;
            if owned {
                released.push(element_id.clone());
            }
            !owned
        });
        released
    }
}

impl SessionRegistry {
    /// Try to take the exclusive lock on `element_id`. Re-locking an element
    /// the actor already holds succeeds.
    pub fn lock_element(
        &self,
        document_id: &str,
        element_id: &str,
        actor_id: &str,
    ) -> Result<LockResult, EngineError> {
        if element_id.is_empty() {
            return Err(ValidationError::MissingField("elementId").into());
        }
        let now = self.now();

        let result = self
            .with_session(document_id, false, |session| session.acquire_lock(element_id, actor_id, now))?
            .ok_or_else(|| EngineError::SessionNotFound(document_id.to_string()))?;

        if result.success {
            AtomicEngineStats::bump(&self.stats.locks_granted);
            log::debug!("{actor_id} locked {element_id} in {document_id}");
        } else {
            AtomicEngineStats::bump(&self.stats.locks_denied);
            log::warn!(
                "{actor_id} denied lock on {element_id} in {document_id}: held by {}",
                result.locked_by.as_deref().unwrap_or_default()
            );
        }
        Ok(result)
    }

    /// Release a lock held by `actor_id`. Unknown sessions, unlocked elements
    /// and locks owned by someone else all yield `false`.
    pub fn unlock_element(
        &self,
        document_id: &str,
        element_id: &str,
        actor_id: &str,
    ) -> Result<bool, EngineError> {
        let released = self
            .with_session(document_id, false, |session| Ok(session.release_lock(element_id, actor_id)))?
            .unwrap_or(false);

        if released {
            log::debug!("{actor_id} unlocked {element_id} in {document_id}");
        }
        Ok(released)
    }
}
