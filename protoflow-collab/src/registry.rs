//! Process-wide map of document id → live session.
//!
//! ```text
//!              RwLock<HashMap>            (held only to find/insert/remove)
//!   "doc1" ──► Arc<Mutex<Session>>       (held for one whole entry point)
//!   "doc2" ──► Arc<Mutex<Session>>
//! ```
//!
//! Work on different documents proceeds in parallel; work on one document is
//! serialized by its mutex. Nothing here blocks on I/O or awaits.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use protoflow_core::{Operation, ValidationError};

use crate::clock::{Clock, SystemClock};
use crate::error::EngineError;
use crate::session::{ActorInfo, ChannelId, DocumentId, LeaveOutcome, Session, SessionSnapshot};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Distinct actors allowed in one session
    pub max_participants_per_session: usize,
    /// Committed operations kept per session for transforms and catch-up
    pub max_log_len: usize,
    /// Grace period before an empty session is reaped
    pub inactivity_threshold_minutes: u64,
    /// Period of the optional background reaper
    pub reap_interval_secs: u64,
    /// Minimum spacing between presence broadcasts of one actor
    pub presence_min_interval_ms: u64,
    /// Messages buffered per room subscriber
    pub broadcast_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_participants_per_session: 100,
            max_log_len: 1024,
            inactivity_threshold_minutes: 30,
            reap_interval_secs: 60,
            presence_min_interval_ms: 33,
            broadcast_capacity: 256,
        }
    }
}

/// Engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub live_sessions: usize,
    pub sessions_created: u64,
    pub sessions_reaped: u64,
    pub sessions_closed: u64,
    pub operations_applied: u64,
    pub operations_rejected: u64,
    pub locks_granted: u64,
    pub locks_denied: u64,
}

/// Counters updated without taking any lock.
#[derive(Default)]
pub(crate) struct AtomicEngineStats {
    pub(crate) sessions_created: AtomicU64,
    pub(crate) sessions_reaped: AtomicU64,
    pub(crate) sessions_closed: AtomicU64,
    pub(crate) operations_applied: AtomicU64,
    pub(crate) operations_rejected: AtomicU64,
    pub(crate) locks_granted: AtomicU64,
    pub(crate) locks_denied: AtomicU64,
}

impl AtomicEngineStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct SessionRegistry {
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<DocumentId, Arc<Mutex<Session>>>>,
    pub(crate) stats: AtomicEngineStats,
}

impl SessionRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            sessions: RwLock::new(HashMap::new()),
            stats: AtomicEngineStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    // The map only holds handles; a panic while it was locked cannot leave
    // it half-updated.
    pub(crate) fn sessions_read(&self) -> RwLockReadGuard<'_, HashMap<DocumentId, Arc<Mutex<Session>>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn sessions_write(&self) -> RwLockWriteGuard<'_, HashMap<DocumentId, Arc<Mutex<Session>>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, document_id: &str, create: bool) -> Option<Arc<Mutex<Session>>> {
        // Fast path: read lock
        if let Some(handle) = self.sessions_read().get(document_id) {
            return Some(handle.clone());
        }
        if !create {
            return None;
        }

        let mut sessions = self.sessions_write();
        let handle = sessions.entry(document_id.to_string()).or_insert_with(|| {
            AtomicEngineStats::bump(&self.stats.sessions_created);
            log::info!("Created session for document {document_id}");
            Arc::new(Mutex::new(Session::new(document_id, self.now())))
        });
        Some(handle.clone())
    }

    /// Run `f` with the document's session locked. `Ok(None)` when the
    /// session does not exist and `create` is false.
    pub(crate) fn with_session<T>(
        &self,
        document_id: &str,
        create: bool,
        mut f: impl FnMut(&mut Session) -> Result<T, EngineError>,
    ) -> Result<Option<T>, EngineError> {
        if document_id.is_empty() {
            return Err(ValidationError::MissingField("documentId").into());
        }

        loop {
            let Some(handle) = self.handle(document_id, create) else {
                return Ok(None);
            };

            let mut session = match handle.lock() {
                Ok(session) => session,
                Err(_) => {
                    if self.drop_corrupted(document_id, &handle) {
                        return Err(EngineError::SessionCorrupted(document_id.to_string()));
                    }
                    continue;
                }
            };

            // Removed while we waited for it; look again.
            if session.retired {
                continue;
            }
            return f(&mut session).map(Some);
        }
    }

    /// Remove a session whose mutex was poisoned. Returns false when another
    /// caller already replaced or removed it.
    fn drop_corrupted(&self, document_id: &str, handle: &Arc<Mutex<Session>>) -> bool {
        let mut sessions = self.sessions_write();
        match sessions.get(document_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.remove(document_id);
                log::error!("Dropped corrupted session for document {document_id}");
                true
            }
            _ => false,
        }
    }

    /// Join `actor_id` to the document through `channel`, creating the
    /// session on first use.
    pub fn join_session(
        &self,
        document_id: &str,
        actor_id: &str,
        info: ActorInfo,
        channel: ChannelId,
    ) -> Result<SessionSnapshot, EngineError> {
        if actor_id.is_empty() {
            return Err(ValidationError::MissingField("actorId").into());
        }
        let now = self.now();
        let limit = self.config.max_participants_per_session;

        self.with_session(document_id, true, |session| {
            session.join(actor_id, info.clone(), channel.clone(), now, limit)?;
            Ok(session.snapshot())
        })?
        .ok_or_else(|| EngineError::SessionNotFound(document_id.to_string()))
    }

    /// Drop one channel of an actor. Leaving an unknown session is a no-op.
    pub fn leave_session(
        &self,
        document_id: &str,
        actor_id: &str,
        channel: &ChannelId,
    ) -> Result<LeaveOutcome, EngineError> {
        let now = self.now();
        let outcome = self.with_session(document_id, false, |session| {
            Ok(session.leave(actor_id, Some(channel), now))
        })?;
        Ok(outcome.unwrap_or_default())
    }

    /// Drop every channel the actor holds in this document.
    pub fn disconnect_actor(&self, document_id: &str, actor_id: &str) -> Result<LeaveOutcome, EngineError> {
        let now = self.now();
        let outcome = self.with_session(document_id, false, |session| {
            Ok(session.leave(actor_id, None, now))
        })?;
        Ok(outcome.unwrap_or_default())
    }

    /// Drop a closed transport channel from every session it had joined.
    pub fn disconnect_channel(&self, channel: &ChannelId) -> Vec<ChannelDeparture> {
        let now = self.now();
        let mut departures = Vec::new();

        for document_id in self.document_ids() {
            let result = self.with_session(&document_id, false, |session| {
                Ok(session
                    .actors_on(channel)
                    .into_iter()
                    .map(|actor_id| {
                        let outcome = session.leave(&actor_id, Some(channel), now);
                        (actor_id, outcome)
                    })
                    .collect::<Vec<_>>())
            });

            match result {
                Ok(Some(left)) => {
                    departures.extend(left.into_iter().map(|(actor_id, outcome)| ChannelDeparture {
                        document_id: document_id.clone(),
                        actor_id,
                        outcome,
                    }))
                }
                Ok(None) => {}
                Err(err) => log::warn!("Skipping document {document_id} while dropping channel {channel}: {err}"),
            }
        }
        departures
    }

    /// Snapshot of a live session; `None` when there is none.
    pub fn get_session_info(&self, document_id: &str) -> Result<Option<SessionSnapshot>, EngineError> {
        self.with_session(document_id, false, |session| Ok(session.snapshot()))
    }

    /// Destroy a session regardless of who is in it, e.g. because the
    /// document itself was deleted. Returns its final state.
    pub fn close_session(&self, document_id: &str) -> Result<Option<SessionSnapshot>, EngineError> {
        let mut sessions = self.sessions_write();
        let Some(handle) = sessions.remove(document_id) else {
            return Ok(None);
        };

        // Mark it retired before anyone queued on the mutex can use it.
        let mut session = handle.lock().map_err(|_| {
            log::error!("Dropped corrupted session for document {document_id}");
            EngineError::SessionCorrupted(document_id.to_string())
        })?;
        session.retired = true;
        drop(sessions);

        AtomicEngineStats::bump(&self.stats.sessions_closed);
        log::info!("Closed session for document {document_id}");
        Ok(Some(session.snapshot()))
    }

    /// Committed operations after `version`, for catching up.
    pub fn operations_since(&self, document_id: &str, version: u64) -> Result<Vec<Operation>, EngineError> {
        let ops = self.with_session(document_id, false, |session| session.operations_since(version))?;
        Ok(ops.unwrap_or_default())
    }

    pub fn document_ids(&self) -> Vec<DocumentId> {
        let mut ids: Vec<_> = self.sessions_read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.sessions_read().len()
    }

    pub fn stats(&self) -> EngineStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        EngineStats {
            live_sessions: self.session_count(),
            sessions_created: load(&self.stats.sessions_created),
            sessions_reaped: load(&self.stats.sessions_reaped),
            sessions_closed: load(&self.stats.sessions_closed),
            operations_applied: load(&self.stats.operations_applied),
            operations_rejected: load(&self.stats.operations_rejected),
            locks_granted: load(&self.stats.locks_granted),
            locks_denied: load(&self.stats.locks_denied),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// One actor removed from one document by a closed channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDeparture {
    pub document_id: DocumentId,
    pub actor_id: String,
    pub outcome: LeaveOutcome,
}
