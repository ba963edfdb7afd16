//! Removal of empty, stale sessions.
//!
//! [`SessionRegistry::cleanup_inactive_sessions`] is a plain synchronous
//! sweep over the registry's clock; when to run it is the host's business.
//! [`spawn_reaper`] is a convenience for tokio hosts.

use serde::Serialize;
use std::sync::{Arc, TryLockError};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::registry::{AtomicEngineStats, SessionRegistry};
use crate::session::DocumentId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    /// Removed sessions, ordered by document id.
    pub removed: Vec<DocumentId>,
    /// Sessions in use by another thread, left for the next sweep.
    pub skipped_busy: usize,
    pub remaining: usize,
}

impl SessionRegistry {
    /// Remove every session that has had no participants for strictly more
    /// than `threshold_minutes`.
    pub fn cleanup_inactive_sessions(&self, threshold_minutes: u64) -> ReapReport {
        let now = self.now();
        let threshold_ms = threshold_minutes.saturating_mul(60_000);
        let mut report = ReapReport::default();

        let mut sessions = self.sessions_write();
        sessions.retain(|document_id, handle| match handle.try_lock() {
            Ok(mut session) => {
                let idle_for = now.saturating_sub(session.last_activity);
                if session.is_empty() && idle_for > threshold_ms {
                    session.retired = true;
                    report.removed.push(document_id.clone());
                    false
                } else {
                    true
                }
            }
            Err(TryLockError::WouldBlock) => {
                report.skipped_busy += 1;
                true
            }
            Err(TryLockError::Poisoned(_)) => {
                log::error!("Dropped corrupted session for document {document_id}");
                false
            }
        });
        report.remaining = sessions.len();
        drop(sessions);

        report.removed.sort();
        for document_id in &report.removed {
            AtomicEngineStats::bump(&self.stats.sessions_reaped);
            log::info!("Reaped inactive session for document {document_id}");
        }
        report
    }
}

/// Run the sweep every `reap_interval_secs` with the configured threshold
/// until the returned task is aborted. The first sweep happens immediately.
pub fn spawn_reaper(registry: Arc<SessionRegistry>) -> JoinHandle<()> {
    let period = Duration::from_secs(registry.config().reap_interval_secs.max(1));
    let threshold = registry.config().inactivity_threshold_minutes;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let report = registry.cleanup_inactive_sessions(threshold);
            if !report.removed.is_empty() {
                log::debug!(
                    "Reaper removed {} sessions, {} remain",
                    report.removed.len(),
                    report.remaining
                );
            }
        }
    })
}
