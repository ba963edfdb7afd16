//! Per-document session state.
//!
//! A [`Session`] is only ever touched with its mutex held, through the
//! registry's entry points. Callers see immutable snapshots.
//!
//! ```text
//! Session (doc1, v=7)
//! ├── participants  actorId → { info, channels{..}, presence }
//! ├── log           [op v3, op v4, .. op v7]   (bounded)
//! └── locks         elementId → { owner, acquiredAt }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use uuid::Uuid;

use protoflow_core::Operation;

use crate::error::EngineError;
use crate::locks::Lock;
use crate::presence::{actor_color, Presence};

pub type DocumentId = String;
pub type ActorId = String;
pub type ElementId = String;

/// Opaque transport connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random identifier for transports that have none of their own.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Display information supplied by the joining client.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorInfo {
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl ActorInfo {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            color: None,
        }
    }
}

pub(crate) struct Participant {
    pub(crate) info: ActorInfo,
    pub(crate) color: String,
    pub(crate) channels: BTreeSet<ChannelId>,
    pub(crate) presence: Option<Presence>,
    pub(crate) joined_at: u64,
    /// When this actor's presence was last fanned out.
    pub(crate) presence_broadcast_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSnapshot {
    pub actor_id: ActorId,
    pub display_name: String,
    pub color: String,
    pub channel_count: usize,
    pub joined_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Presence>,
}

/// Everything a late joiner needs to bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub document_id: DocumentId,
    pub version: u64,
    /// Ordered by actor id.
    pub participants: Vec<ParticipantSnapshot>,
    /// Ordered by element id.
    pub locks: Vec<Lock>,
    pub last_activity: u64,
}

impl SessionSnapshot {
    pub fn participant(&self, actor_id: &str) -> Option<&ParticipantSnapshot> {
        self.participants.iter().find(|p| p.actor_id == actor_id)
    }

    pub fn lock_owner(&self, element_id: &str) -> Option<&str> {
        self.locks
            .iter()
            .find(|lock| lock.element_id == element_id)
            .map(|lock| lock.owner_id.as_str())
    }
}

/// Result of removing one or more channels of an actor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveOutcome {
    /// Actors still present, ordered by id.
    pub remaining: Vec<ActorId>,
    /// Channels that were actually dropped.
    pub channels: Vec<ChannelId>,
    /// The actor has no channels left and is no longer a participant.
    pub removed: bool,
    pub released_locks: Vec<ElementId>,
}

pub(crate) struct Session {
    pub(crate) document_id: DocumentId,
    pub(crate) version: u64,
    /// Committed operations, oldest first, ending at `version`.
    pub(crate) log: VecDeque<Operation>,
    pub(crate) participants: BTreeMap<ActorId, Participant>,
    pub(crate) locks: BTreeMap<ElementId, Lock>,
    pub(crate) last_activity: u64,
    /// Set once the session is removed from the registry.
    pub(crate) retired: bool,
}

impl Session {
    pub(crate) fn new(document_id: impl Into<DocumentId>, now: u64) -> Self {
        Self {
            document_id: document_id.into(),
            version: 0,
            log: VecDeque::new(),
            participants: BTreeMap::new(),
            locks: BTreeMap::new(),
            last_activity: now,
            retired: false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub(crate) fn touch(&mut self, now: u64) {
        self.last_activity = self.last_activity.max(now);
    }

    pub(crate) fn require_participant(&self, actor_id: &str) -> Result<(), EngineError> {
        if self.participants.contains_key(actor_id) {
            Ok(())
        } else {
            Err(EngineError::NotParticipant {
                document_id: self.document_id.clone(),
                actor_id: actor_id.to_string(),
            })
        }
    }

    /// Add a channel for `actor_id`, creating the participant if needed.
    pub(crate) fn join(
        &mut self,
        actor_id: &str,
        info: ActorInfo,
        channel: ChannelId,
        now: u64,
        max_participants: usize,
    ) -> Result<(), EngineError> {
        match self.participants.get_mut(actor_id) {
            Some(participant) => {
                if let Some(color) = &info.color {
                    participant.color = color.clone();
                }
                participant.info = info;
                participant.channels.insert(channel);
            }
            None => {
                if self.participants.len() >= max_participants {
                    return Err(EngineError::SessionFull {
                        document_id: self.document_id.clone(),
                        limit: max_participants,
                    });
                }
                let color = info.color.clone().unwrap_or_else(|| actor_color(actor_id));
                self.participants.insert(
                    actor_id.to_string(),
                    Participant {
                        info,
                        color,
                        channels: BTreeSet::from([channel]),
                        presence: None,
                        joined_at: now,
                        presence_broadcast_at: None,
                    },
                );
                log::info!("Actor {actor_id} joined document {}", self.document_id);
            }
        }
        self.touch(now);
        Ok(())
    }

    /// Drop the given channels of an actor, or all of them when `only` is
    /// `None`. The participant and its locks go with its last channel.
    pub(crate) fn leave(
        &mut self,
        actor_id: &str,
        only: Option<&ChannelId>,
        now: u64,
    ) -> LeaveOutcome {
        let mut outcome = LeaveOutcome::default();

        if let Some(participant) = self.participants.get_mut(actor_id) {
            match only {
                Some(channel) => {
                    if participant.channels.remove(channel) {
                        outcome.channels.push(channel.clone());
                    }
                }
                None => outcome.channels = std::mem::take(&mut participant.channels).into_iter().collect(),
            }

            if participant.channels.is_empty() {
                self.participants.remove(actor_id);
                outcome.removed = true;
                outcome.released_locks = self.release_all(actor_id);
                log::info!(
                    "Actor {actor_id} left document {} ({} locks released)",
                    self.document_id,
                    outcome.released_locks.len()
                );
            }
            self.touch(now);
        }

        outcome.remaining = self.participants.keys().cloned().collect();
        outcome
    }

    /// Actors in this session that hold `channel`.
    pub(crate) fn actors_on(&self, channel: &ChannelId) -> Vec<ActorId> {
        self.participants
            .iter()
            .filter(|(_, participant)| participant.channels.contains(channel))
            .map(|(actor_id, _)| actor_id.clone())
            .collect()
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            document_id: self.document_id.clone(),
            version: self.version,
            participants: self
                .participants
                .iter()
                .map(|(actor_id, p)| ParticipantSnapshot {
                    actor_id: actor_id.clone(),
                    display_name: p.info.display_name.clone(),
                    color: p.color.clone(),
                    channel_count: p.channels.len(),
                    joined_at: p.joined_at,
                    presence: p.presence.clone(),
                })
                .collect(),
            locks: self.locks.values().cloned().collect(),
            last_activity: self.last_activity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_twice_keeps_one_participant() {
        let mut session = Session::new("doc1", 0);
        session.join("alice", ActorInfo::new("Alice"), "tab-1".into(), 1, 10).unwrap();
        session.join("alice", ActorInfo::new("Alice"), "tab-2".into(), 2, 10).unwrap();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(snapshot.participants[0].channel_count, 2);
        assert_eq!(snapshot.participants[0].joined_at, 1);
        assert_eq!(snapshot.last_activity, 2);
    }

    #[test]
    fn test_leave_one_channel_keeps_participant() {
        let mut session = Session::new("doc1", 0);
        session.join("alice", ActorInfo::new("Alice"), "tab-1".into(), 0, 10).unwrap();
        session.join("alice", ActorInfo::new("Alice"), "tab-2".into(), 0, 10).unwrap();

        let outcome = session.leave("alice", Some(&"tab-1".into()), 5);
        assert!(!outcome.removed);
        assert_eq!(outcome.remaining, ["alice"]);

        let outcome = session.leave("alice", Some(&"tab-2".into()), 6);
        assert!(outcome.removed);
        assert!(outcome.remaining.is_empty());
        assert!(session.is_empty());
        assert_eq!(session.last_activity, 6);
    }

    #[test]
    fn test_leave_unknown_channel_is_noop() {
        let mut session = Session::new("doc1", 0);
        session.join("alice", ActorInfo::new("Alice"), "tab-1".into(), 0, 10).unwrap();

        let outcome = session.leave("alice", Some(&"other".into()), 1);
        assert!(outcome.channels.is_empty());
        assert!(!outcome.removed);

        let outcome = session.leave("bob", None, 1);
        assert_eq!(outcome, LeaveOutcome { remaining: vec!["alice".into()], ..Default::default() });
    }

    #[test]
    fn test_capacity_applies_to_new_actors_only() {
        let mut session = Session::new("doc1", 0);
        session.join("a", ActorInfo::default(), "1".into(), 0, 1).unwrap();
        session.join("a", ActorInfo::default(), "2".into(), 0, 1).unwrap();

        let err = session.join("b", ActorInfo::default(), "3".into(), 0, 1).unwrap_err();
        assert_eq!(err, EngineError::SessionFull { document_id: "doc1".into(), limit: 1 });
    }

    #[test]
    fn test_color_is_derived_unless_given() {
        let mut session = Session::new("doc1", 0);
        session.join("a", ActorInfo::default(), "1".into(), 0, 10).unwrap();
        let info = ActorInfo { display_name: "B".into(), color: Some("#112233".into()) };
        session.join("b", info, "2".into(), 0, 10).unwrap();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.participant("a").unwrap().color, actor_color("a"));
        assert_eq!(snapshot.participant("b").unwrap().color, "#112233");
    }

    #[test]
    fn test_actors_on_channel() {
        let mut session = Session::new("doc1", 0);
        session.join("a", ActorInfo::default(), "shared".into(), 0, 10).unwrap();
        session.join("b", ActorInfo::default(), "other".into(), 0, 10).unwrap();
        assert_eq!(session.actors_on(&"shared".into()), ["a"]);
    }

    #[test]
    fn test_channel_id_generate_is_unique() {
        assert_ne!(ChannelId::generate(), ChannelId::generate());
        assert_eq!(ChannelId::from("x").to_string(), "x");
    }
}
