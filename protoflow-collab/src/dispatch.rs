//! Synchronous event routing.
//!
//! ```text
//! ClientEvent ──► dispatch() ──► registry entry point
//!                     │
//!                     ▼
//!   Dispatch { reply ──► sender only
//!              broadcast ──► room, minus sender
//!              membership ──► join/leave transport rooms }
//! ```
//!
//! Failures produce a reply and nothing else: other participants never see
//! an actor's failed attempt.

use crate::broadcast::RoomBroadcaster;
use crate::error::EngineError;
use crate::protocol::{Ack, ClientEvent, Reply, RoomEvent};
use crate::registry::SessionRegistry;
use crate::session::{ActorInfo, ChannelId, DocumentId, LeaveOutcome};

/// A change to which transport channels belong to a document's room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Join { room: DocumentId, channel: ChannelId },
    Leave { room: DocumentId, channel: ChannelId },
}

/// Everything a transport must do in response to one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Channel the event arrived on.
    pub origin: ChannelId,
    pub reply: Reply,
    pub broadcast: Option<RoomEvent>,
    pub membership: Vec<MembershipChange>,
}

impl Dispatch {
    fn ack(origin: ChannelId, event: &'static str, result: Ack) -> Self {
        Self {
            origin,
            reply: Reply::Ack { event, result },
            broadcast: None,
            membership: Vec::new(),
        }
    }

    fn failure(origin: ChannelId, event: &'static str, err: &EngineError) -> Self {
        Self {
            origin,
            reply: Reply::failure(event, err),
            broadcast: None,
            membership: Vec::new(),
        }
    }

    fn with_broadcast(mut self, event: RoomEvent) -> Self {
        self.broadcast = Some(event);
        self
    }

    /// Apply membership changes, then deliver the broadcast to everyone in
    /// the room except the origin. Returns the number of recipients.
    pub fn fan_out<B: RoomBroadcaster + ?Sized>(&self, broadcaster: &B) -> usize {
        for change in &self.membership {
            match change {
                MembershipChange::Join { room, channel } => broadcaster.join_room(room, channel),
                MembershipChange::Leave { room, channel } => broadcaster.leave_room(room, channel),
            }
        }

        match &self.broadcast {
            Some(event) => broadcaster.broadcast(
                event.document_id(),
                event.name(),
                &event.payload(),
                Some(&self.origin),
            ),
            None => 0,
        }
    }
}

/// Route one event to the registry.
pub fn dispatch(registry: &SessionRegistry, event: ClientEvent) -> Dispatch {
    let kind = event.kind();
    let origin = event.channel().clone();

    match route(registry, event, origin.clone()) {
        Ok(dispatch) => dispatch,
        Err(err) => {
            log::warn!("{kind} event from channel {origin} failed: {err}");
            Dispatch::failure(origin, kind, &err)
        }
    }
}

/// Decode a JSON frame and dispatch it. An undecodable frame only gets a
/// failure reply.
pub fn dispatch_json(registry: &SessionRegistry, text: &str) -> Result<Dispatch, Reply> {
    match ClientEvent::decode(text) {
        Ok(event) => Ok(dispatch(registry, event)),
        Err(err) => {
            log::warn!("Rejected malformed event: {err}");
            Err(Reply::failure("unknown", &err.into()))
        }
    }
}

/// A transport channel closed: leave every session it had joined. One
/// dispatch per affected actor; their replies have nobody to go to.
pub fn disconnect(registry: &SessionRegistry, channel: &ChannelId) -> Vec<Dispatch> {
    registry
        .disconnect_channel(channel)
        .into_iter()
        .map(|left| departure(channel.clone(), "disconnect", left.document_id, left.actor_id, left.outcome))
        .collect()
}

fn route(registry: &SessionRegistry, event: ClientEvent, origin: ChannelId) -> Result<Dispatch, EngineError> {
    let kind = event.kind();

    let dispatch = match event {
        ClientEvent::Join {
            document_id,
            actor_id,
            channel,
            display_name,
            color,
        } => {
            let info = ActorInfo { display_name, color };
            let snapshot = registry.join_session(&document_id, &actor_id, info, channel.clone())?;

            // Only the first channel of an actor announces it.
            let announce = snapshot
                .participant(&actor_id)
                .filter(|participant| participant.channel_count == 1)
                .cloned()
                .map(|participant| RoomEvent::ParticipantJoined {
                    document_id: document_id.clone(),
                    participant,
                });

            let mut dispatch = Dispatch::ack(origin, kind, Ack::Joined(snapshot));
            dispatch.broadcast = announce;
            dispatch.membership.push(MembershipChange::Join { room: document_id, channel });
            dispatch
        }

        ClientEvent::Leave {
            document_id,
            actor_id,
            channel,
        } => {
            let outcome = registry.leave_session(&document_id, &actor_id, &channel)?;
            departure(origin, kind, document_id, actor_id, outcome)
        }

        ClientEvent::DisconnectAll {
            document_id, actor_id, ..
        } => {
            let outcome = registry.disconnect_actor(&document_id, &actor_id)?;
            departure(origin, kind, document_id, actor_id, outcome)
        }

        ClientEvent::Operation {
            document_id,
            actor_id,
            operation,
            ..
        } => {
            let applied = registry.apply_operation(&document_id, operation, &actor_id)?;
            let broadcast = (!applied.duplicate).then(|| RoomEvent::OperationApplied {
                document_id,
                operation: applied.operation.clone(),
            });

            let mut dispatch = Dispatch::ack(origin, kind, Ack::Applied(applied));
            dispatch.broadcast = broadcast;
            dispatch
        }

        ClientEvent::Lock {
            document_id,
            actor_id,
            element_id,
            ..
        } => {
            let result = registry.lock_element(&document_id, &element_id, &actor_id)?;
            let granted = result.success;
            let dispatch = Dispatch::ack(origin, kind, Ack::Lock(result));
            if granted {
                dispatch.with_broadcast(RoomEvent::ElementLocked {
                    document_id,
                    element_id,
                    locked_by: actor_id,
                })
            } else {
                dispatch
            }
        }

        ClientEvent::Unlock {
            document_id,
            actor_id,
            element_id,
            ..
        } => {
            let released = registry.unlock_element(&document_id, &element_id, &actor_id)?;
            let dispatch = Dispatch::ack(origin, kind, Ack::Unlock { released });
            if released {
                dispatch.with_broadcast(RoomEvent::ElementsUnlocked {
                    document_id,
                    element_ids: vec![element_id],
                })
            } else {
                dispatch
            }
        }

        ClientEvent::Presence {
            document_id,
            actor_id,
            presence,
            ..
        } => {
            let update = registry.update_user_presence(&document_id, &actor_id, presence)?;
            let broadcast = if update.broadcast {
                update.presences.get(&actor_id).cloned().map(|presence| RoomEvent::PresenceUpdated {
                    document_id,
                    actor_id,
                    presence,
                })
            } else {
                None
            };

            let mut dispatch = Dispatch::ack(origin, kind, Ack::Presence(update));
            dispatch.broadcast = broadcast;
            dispatch
        }
    };

    Ok(dispatch)
}

fn departure(
    origin: ChannelId,
    kind: &'static str,
    document_id: DocumentId,
    actor_id: String,
    outcome: LeaveOutcome,
) -> Dispatch {
    let membership = outcome
        .channels
        .iter()
        .map(|channel| MembershipChange::Leave {
            room: document_id.clone(),
            channel: channel.clone(),
        })
        .collect();
    let broadcast = outcome.removed.then(|| RoomEvent::ParticipantLeft {
        document_id,
        actor_id,
        released_locks: outcome.released_locks.clone(),
    });

    let mut dispatch = Dispatch::ack(origin, kind, Ack::Left(outcome));
    dispatch.broadcast = broadcast;
    dispatch.membership = membership;
    dispatch
}

#[cfg(test)]
mod tests {
    use super::*;
    use protoflow_core::Operation;
    use serde_json::json;

    fn join(registry: &SessionRegistry, actor: &str, channel: &str) -> Dispatch {
        dispatch(
            registry,
            ClientEvent::Join {
                document_id: "doc1".into(),
                actor_id: actor.into(),
                channel: channel.into(),
                display_name: actor.to_uppercase(),
                color: None,
            },
        )
    }

    #[test]
    fn test_join_announces_first_channel_only() {
        let registry = SessionRegistry::with_defaults();

        let first = join(&registry, "alice", "a-1");
        assert!(first.reply.is_ack());
        assert!(matches!(first.broadcast, Some(RoomEvent::ParticipantJoined { .. })));
        assert_eq!(
            first.membership,
            [MembershipChange::Join { room: "doc1".into(), channel: "a-1".into() }]
        );

        let second = join(&registry, "alice", "a-2");
        assert!(second.broadcast.is_none());
        assert_eq!(second.membership.len(), 1);
    }

    #[test]
    fn test_operation_is_broadcast_transformed() {
        let registry = SessionRegistry::with_defaults();
        join(&registry, "alice", "a");

        let op = Operation::set_text("1", 0, [2], "Step 1");
        let result = dispatch(
            &registry,
            ClientEvent::Operation {
                document_id: "doc1".into(),
                actor_id: "alice".into(),
                channel: "a".into(),
                operation: op,
            },
        );

        let Some(RoomEvent::OperationApplied { operation, .. }) = &result.broadcast else {
            panic!("expected an operationApplied broadcast");
        };
        assert_eq!(operation.applied_version, Some(1));
        assert_eq!(operation.author_id, "alice");
    }

    #[test]
    fn test_failure_is_reply_only() {
        let registry = SessionRegistry::with_defaults();
        let result = dispatch(
            &registry,
            ClientEvent::Lock {
                document_id: "doc1".into(),
                actor_id: "alice".into(),
                channel: "a".into(),
                element_id: "e1".into(),
            },
        );

        assert_eq!(
            result.reply,
            Reply::Failure {
                event: "lock",
                code: "sessionNotFound",
                message: "no session for document doc1".into(),
            }
        );
        assert!(result.broadcast.is_none());
        assert!(result.membership.is_empty());
    }

    #[test]
    fn test_denied_lock_is_acked_without_broadcast() {
        let registry = SessionRegistry::with_defaults();
        join(&registry, "alice", "a");
        join(&registry, "bob", "b");
        let lock = |actor: &str, channel: &str| {
            dispatch(
                &registry,
                ClientEvent::Lock {
                    document_id: "doc1".into(),
                    actor_id: actor.into(),
                    channel: channel.into(),
                    element_id: "e5".into(),
                },
            )
        };

        assert!(lock("alice", "a").broadcast.is_some());
        let denied = lock("bob", "b");
        assert!(denied.broadcast.is_none());
        assert_eq!(
            serde_json::to_value(&denied.reply).unwrap(),
            json!({ "type": "ack", "event": "lock", "result": { "success": false, "lockedBy": "alice" } })
        );
    }

    #[test]
    fn test_disconnect_all_leaves_every_channel() {
        let registry = SessionRegistry::with_defaults();
        join(&registry, "alice", "a-1");
        join(&registry, "alice", "a-2");

        let result = dispatch(
            &registry,
            ClientEvent::DisconnectAll {
                document_id: "doc1".into(),
                actor_id: "alice".into(),
                channel: "a-1".into(),
            },
        );
        assert_eq!(result.membership.len(), 2);
        assert!(matches!(
            result.broadcast,
            Some(RoomEvent::ParticipantLeft { ref actor_id, .. }) if actor_id == "alice"
        ));
    }

    #[test]
    fn test_closed_channel_leaves_every_document() {
        let registry = SessionRegistry::with_defaults();
        join(&registry, "alice", "shared");
        dispatch(
            &registry,
            ClientEvent::Join {
                document_id: "doc2".into(),
                actor_id: "alice".into(),
                channel: "shared".into(),
                display_name: "ALICE".into(),
                color: None,
            },
        );
        join(&registry, "alice", "other");

        let results = disconnect(&registry, &"shared".into());
        assert_eq!(results.len(), 2);
        // Still connected to doc1 through another channel.
        assert!(results[0].broadcast.is_none());
        assert!(matches!(results[1].broadcast, Some(RoomEvent::ParticipantLeft { ref document_id, .. }) if document_id == "doc2"));
        assert!(results.iter().all(|d| d.membership.len() == 1));
    }

    #[test]
    fn test_dispatch_json_rejects_garbage() {
        let registry = SessionRegistry::with_defaults();
        let reply = dispatch_json(&registry, r#"{ "type": "teleport" }"#).unwrap_err();
        assert!(matches!(reply, Reply::Failure { code: "validation", .. }));
        assert_eq!(registry.session_count(), 0);
    }
}
