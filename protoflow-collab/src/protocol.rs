//! JSON wire protocol between transports and the engine.
//!
//! Inbound events are tagged by `type`:
//!
//! ```json
//! { "type": "lock", "documentId": "doc1", "actorId": "alice", "channel": "c-1", "elementId": "e5" }
//! ```
//!
//! Every event yields a [`Reply`] for the sender and, on success, possibly a
//! [`RoomEvent`] for everyone else in the document's room.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use protoflow_core::{Operation, ValidationError};

use crate::error::EngineError;
use crate::locks::LockResult;
use crate::presence::{Presence, PresenceUpdate};
use crate::sequencer::AppliedOperation;
use crate::session::{ActorId, ChannelId, DocumentId, ElementId, LeaveOutcome, ParticipantSnapshot, SessionSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Join {
        document_id: DocumentId,
        actor_id: ActorId,
        channel: ChannelId,
        #[serde(default)]
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },
    Leave {
        document_id: DocumentId,
        actor_id: ActorId,
        channel: ChannelId,
    },
    Operation {
        document_id: DocumentId,
        actor_id: ActorId,
        channel: ChannelId,
        operation: Operation,
    },
    Lock {
        document_id: DocumentId,
        actor_id: ActorId,
        channel: ChannelId,
        element_id: ElementId,
    },
    Unlock {
        document_id: DocumentId,
        actor_id: ActorId,
        channel: ChannelId,
        element_id: ElementId,
    },
    Presence {
        document_id: DocumentId,
        actor_id: ActorId,
        channel: ChannelId,
        presence: Presence,
    },
    /// Drop every channel of the actor in this document.
    DisconnectAll {
        document_id: DocumentId,
        actor_id: ActorId,
        channel: ChannelId,
    },
}

impl ClientEvent {
    /// Decode one inbound frame. Unknown event or operation kinds fail here.
    pub fn decode(text: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(text).map_err(|e| ValidationError::MalformedEvent(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::Join { .. } => "join",
            ClientEvent::Leave { .. } => "leave",
            ClientEvent::Operation { .. } => "operation",
            ClientEvent::Lock { .. } => "lock",
            ClientEvent::Unlock { .. } => "unlock",
            ClientEvent::Presence { .. } => "presence",
            ClientEvent::DisconnectAll { .. } => "disconnectAll",
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            ClientEvent::Join { document_id, .. }
            | ClientEvent::Leave { document_id, .. }
            | ClientEvent::Operation { document_id, .. }
            | ClientEvent::Lock { document_id, .. }
            | ClientEvent::Unlock { document_id, .. }
            | ClientEvent::Presence { document_id, .. }
            | ClientEvent::DisconnectAll { document_id, .. } => document_id,
        }
    }

    pub fn actor_id(&self) -> &str {
        match self {
            ClientEvent::Join { actor_id, .. }
            | ClientEvent::Leave { actor_id, .. }
            | ClientEvent::Operation { actor_id, .. }
            | ClientEvent::Lock { actor_id, .. }
            | ClientEvent::Unlock { actor_id, .. }
            | ClientEvent::Presence { actor_id, .. }
            | ClientEvent::DisconnectAll { actor_id, .. } => actor_id,
        }
    }

    pub fn channel(&self) -> &ChannelId {
        match self {
            ClientEvent::Join { channel, .. }
            | ClientEvent::Leave { channel, .. }
            | ClientEvent::Operation { channel, .. }
            | ClientEvent::Lock { channel, .. }
            | ClientEvent::Unlock { channel, .. }
            | ClientEvent::Presence { channel, .. }
            | ClientEvent::DisconnectAll { channel, .. } => channel,
        }
    }
}

/// Successful result of an event, sent back to its sender.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Ack {
    Joined(SessionSnapshot),
    Left(LeaveOutcome),
    Applied(AppliedOperation),
    Lock(LockResult),
    Unlock { released: bool },
    Presence(PresenceUpdate),
}

/// What the sender of an event gets back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Reply {
    Ack { event: &'static str, result: Ack },
    Failure { event: &'static str, code: &'static str, message: String },
}

impl Reply {
    pub fn failure(event: &'static str, err: &EngineError) -> Self {
        Reply::Failure {
            event,
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Reply::Ack { .. })
    }
}

/// Event fanned out to the rest of a document's room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RoomEvent {
    ParticipantJoined {
        document_id: DocumentId,
        participant: ParticipantSnapshot,
    },
    ParticipantLeft {
        document_id: DocumentId,
        actor_id: ActorId,
        released_locks: Vec<ElementId>,
    },
    OperationApplied {
        document_id: DocumentId,
        operation: Operation,
    },
    ElementLocked {
        document_id: DocumentId,
        element_id: ElementId,
        locked_by: ActorId,
    },
    ElementsUnlocked {
        document_id: DocumentId,
        element_ids: Vec<ElementId>,
    },
    PresenceUpdated {
        document_id: DocumentId,
        actor_id: ActorId,
        presence: Presence,
    },
}

impl RoomEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RoomEvent::ParticipantJoined { .. } => "participantJoined",
            RoomEvent::ParticipantLeft { .. } => "participantLeft",
            RoomEvent::OperationApplied { .. } => "operationApplied",
            RoomEvent::ElementLocked { .. } => "elementLocked",
            RoomEvent::ElementsUnlocked { .. } => "elementsUnlocked",
            RoomEvent::PresenceUpdated { .. } => "presenceUpdated",
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            RoomEvent::ParticipantJoined { document_id, .. }
            | RoomEvent::ParticipantLeft { document_id, .. }
            | RoomEvent::OperationApplied { document_id, .. }
            | RoomEvent::ElementLocked { document_id, .. }
            | RoomEvent::ElementsUnlocked { document_id, .. }
            | RoomEvent::PresenceUpdated { document_id, .. } => document_id,
        }
    }

    /// JSON body for a transport.
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|err| {
            log::error!("Failed to encode {} event: {err}", self.name());
            Value::Null
        })
    }
}
