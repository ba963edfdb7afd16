//! # protoflow-collab — Real-time collaboration engine for protocol graphs
//!
//! Tracks who is editing which document, orders their edits into one
//! history, hands out element locks and relays presence. The engine is
//! synchronous and memory-resident; transports feed it events and carry its
//! results.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  ClientEvent   ┌──────────────────────────────────┐
//! │  Transport  │ ─────────────► │ dispatch()                       │
//! │ (per socket)│ ◄───────────── │   └─ SessionRegistry             │
//! └──────┬──────┘     Reply      │        ├─ sequencer  (versions)  │
//!        │                       │        ├─ locks      (exclusive) │
//!        │  RoomEvent            │        ├─ presence   (advisory)  │
//!        ▼                       │        └─ reaper     (cleanup)   │
//! ┌──────────────┐               └──────────────────────────────────┘
//! │RoomBroadcaster│
//! │ (fan-out)    │
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`registry`] — Session map, configuration, join/leave
//! - [`sequencer`] — Operation ordering and transformation
//! - [`locks`] — Element-level exclusive locks
//! - [`presence`] — Cursor/selection/viewport per participant
//! - [`reaper`] — Removal of empty, stale sessions
//! - [`protocol`] — JSON events, replies and room events
//! - [`dispatch`] — Routing events to the registry
//! - [`broadcast`] — Room fan-out interface and in-process hub

pub mod broadcast;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod locks;
pub mod presence;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod sequencer;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, RoomBroadcaster, RoomHub, RoomMessage, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{disconnect, dispatch, dispatch_json, Dispatch, MembershipChange};
pub use error::{EngineError, ErrorKind};
pub use locks::{Lock, LockResult};
pub use presence::{actor_color, Presence, PresenceUpdate, Viewport};
pub use protocol::{Ack, ClientEvent, Reply, RoomEvent};
pub use reaper::{spawn_reaper, ReapReport};
pub use registry::{ChannelDeparture, EngineConfig, EngineStats, SessionRegistry};
pub use sequencer::AppliedOperation;
pub use session::{
    ActorId, ActorInfo, ChannelId, DocumentId, ElementId, LeaveOutcome, ParticipantSnapshot,
    SessionSnapshot,
};
