//! Room fan-out: delivering derived events to everyone else in a document.
//!
//! The engine only ever names rooms (document ids) and opaque channels; how
//! bytes reach a socket is up to the [`RoomBroadcaster`] implementation.
//! [`RoomHub`] is an in-process one built on tokio broadcast channels, with
//! one channel per room and one receiver per subscribed connection. Only
//! [`RoomHub::subscribe`] hands out a receiver; [`RoomBroadcaster::join_room`]
//! records membership alone, and such a member is not counted as a recipient
//! until it subscribes.
//!
//! ```text
//! broadcast(room, event, payload, origin)
//!       │
//!       ▼
//! Room { sender } ──► Subscription(ch-A)  (origin: skipped)
//!                 ├─► Subscription(ch-B)
//!                 └─► Subscription(ch-C)
//! ```

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};

use crate::session::{ChannelId, DocumentId};

/// Transport-side collaborator that owns room membership and delivery.
pub trait RoomBroadcaster: Send + Sync {
    fn join_room(&self, room: &str, channel: &ChannelId);

    fn leave_room(&self, room: &str, channel: &ChannelId);

    /// Deliver to every channel in `room` except `origin`. Returns the number
    /// of channels the event was handed to.
    fn broadcast(&self, room: &str, event: &str, payload: &Value, origin: Option<&ChannelId>) -> usize;
}

/// One delivered room event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
    pub room: DocumentId,
    pub event: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<ChannelId>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_rooms: usize,
    pub active_channels: usize,
}

/// Lock-free counters shared with every subscription.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

struct Room {
    sender: broadcast::Sender<Arc<RoomMessage>>,
    /// Dropping a member's handle detaches its subscription.
    members: HashMap<ChannelId, watch::Sender<()>>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        Self {
            sender: broadcast::channel(capacity).0,
            members: HashMap::new(),
        }
    }

    /// Members other than `origin` holding a live subscription.
    fn listeners(&self, origin: Option<&ChannelId>) -> usize {
        self.members
            .iter()
            .filter(|(member, handle)| Some(*member) != origin && !handle.is_closed())
            .count()
    }
}

/// In-process room hub.
pub struct RoomHub {
    rooms: RwLock<HashMap<DocumentId, Room>>,
    /// Messages buffered per subscriber before it starts lagging
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl RoomHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Join `channel` to `room` and hand back its receiving end. A channel
    /// has one receiver per room; subscribing again detaches the previous one.
    pub fn subscribe(&self, room: &str, channel: &ChannelId) -> Subscription {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let entry = rooms
            .entry(room.to_string())
            .or_insert_with(|| Room::new(self.capacity));

        let (handle, attached) = watch::channel(());
        if entry.members.insert(channel.clone(), handle).is_some() {
            log::debug!("Channel {channel} resubscribed to room {room}");
        }

        Subscription {
            channel: channel.clone(),
            receiver: entry.sender.subscribe(),
            attached,
            stats: self.stats.clone(),
        }
    }

    pub fn members(&self, room: &str) -> Vec<ChannelId> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        let mut members: Vec<_> = rooms
            .get(room)
            .map(|room| room.members.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_rooms: rooms.len(),
            active_channels: rooms.values().map(|room| room.members.len()).sum(),
        }
    }
}

impl RoomBroadcaster for RoomHub {
    /// Record membership only. An existing subscription is kept; without one
    /// the channel receives nothing until it calls [`RoomHub::subscribe`].
    fn join_room(&self, room: &str, channel: &ChannelId) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        rooms
            .entry(room.to_string())
            .or_insert_with(|| Room::new(self.capacity))
            .members
            .entry(channel.clone())
            .or_insert_with(|| watch::channel(()).0);
    }

    /// Remove `channel` and detach its subscription.
    fn leave_room(&self, room: &str, channel: &ChannelId) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = rooms.get_mut(room) {
            entry.members.remove(channel);
            if entry.members.is_empty() {
                rooms.remove(room);
                log::debug!("Closed empty room {room}");
            }
        }
    }

    fn broadcast(&self, room: &str, event: &str, payload: &Value, origin: Option<&ChannelId>) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = rooms.get(room) else {
            return 0;
        };

        let recipients = entry.listeners(origin);
        if recipients == 0 {
            return 0;
        }

        let message = Arc::new(RoomMessage {
            room: room.to_string(),
            event: event.to_string(),
            payload: payload.clone(),
            origin: origin.cloned(),
        });
        if entry.sender.send(message).is_err() {
            log::debug!("Room {room} has no open receivers; {event} not delivered");
            return 0;
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        recipients
    }
}

/// Receiving end for one channel. Messages this channel originated are
/// skipped, and nothing is delivered once the channel leaves the room.
pub struct Subscription {
    channel: ChannelId,
    receiver: broadcast::Receiver<Arc<RoomMessage>>,
    /// Closed when the hub drops this member's handle.
    attached: watch::Receiver<()>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Whether the channel is still a member of the room.
    pub fn is_attached(&self) -> bool {
        self.attached.has_changed().is_ok()
    }

    /// Next message for this channel; `None` once the channel has left or
    /// the room is gone.
    pub async fn recv(&mut self) -> Option<Arc<RoomMessage>> {
        loop {
            if !self.is_attached() {
                return None;
            }
            let next = tokio::select! {
                biased;
                _ = self.attached.changed() => return None,
                next = self.receiver.recv() => next,
            };
            match next {
                Ok(message) if self.is_own(&message) => continue,
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(missed)) => self.record_lag(missed),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Arc<RoomMessage>> {
        if !self.is_attached() {
            return None;
        }
        loop {
            match self.receiver.try_recv() {
                Ok(message) if self.is_own(&message) => continue,
                Ok(message) => return Some(message),
                Err(TryRecvError::Lagged(missed)) => self.record_lag(missed),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    fn is_own(&self, message: &RoomMessage) -> bool {
        message.origin.as_ref() == Some(&self.channel)
    }

    fn record_lag(&self, missed: u64) {
        self.stats.messages_dropped.fetch_add(missed, Ordering::Relaxed);
        log::warn!("Channel {} lagged and missed {missed} room messages", self.channel);
    }
}
