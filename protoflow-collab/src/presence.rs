//! Live presence: who is looking at what.
//!
//! ## Architecture
//!
//! ```text
//! presence event
//!       │
//!       ▼
//! SessionRegistry::update_user_presence()
//!       │  always stored (last write wins)
//!       ▼
//! PresenceUpdate { presences, broadcast }
//!       │  broadcast = false while the actor's last fan-out is
//!       ▼  younger than presence_min_interval_ms (~30 fps)
//! room fan-out
//! ```
//!
//! Presence is advisory. It carries no authoritative state, keeps no history
//! and disappears with the participant.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use protoflow_core::ElementPath;

use crate::error::EngineError;
use crate::registry::SessionRegistry;
use crate::session::{ActorId, ElementId, Session};

/// Visible region of the document in the client's view.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    #[serde(default = "Viewport::default_zoom")]
    pub zoom: f64,
}

impl Viewport {
    fn default_zoom() -> f64 {
        1.0
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<ElementPath>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selection: Vec<ElementId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    /// Client-specific fields, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// Stamped by the engine on receipt.
    #[serde(default)]
    pub updated_at: u64,
}

impl Presence {
    pub fn at(cursor: impl Into<ElementPath>) -> Self {
        Self {
            cursor: Some(cursor.into()),
            ..Self::default()
        }
    }

    pub fn with_selection(mut self, selection: impl IntoIterator<Item = impl Into<ElementId>>) -> Self {
        self.selection = selection.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    /// Presence of every participant that has published one.
    pub presences: BTreeMap<ActorId, Presence>,
    /// Whether this update should be fanned out to the room. A throttled
    /// update is stored but never fanned out later.
    pub broadcast: bool,
}

impl Session {
    pub(crate) fn update_presence(
        &mut self,
        actor_id: &str,
        mut presence: Presence,
        now: u64,
        min_interval_ms: u64,
    ) -> Result<PresenceUpdate, EngineError> {
        self.require_participant(actor_id)?;
        presence.updated_at = now;

        let mut broadcast = false;
        if let Some(participant) = self.participants.get_mut(actor_id) {
            broadcast = match participant.presence_broadcast_at {
                Some(last) => now.saturating_sub(last) >= min_interval_ms,
                None => true,
            };
            if broadcast {
                participant.presence_broadcast_at = Some(now);
            }
            participant.presence = Some(presence);
        }
        self.touch(now);

        Ok(PresenceUpdate {
            presences: self
                .participants
                .iter()
                .filter_map(|(actor_id, p)| p.presence.clone().map(|presence| (actor_id.clone(), presence)))
                .collect(),
            broadcast,
        })
    }
}

impl SessionRegistry {
    /// Overwrite the actor's presence and return everyone's.
    ///
    /// At most one update per actor is fanned out per
    /// `presence_min_interval_ms`; the rest only replace the stored state.
    /// A transport that wants peers to see the final position of a burst
    /// re-sends the latest presence once the client goes idle.
    pub fn update_user_presence(
        &self,
        document_id: &str,
        actor_id: &str,
        presence: Presence,
    ) -> Result<PresenceUpdate, EngineError> {
        let now = self.now();
        let min_interval = self.config.presence_min_interval_ms;

        let update = self
            .with_session(document_id, false, |session| {
                session.update_presence(actor_id, presence.clone(), now, min_interval)
            })?
            .ok_or_else(|| EngineError::SessionNotFound(document_id.to_string()))?;

        log::trace!(
            "Presence from {actor_id} in {document_id} (broadcast: {})",
            update.broadcast
        );
        Ok(update)
    }
}

/// Stable, visually distinct `#rrggbb` color for an actor id.
///
/// The hue comes from an FNV-1a hash of the id, so an actor keeps its color
/// across sessions and processes.
pub fn actor_color(actor_id: &str) -> String {
    let hash = actor_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        });
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);

    let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    format!("#{:02x}{:02x}{:02x}", channel(r), channel(g), channel(b))
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
