//! # protoflow-core — Document model for collaborative protocol editing
//!
//! A protocol is an ordered tree of steps. Authors edit it through a closed
//! set of [`Operation`]s that a central sequencer orders into one history.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   Operation (JSON)   ┌──────────────┐
//! │  Replica    │ ───────────────────► │  Sequencer   │
//! │ (per user)  │ ◄─────────────────── │ (per session)│
//! └──────┬──────┘   committed ops      └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐                      ┌──────────────┐
//! │ProtocolGraph│                      │  transform() │
//! │   (local)   │                      │  vs. log     │
//! └─────────────┘                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`path`] — Element addressing by child indices
//! - [`operation`] — Edit operations and their wire shape
//! - [`graph`] — The protocol tree and how operations apply to it
//! - [`transform`] — Operational transform between concurrent edits
//! - [`replica`] — Client-side optimistic copy with pending edits
//! - [`error`] — Graph and validation errors

pub mod error;
pub mod graph;
pub mod operation;
pub mod path;
pub mod replica;
pub mod transform;

pub use error::{GraphError, ValidationError};
pub use graph::{Node, ProtocolGraph};
pub use operation::{OpPayload, Operation, TEXT_FIELD};
pub use path::{ElementPath, MAX_INDEX};
pub use replica::Replica;
pub use transform::{transform, transform_all, Priority};
