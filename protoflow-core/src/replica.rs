//! Client-side replica of a protocol graph.
//!
//! A replica applies local edits optimistically, keeps them pending until the
//! sequencer acknowledges them, and folds in committed edits from other
//! authors strictly in version order:
//!
//! ```text
//!   edit() ──► pending [in-flight | queued ...] ──► send one at a time
//!                              ▲
//!   receive(committed v) ──────┘  buffered until v == version + 1,
//!                                 then transformed past pending edits
//! ```
//!
//! Only the head of the pending queue is ever in flight, so the sequencer
//! never transforms one of our edits against another of ours.

use std::collections::{BTreeMap, VecDeque};

use crate::error::GraphError;
use crate::graph::ProtocolGraph;
use crate::operation::{OpPayload, Operation};
use crate::path::ElementPath;
use crate::transform::{transform, Priority};

pub struct Replica {
    author_id: String,
    graph: ProtocolGraph,
    /// Last committed version folded into `graph`.
    version: u64,
    /// Local edits not yet acknowledged, oldest first.
    pending: VecDeque<Operation>,
    in_flight: bool,
    /// Id of an in-flight edit that a committed edit made void; the
    /// sequencer will reject it too.
    superseded: Option<String>,
    /// Rejection of the in-flight edit that overtook the committed edit
    /// voiding it.
    rejected: Option<String>,
    /// Committed edits that arrived ahead of a gap.
    early: BTreeMap<u64, Operation>,
    next_local: u64,
    needs_resync: bool,
}

impl Replica {
    pub fn new(author_id: impl Into<String>, graph: ProtocolGraph, version: u64) -> Self {
        Self {
            author_id: author_id.into(),
            graph,
            version,
            pending: VecDeque::new(),
            in_flight: false,
            superseded: None,
            rejected: None,
            early: BTreeMap::new(),
            next_local: 0,
            needs_resync: false,
        }
    }

    pub fn graph(&self) -> &ProtocolGraph {
        &self.graph
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn buffered_len(&self) -> usize {
        self.early.len()
    }

    /// Set when the replica can no longer reconcile on its own and must be
    /// rebuilt from a fresh snapshot.
    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    /// Apply a local edit and queue it. Returns the edit to send now, if the
    /// pipe to the sequencer is free.
    pub fn edit(
        &mut self,
        element_path: impl Into<ElementPath>,
        payload: OpPayload,
    ) -> Result<Option<Operation>, GraphError> {
        self.next_local += 1;
        let op = Operation::new(
            format!("{}-{}", self.author_id, self.next_local),
            self.version,
            element_path,
            payload,
        )
        .with_author(self.author_id.clone());

        self.graph.apply(&op)?;
        self.pending.push_back(op);
        Ok(self.send_next())
    }

    /// Fold in a committed edit, which may be an acknowledgment of our own.
    /// Returns the next local edit to send, if one became sendable.
    pub fn receive(&mut self, committed: Operation) -> Result<Option<Operation>, GraphError> {
        let Some(version) = committed.applied_version else {
            log::warn!("Ignoring uncommitted operation {}", committed.id);
            return Ok(None);
        };
        if version <= self.version {
            log::debug!("Ignoring already applied version {version}");
            return Ok(None);
        }

        self.early.insert(version, committed);

        let mut outgoing = None;
        while let Some(op) = self.early.remove(&(self.version + 1)) {
            if let Some(next) = self.integrate(op)? {
                outgoing = Some(next);
            }
        }
        Ok(outgoing)
    }

    /// The sequencer refused one of our edits.
    ///
    /// A rejection may arrive before the committed edits that explain it; it
    /// is then held until integration voids the in-flight edit.
    pub fn reject(&mut self, operation_id: &str) -> Option<Operation> {
        if self.superseded.as_deref() == Some(operation_id) {
            self.superseded = None;
            self.in_flight = false;
            return self.send_next();
        }

        let awaiting = self.in_flight
            && self.superseded.is_none()
            && self.pending.front().is_some_and(|head| head.id == operation_id);
        if awaiting {
            log::debug!("Operation {operation_id} rejected ahead of the edit voiding it");
            self.rejected = Some(operation_id.to_string());
            return None;
        }

        log::warn!("Operation {operation_id} rejected; replica must resync");
        self.needs_resync = true;
        None
    }

    fn integrate(&mut self, committed: Operation) -> Result<Option<Operation>, GraphError> {
        let version = committed.applied_version.unwrap_or(self.version + 1);

        let is_ack = self.in_flight
            && self.superseded.is_none()
            && committed.author_id == self.author_id
            && self.pending.front().is_some_and(|head| head.id == committed.id);

        if is_ack {
            if let Some(id) = self.rejected.take() {
                log::warn!("Operation {id} was both rejected and committed; replica must resync");
                self.needs_resync = true;
            }
            self.pending.pop_front();
            self.in_flight = false;
            self.version = version;
            return Ok(self.send_next());
        }

        let mut incoming = Some(committed);
        let mut rebased = VecDeque::with_capacity(self.pending.len());
        for (position, local) in std::mem::take(&mut self.pending).into_iter().enumerate() {
            let Some(theirs) = incoming.as_ref() else {
                rebased.push_back(local);
                continue;
            };

            let next_incoming = transform(theirs, &local, Priority::Later);
            match transform(&local, theirs, Priority::Earlier) {
                Some(local) => rebased.push_back(local),
                None if position == 0 && self.in_flight && self.superseded.is_none() => {
                    self.superseded = Some(local.id.clone());
                }
                None => log::debug!("Local operation {} superseded before sending", local.id),
            }
            incoming = next_incoming;
        }
        self.pending = rebased;

        if let Some(op) = incoming {
            if let Err(err) = self.graph.apply(&op) {
                self.needs_resync = true;
                return Err(err);
            }
        }
        self.version = version;

        if self.rejected.is_some() && self.rejected == self.superseded {
            self.rejected = None;
            self.superseded = None;
            self.in_flight = false;
        }
        Ok(self.send_next())
    }

    fn send_next(&mut self) -> Option<Operation> {
        if self.in_flight || self.needs_resync {
            return None;
        }
        let version = self.version;
        let head = self.pending.front_mut()?;
        head.base_version = version;
        self.in_flight = true;
        Some(head.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use serde_json::json;

    fn graph() -> ProtocolGraph {
        ProtocolGraph::with_steps([
            Node::with_id("s0", "step"),
            Node::with_id("s1", "step"),
            Node::with_id("s2", "step"),
        ])
    }

    fn committed(mut op: Operation, author: &str, version: u64) -> Operation {
        op.author_id = author.into();
        op.applied_version = Some(version);
        op
    }

    #[test]
    fn test_replica_creation() {
        let replica = Replica::new("alice", graph(), 4);
        assert_eq!(replica.author_id(), "alice");
        assert_eq!(replica.version(), 4);
        assert_eq!(replica.pending_len(), 0);
        assert!(!replica.needs_resync());
    }

    #[test]
    fn test_only_one_edit_in_flight() {
        let mut replica = Replica::new("alice", graph(), 0);
        let first = replica
            .edit([0], OpPayload::SetText { value: "a".into() })
            .unwrap();
        let second = replica
            .edit([1], OpPayload::SetText { value: "b".into() })
            .unwrap();

        assert_eq!(first.unwrap().id, "alice-1");
        assert!(second.is_none());
        assert_eq!(replica.pending_len(), 2);

        // Ack the first; the second goes out against the new version.
        let ack = committed(Operation::set_text("alice-1", 0, [0], "a"), "alice", 1);
        let next = replica.receive(ack).unwrap().unwrap();
        assert_eq!(next.id, "alice-2");
        assert_eq!(next.base_version, 1);
        assert_eq!(replica.version(), 1);
    }

    #[test]
    fn test_out_of_order_delivery_is_buffered() {
        let mut replica = Replica::new("bob", graph(), 0);

        let v2 = committed(Operation::set_text("x2", 1, [1], "second"), "alice", 2);
        let v1 = committed(Operation::set_text("x1", 0, [0], "first"), "alice", 1);

        replica.receive(v2).unwrap();
        assert_eq!(replica.version(), 0);
        assert_eq!(replica.buffered_len(), 1);

        replica.receive(v1).unwrap();
        assert_eq!(replica.version(), 2);
        assert_eq!(replica.buffered_len(), 0);
        assert_eq!(replica.graph().node(&ElementPath::from([1])).unwrap().text(), Some("second"));
    }

    #[test]
    fn test_remote_insert_rebases_pending_edit() {
        let mut replica = Replica::new("bob", graph(), 0);
        replica
            .edit([1], OpPayload::SetField { field: "volume".into(), value: json!(7) })
            .unwrap();

        let remote = committed(
            Operation::insert("a-1", 0, [0], Node::with_id("new", "step")),
            "alice",
            1,
        );
        replica.receive(remote).unwrap();

        assert_eq!(replica.graph().node(&ElementPath::from([0])).unwrap().id, "new");
        let s1 = replica.graph().node(&ElementPath::from([2])).unwrap();
        assert_eq!((s1.id.as_str(), &s1.fields["volume"]), ("s1", &json!(7)));
    }

    #[test]
    fn test_superseded_in_flight_edit_expects_rejection() {
        let mut replica = Replica::new("bob", graph(), 0);
        replica.edit([2], OpPayload::SetText { value: "mine".into() }).unwrap();
        replica.edit([0], OpPayload::SetText { value: "other".into() }).unwrap();

        // Alice deletes the step we were editing; it commits first.
        let remote = committed(Operation::delete("a-1", 0, [2]), "alice", 1);
        replica.receive(remote).unwrap();
        assert_eq!(replica.pending_len(), 1);

        // The sequencer rejects our first edit; the queued one goes out.
        let next = replica.reject("bob-1").unwrap();
        assert_eq!(next.id, "bob-2");
        assert_eq!(next.base_version, 1);
        assert!(!replica.needs_resync());
    }

    #[test]
    fn test_rejection_ahead_of_voiding_edit() {
        let mut replica = Replica::new("bob", graph(), 0);
        replica.edit([2], OpPayload::SetText { value: "mine".into() }).unwrap();
        replica.edit([0], OpPayload::SetText { value: "other".into() }).unwrap();

        // The rejection overtakes alice's delete.
        assert!(replica.reject("bob-1").is_none());
        assert!(!replica.needs_resync());

        let remote = committed(Operation::delete("a-1", 0, [2]), "alice", 1);
        let next = replica.receive(remote).unwrap().unwrap();
        assert_eq!(next.id, "bob-2");
        assert_eq!(next.base_version, 1);
        assert!(!replica.needs_resync());
    }

    #[test]
    fn test_unexpected_rejection_requires_resync() {
        let mut replica = Replica::new("bob", graph(), 0);
        replica.edit([0], OpPayload::Delete).unwrap();
        assert!(replica.reject("bob-9").is_none());
        assert!(replica.needs_resync());
        assert!(replica.edit([0], OpPayload::Delete).unwrap().is_none());
    }

    #[test]
    fn test_rejected_then_acknowledged_requires_resync() {
        let mut replica = Replica::new("bob", graph(), 0);
        replica.edit([0], OpPayload::SetText { value: "a".into() }).unwrap();
        replica.reject("bob-1");

        let ack = committed(Operation::set_text("bob-1", 0, [0], "a"), "bob", 1);
        replica.receive(ack).unwrap();
        assert!(replica.needs_resync());
    }

    #[test]
    fn test_stale_and_uncommitted_are_ignored() {
        let mut replica = Replica::new("bob", graph(), 3);
        let old = committed(Operation::delete("x", 1, [0]), "alice", 2);
        assert!(replica.receive(old).unwrap().is_none());
        assert!(replica.receive(Operation::delete("y", 3, [0])).unwrap().is_none());
        assert_eq!(replica.graph().root.children.len(), 3);
    }
}
