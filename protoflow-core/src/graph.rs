//! The protocol graph: an ordered tree of steps, parameters and annotations.
//!
//! Every node carries a free-form `kind`, a map of named fields and ordered
//! children. Field writes are independent of each other, so two authors can
//! edit different fields of the same step without conflicting.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::GraphError;
use crate::operation::{OpPayload, Operation, TEXT_FIELD};
use crate::path::ElementPath;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Node {
    /// Create a node with a fresh random id.
    pub fn new(kind: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind)
    }

    pub fn with_id(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            fields: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn child(mut self, node: Node) -> Self {
        self.children.push(node);
        self
    }

    pub fn text(&self) -> Option<&str> {
        self.fields.get(TEXT_FIELD).and_then(Value::as_str)
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(Node::subtree_len).sum::<usize>()
    }
}

/// A whole protocol document as a tree rooted at a synthetic `protocol` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolGraph {
    pub root: Node,
}

impl ProtocolGraph {
    pub fn new() -> Self {
        Self {
            root: Node::with_id("root", "protocol"),
        }
    }

    /// Build a graph whose root holds `steps` in order.
    pub fn with_steps(steps: impl IntoIterator<Item = Node>) -> Self {
        let mut graph = Self::new();
        graph.root.children.extend(steps);
        graph
    }

    pub fn node(&self, path: &ElementPath) -> Option<&Node> {
        path.indices()
            .iter()
            .try_fold(&self.root, |node, &index| node.children.get(index))
    }

    fn node_mut(&mut self, path: &ElementPath) -> Result<&mut Node, GraphError> {
        let mut node = &mut self.root;
        for &index in path.indices() {
            node = node
                .children
                .get_mut(index)
                .ok_or_else(|| GraphError::PathNotFound(path.clone()))?;
        }
        Ok(node)
    }

    /// Total number of nodes, root included.
    pub fn len(&self) -> usize {
        self.root.subtree_len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Apply one committed operation to the tree.
    pub fn apply(&mut self, op: &Operation) -> Result<(), GraphError> {
        let path = &op.element_path;
        if path.is_root() {
            return Err(GraphError::RootNotAddressable(op.id.clone()));
        }

        match &op.payload {
            OpPayload::Insert { node } => self.insert_at(path, node.clone()),
            OpPayload::Delete => self.remove_at(path).map(drop),
            OpPayload::SetField { field, value } => {
                self.node_mut(path)?.fields.insert(field.clone(), value.clone());
                Ok(())
            }
            OpPayload::SetText { value } => {
                self.node_mut(path)?
                    .fields
                    .insert(TEXT_FIELD.to_string(), Value::String(value.clone()));
                Ok(())
            }
            OpPayload::Move { to } => {
                let node = self.remove_at(path)?;
                // A failed destination must not lose the detached subtree.
                if let Err(err) = self.insert_at(to, node.clone()) {
                    self.insert_at(path, node)?;
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    fn insert_at(&mut self, path: &ElementPath, node: Node) -> Result<(), GraphError> {
        let parent_path = path.parent();
        let index = path
            .last_index()
            .ok_or_else(|| GraphError::PathNotFound(path.clone()))?;
        let parent = self.node_mut(&parent_path)?;
        if index > parent.children.len() {
            return Err(GraphError::IndexOutOfBounds {
                parent: parent_path,
                index,
                len: parent.children.len(),
            });
        }
        parent.children.insert(index, node);
        Ok(())
    }

    fn remove_at(&mut self, path: &ElementPath) -> Result<Node, GraphError> {
        let index = path
            .last_index()
            .ok_or_else(|| GraphError::PathNotFound(path.clone()))?;
        let parent = self.node_mut(&path.parent())?;
        if index >= parent.children.len() {
            return Err(GraphError::PathNotFound(path.clone()));
        }
        Ok(parent.children.remove(index))
    }
}

impl Default for ProtocolGraph {
    fn default() -> Self {
        Self::new()
    }
}
