//! Edit operations over a protocol graph.
//!
//! Operations form a closed set. On the wire they are flat JSON objects
//! tagged by `type`:
//!
//! ```json
//! { "id": "1", "baseVersion": 0, "elementPath": [2], "type": "setText", "value": "Step 1" }
//! ```
//!
//! Any other `type` fails to deserialize and never reaches the sequencer.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::graph::Node;
use crate::path::ElementPath;

/// Field written by [`OpPayload::SetText`].
pub const TEXT_FIELD: &str = "text";

/// Kind-specific part of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OpPayload {
    /// Insert `node` so that it ends up at `elementPath`.
    Insert { node: Node },
    /// Remove the subtree at `elementPath`.
    Delete,
    /// Overwrite one field of the element.
    SetField { field: String, value: Value },
    /// Overwrite the element's `text` field.
    SetText { value: String },
    /// Reorder among siblings: detach the subtree at `elementPath` and
    /// re-insert it at `to`, addressed in the tree after the detach. `to`
    /// must have the same parent.
    Move { to: ElementPath },
}

impl OpPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            OpPayload::Insert { .. } => "insert",
            OpPayload::Delete => "delete",
            OpPayload::SetField { .. } => "setField",
            OpPayload::SetText { .. } => "setText",
            OpPayload::Move { .. } => "move",
        }
    }

    /// Field written by this payload, if it is a field write.
    pub fn written_field(&self) -> Option<&str> {
        match self {
            OpPayload::SetField { field, .. } => Some(field),
            OpPayload::SetText { .. } => Some(TEXT_FIELD),
            _ => None,
        }
    }
}

/// A single edit submitted by an author against a known version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub author_id: String,
    /// Version the author observed when producing the edit.
    #[serde(default)]
    pub base_version: u64,
    #[serde(default)]
    pub element_path: ElementPath,
    #[serde(flatten)]
    pub payload: OpPayload,
    /// Set once the sequencer has committed the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_version: Option<u64>,
}

impl Operation {
    pub fn new(
        id: impl Into<String>,
        base_version: u64,
        element_path: impl Into<ElementPath>,
        payload: OpPayload,
    ) -> Self {
        Self {
            id: id.into(),
            document_id: String::new(),
            author_id: String::new(),
            base_version,
            element_path: element_path.into(),
            payload,
            applied_version: None,
        }
    }

    pub fn set_text(
        id: impl Into<String>,
        base_version: u64,
        element_path: impl Into<ElementPath>,
        value: impl Into<String>,
    ) -> Self {
        Self::new(id, base_version, element_path, OpPayload::SetText { value: value.into() })
    }

    pub fn set_field(
        id: impl Into<String>,
        base_version: u64,
        element_path: impl Into<ElementPath>,
        field: impl Into<String>,
        value: Value,
    ) -> Self {
        Self::new(
            id,
            base_version,
            element_path,
            OpPayload::SetField { field: field.into(), value },
        )
    }

    pub fn insert(
        id: impl Into<String>,
        base_version: u64,
        element_path: impl Into<ElementPath>,
        node: Node,
    ) -> Self {
        Self::new(id, base_version, element_path, OpPayload::Insert { node })
    }

    pub fn delete(id: impl Into<String>, base_version: u64, element_path: impl Into<ElementPath>) -> Self {
        Self::new(id, base_version, element_path, OpPayload::Delete)
    }

    pub fn move_to(
        id: impl Into<String>,
        base_version: u64,
        element_path: impl Into<ElementPath>,
        to: impl Into<ElementPath>,
    ) -> Self {
        Self::new(id, base_version, element_path, OpPayload::Move { to: to.into() })
    }

    pub fn with_author(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = author_id.into();
        self
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = document_id.into();
        self
    }

    /// Check the operation's shape. Does not look at any session state.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingId);
        }
        if self.element_path.is_root() {
            return Err(ValidationError::MissingElementPath(self.id.clone()));
        }
        let destination_in_bounds = match &self.payload {
            OpPayload::Move { to } => to.in_bounds(),
            _ => true,
        };
        if !self.element_path.in_bounds() || !destination_in_bounds {
            return Err(ValidationError::PathIndexOutOfRange(self.id.clone()));
        }
        match &self.payload {
            OpPayload::SetField { field, .. } if field.is_empty() => {
                Err(ValidationError::EmptyFieldName(self.id.clone()))
            }
            OpPayload::Move { to } if to.is_root() => {
                Err(ValidationError::MissingDestination(self.id.clone()))
            }
            OpPayload::Move { to } if to.parent() != self.element_path.parent() => {
                Err(ValidationError::CrossParentMove(self.id.clone()))
            }
            _ => Ok(()),
        }
    }

    /// A move onto the slot it came from.
    pub fn is_noop_move(&self) -> bool {
        matches!(&self.payload, OpPayload::Move { to } if *to == self.element_path)
    }

    /// Whether this operation changes sibling ordering.
    pub fn is_structural(&self) -> bool {
        matches!(
            self.payload,
            OpPayload::Insert { .. } | OpPayload::Delete | OpPayload::Move { .. }
        )
    }
}

/// Clients commonly send numeric ids; they are kept as strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}
