//! Operation model, validation, and persistence wrappers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    canvas::{Connector, Element, ElementPatch},
    types::{ActorId, ConnectorId, ElementId, OpId, OpIndex, Point, RequestId},
};

/// Version number for serialized [`StoredOpEnvelope`] payloads.
pub const OP_FORMAT_VERSION: u16 = 1;

/// Structural problem with an operation payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// An element or connector id was empty.
    #[error("{0} id must not be empty")]
    EmptyId(&'static str),
    /// Geometry contained NaN, infinity, or a negative extent.
    #[error("invalid geometry for {0}")]
    InvalidGeometry(String),
    /// An update carried no field changes.
    #[error("update for {0} changes nothing")]
    EmptyPatch(ElementId),
}

/// How an operation's effect is reversed by undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inversion {
    /// The inverse payload is captured from pre-apply state when the op is appended.
    Stored,
    /// The inverse is derived at undo time from state rebuilt by replay.
    Replay,
}

/// Closed set of canvas mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Add a new element.
    CreateElement {
        /// Element to insert.
        element: Element,
    },
    /// Move an element to a new top-left position.
    MoveElement {
        /// Target element.
        id: ElementId,
        /// New position.
        to: Point,
    },
    /// Change non-positional element fields.
    UpdateElement {
        /// Target element.
        id: ElementId,
        /// Field deltas.
        patch: ElementPatch,
    },
    /// Remove an element.
    DeleteElement {
        /// Target element.
        id: ElementId,
    },
    /// Link two elements.
    CreateConnector {
        /// Connector to insert.
        connector: Connector,
    },
    /// Remove a connector.
    DeleteConnector {
        /// Target connector.
        id: ConnectorId,
    },
}

impl OpKind {
    /// Short stable name, used in logs and the journal `kind` column.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::CreateElement { .. } => "create_element",
            OpKind::MoveElement { .. } => "move_element",
            OpKind::UpdateElement { .. } => "update_element",
            OpKind::DeleteElement { .. } => "delete_element",
            OpKind::CreateConnector { .. } => "create_connector",
            OpKind::DeleteConnector { .. } => "delete_connector",
        }
    }

    /// Undo strategy for this kind.
    ///
    /// Updates can carry large style payloads, so their prior field values are
    /// recovered by replay on demand instead of being captured on every edit.
    pub fn inversion(&self) -> Inversion {
        match self {
            OpKind::UpdateElement { .. } => Inversion::Replay,
            OpKind::CreateElement { .. }
            | OpKind::MoveElement { .. }
            | OpKind::DeleteElement { .. }
            | OpKind::CreateConnector { .. }
            | OpKind::DeleteConnector { .. } => Inversion::Stored,
        }
    }

    /// Checks the payload for structural problems.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            OpKind::CreateElement { element } => {
                non_empty(&element.id, "element")?;
                if !element.position.is_finite() || !element.size.is_valid() {
                    return Err(ValidationError::InvalidGeometry(element.id.clone()));
                }
            }
            OpKind::MoveElement { id, to } => {
                non_empty(id, "element")?;
                if !to.is_finite() {
                    return Err(ValidationError::InvalidGeometry(id.clone()));
                }
            }
            OpKind::UpdateElement { id, patch } => {
                non_empty(id, "element")?;
                if patch.is_empty() {
                    return Err(ValidationError::EmptyPatch(id.clone()));
                }
                if patch.size.is_some_and(|s| !s.is_valid()) {
                    return Err(ValidationError::InvalidGeometry(id.clone()));
                }
            }
            OpKind::DeleteElement { id } => non_empty(id, "element")?,
            OpKind::CreateConnector { connector } => {
                non_empty(&connector.id, "connector")?;
                non_empty(&connector.from, "connector source")?;
                non_empty(&connector.to, "connector target")?;
            }
            OpKind::DeleteConnector { id } => non_empty(id, "connector")?,
        }
        Ok(())
    }
}

fn non_empty(id: &str, what: &'static str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::EmptyId(what));
    }
    Ok(())
}

/// Why an operation was authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Origin {
    /// A direct user or programmatic edit.
    #[default]
    User,
    /// Inverse appended by undo of `of`.
    Undo {
        /// Operation being neutralized.
        of: OpId,
    },
    /// Re-application appended by redo of `of`.
    Redo {
        /// Operation being re-applied.
        of: OpId,
    },
}

/// Immutable operation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Process-unique identifier.
    pub id: OpId,
    /// Authoritative position, set once accepted.
    pub op_index: Option<OpIndex>,
    /// Mutation payload.
    pub kind: OpKind,
    /// Authoring session.
    pub actor_id: ActorId,
    /// Idempotency key.
    pub request_id: RequestId,
    /// Client timestamp in milliseconds; informational only.
    pub client_ts: u64,
    /// Undo/redo marker.
    pub origin: Origin,
}

/// Caller-supplied operation; the manager fills in ids and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct OpDraft {
    /// Mutation payload.
    pub kind: OpKind,
    /// Retry key; generated when absent.
    pub request_id: Option<RequestId>,
    /// Authoring session; the manager's configured actor when absent.
    pub actor_id: Option<ActorId>,
}

impl OpDraft {
    /// Draft with a generated request id.
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            request_id: None,
            actor_id: None,
        }
    }

    /// Pins the idempotency key so retries resolve to the same entry.
    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Overrides the authoring actor.
    pub fn with_actor(mut self, actor_id: ActorId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }
}

impl From<OpKind> for OpDraft {
    fn from(kind: OpKind) -> Self {
        Self::new(kind)
    }
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOpEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped operation.
    pub op: Operation,
}

impl StoredOpEnvelope {
    /// Constructs an envelope using [`OP_FORMAT_VERSION`].
    pub fn new(op: Operation) -> Self {
        Self {
            format_version: OP_FORMAT_VERSION,
            op,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Size;

    #[test]
    fn rejects_structurally_invalid_payloads() {
        let bad_move = OpKind::MoveElement {
            id: "e1".to_string(),
            to: Point::new(f64::NAN, 0.0),
        };
        assert_eq!(
            bad_move.validate(),
            Err(ValidationError::InvalidGeometry("e1".to_string()))
        );

        let empty = OpKind::UpdateElement {
            id: "e1".to_string(),
            patch: ElementPatch::default(),
        };
        assert_eq!(empty.validate(), Err(ValidationError::EmptyPatch("e1".to_string())));

        let negative = OpKind::UpdateElement {
            id: "e1".to_string(),
            patch: ElementPatch {
                size: Some(Size::new(-1.0, 4.0)),
                ..ElementPatch::default()
            },
        };
        assert!(negative.validate().is_err());

        assert_eq!(
            OpKind::DeleteConnector { id: " ".to_string() }.validate(),
            Err(ValidationError::EmptyId("connector"))
        );
    }

    #[test]
    fn only_updates_defer_inversion_to_replay() {
        let update = OpKind::UpdateElement {
            id: "e1".to_string(),
            patch: ElementPatch {
                locked: Some(true),
                ..ElementPatch::default()
            },
        };
        assert_eq!(update.inversion(), Inversion::Replay);
        assert_eq!(
            OpKind::DeleteElement { id: "e1".to_string() }.inversion(),
            Inversion::Stored
        );
    }
}
