//! Runtime event stream payloads.

use crate::{op::Operation, sync::remote::ConflictError, types::OpIndex};

/// Lifecycle notifications, delivered in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum OpEvent {
    /// An operation's effect reached local state.
    Applied {
        /// The applied operation.
        op: Operation,
        /// True when applied ahead of confirmation.
        optimistic: bool,
    },
    /// The authority accepted an operation.
    Confirmed {
        /// The confirmed operation.
        op: Operation,
        /// Its final position.
        op_index: OpIndex,
    },
    /// The authority refused an operation; its effect has been or is being rolled back.
    Rejected {
        /// The rejected operation.
        op: Operation,
        /// Why.
        error: ConflictError,
    },
}

impl OpEvent {
    /// Operation the event is about.
    pub fn op(&self) -> &Operation {
        match self {
            OpEvent::Applied { op, .. } | OpEvent::Confirmed { op, .. } | OpEvent::Rejected { op, .. } => op,
        }
    }
}
