use std::fmt::Debug;

use crate::op::{OpKind, Operation};

/// State transition function owned by the rendering layer.
///
/// `apply` must be deterministic and total over every [`OpKind`]; an op that
/// targets a missing element is a no-op rather than an error. The core calls
/// it strictly in log order and never inspects payloads itself.
pub trait Reducer: Send + Sync + 'static {
    /// Document state the operations act on.
    type State: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// Applies `op` in place; must not fail for a validated op.
    fn apply(&self, state: &mut Self::State, op: &Operation);

    /// Payload that reverses `kind` when applied to the state `kind` produced
    /// from `before`. `None` means the effect cannot be reversed, and undo
    /// fails closed.
    fn invert(&self, before: &Self::State, kind: &OpKind) -> Option<OpKind>;
}
