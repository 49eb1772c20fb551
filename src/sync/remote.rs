use std::future::Future;

use thiserror::Error;

use crate::{
    op::Operation,
    types::{OpIndex, RequestId},
};

/// The authority refused an operation; the entry becomes `Rejected`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("conflict: {reason}")]
pub struct ConflictError {
    /// Authority-supplied explanation.
    pub reason: String,
}

/// Transient transport failure; affected entries stay `Pending` and are retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Could not reach the authority.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// The authority answered with something unusable.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Per-operation verdict returned by [`RemoteAuthority::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted at a fixed position.
    Accepted {
        /// Key of the pushed operation.
        request_id: RequestId,
        /// Assigned position.
        op_index: OpIndex,
    },
    /// Refused; the local effect must be rolled back.
    Refused {
        /// Key of the pushed operation.
        request_id: RequestId,
        /// Why.
        error: ConflictError,
    },
}

/// Transport to the authoritative operation store.
///
/// Implementations are shared across a manager's sync cycles and may serve
/// several managers at once, so they must not keep per-document state.
pub trait RemoteAuthority: Send + Sync + 'static {
    /// Submits pending operations. Outcomes are matched back by request id, so
    /// ops the authority has not decided on yet may simply be omitted.
    fn push(
        &self,
        ops: Vec<Operation>,
    ) -> impl Future<Output = Result<Vec<PushOutcome>, SyncError>> + Send;

    /// Fetches confirmed operations with `op_index` above `after`, in index order.
    fn pull(
        &self,
        after: Option<OpIndex>,
    ) -> impl Future<Output = Result<Vec<Operation>, SyncError>> + Send;
}

/// Authority for local-only managers; never contacted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRemote;

impl RemoteAuthority for NoRemote {
    async fn push(&self, _ops: Vec<Operation>) -> Result<Vec<PushOutcome>, SyncError> {
        Ok(Vec::new())
    }

    async fn pull(&self, _after: Option<OpIndex>) -> Result<Vec<Operation>, SyncError> {
        Ok(Vec::new())
    }
}
