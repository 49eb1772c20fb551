pub mod memory;
pub mod sqlite;

use thiserror::Error;

use crate::{engine::replay::Snapshot, op::Operation, types::OpIndex};

/// Journal failures.
#[derive(Debug, Error)]
pub enum PersistError {
    /// SQLite failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Payload could not be encoded or decoded.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Any other failure, described.
    #[error("{0}")]
    Message(String),
}

/// Result of a journal call.
pub type PersistResult<T> = Result<T, PersistError>;

/// Durable home for confirmed operations and snapshots.
///
/// Only confirmed operations are journaled; pending and rejected entries
/// live in memory alone.
pub trait OpJournal<S>: Send {
    /// Stores confirmed ops; re-appending a known `op_index` is a no-op.
    /// Returns the highest index written.
    fn append_ops(&mut self, ops: &[Operation]) -> PersistResult<Option<OpIndex>>;
    /// Latest snapshot, if one was written.
    fn load_snapshot(&mut self) -> PersistResult<Option<Snapshot<S>>>;
    /// Ops strictly above `watermark`, in index order.
    fn load_ops_after(&mut self, watermark: Option<OpIndex>) -> PersistResult<Vec<Operation>>;
    /// Makes earlier appends durable.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
    /// Replaces the stored snapshot.
    fn write_snapshot(&mut self, _snapshot: &Snapshot<S>) -> PersistResult<()> {
        Ok(())
    }
}
