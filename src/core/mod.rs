//! Single-owner operation log core.

/// Idempotency guard over request keys.
pub mod guard;
/// Linear undo/redo over log entries.
pub mod history;
/// Append-only operation log and entry lifecycle.
pub mod log;
/// Operation log manager wiring log, guard, history, and replay.
pub mod manager;
/// `Idle | Replaying | Syncing` state cell.
pub mod phase;
