//! Reconciliation with the remote authority.

/// Transport trait and sync error types.
pub mod remote;
/// Recurring, non-overlapping sync timer.
pub mod scheduler;
