//! Per-document async runtime and event stream APIs.

/// Event stream types emitted by the runtime.
pub mod events;
/// Handle, command loop, and persistence worker.
pub mod handle;
