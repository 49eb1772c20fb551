//! Reducer integration and replay.

/// Reference reducer for [`crate::canvas::CanvasState`].
pub mod canvas;
/// Snapshot-plus-log replay.
pub mod replay;
/// Reducer trait consumed by the core.
pub mod traits;
