//! Operation log manager for collaborative canvases: optimistic apply,
//! server reconciliation, replay-based rollback, and undo/redo by inverse ops.
//!
//! # Examples
//!
//! Synchronous core with [`core::manager::OpManager`]:
//! ```
//! use std::sync::Arc;
//!
//! use canvaslog::{
//!     canvas::{CanvasState, Element, ElementShape},
//!     core::{log::Lifecycle, manager::{OpManager, SyncMode}},
//!     engine::{canvas::CanvasReducer, replay::Snapshot},
//!     op::{OpDraft, OpKind},
//!     types::{ActorId, Point, Size},
//! };
//!
//! let mut manager = OpManager::new(
//!     Arc::new(CanvasReducer),
//!     SyncMode::Remote,
//!     ActorId::from("alice"),
//!     CanvasState::new(),
//! );
//! manager.initialize(Snapshot::default(), Vec::new()).expect("initialize");
//!
//! let receipt = manager
//!     .append(OpDraft::new(OpKind::CreateElement {
//!         element: Element {
//!             id: "a".to_string(),
//!             shape: ElementShape::Rectangle,
//!             position: Point::new(0.0, 0.0),
//!             size: Size::new(10.0, 10.0),
//!             z_index: 0,
//!             text: None,
//!             fill: None,
//!             stroke: None,
//!             locked: false,
//!         },
//!     }).with_request_id("r1"))
//!     .expect("append");
//! assert_eq!(receipt.lifecycle, Lifecycle::Pending);
//!
//! manager.confirm(receipt.id, 0).expect("confirm");
//! assert!(manager.pending_ops().is_empty());
//! assert!(manager.undo_redo_state().can_undo);
//! ```
//!
//! Runtime usage with a SQLite journal:
//! ```no_run
//! use canvaslog::{
//!     engine::canvas::CanvasReducer,
//!     op::OpKind,
//!     persist::sqlite::SqliteJournal,
//!     runtime::handle::{ManagerConfig, spawn_manager},
//!     sync::remote::NoRemote,
//!     types::Point,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let journal = SqliteJournal::open("canvas.db").expect("open sqlite");
//! let handle = spawn_manager(
//!     CanvasReducer,
//!     NoRemote,
//!     Some(Box::new(journal)),
//!     ManagerConfig::local_only(),
//! );
//! handle.initialize().await.expect("initialize");
//! let _receipt = handle
//!     .append_op(OpKind::MoveElement { id: "a".to_string(), to: Point::new(5.0, 5.0) })
//!     .await
//!     .expect("append");
//! handle.destroy().await.expect("destroy");
//! # }
//! ```
#![deny(missing_docs)]

/// Canvas element, connector, and state model.
pub mod canvas;
/// Log, idempotency guard, undo/redo history, phase gate, and the manager core.
pub mod core;
/// Reducer trait, canvas reducer, and snapshot replay.
pub mod engine;
/// Operation model and persistence wrapper types.
pub mod op;
/// Journal abstraction with SQLite and in-memory implementations.
pub mod persist;
/// Per-document async runtime handle and events.
pub mod runtime;
/// Remote authority transport and the sync timer.
pub mod sync;
/// Shared primitive types.
pub mod types;
