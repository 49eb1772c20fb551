use std::sync::Arc;

use canvaslog::{
    canvas::{CanvasState, Element, ElementPatch, ElementShape},
    core::{
        log::Lifecycle,
        manager::{ManagerError, OpManager, SyncMode},
    },
    engine::{canvas::CanvasReducer, replay::Snapshot},
    op::{OpDraft, OpKind},
    runtime::events::OpEvent,
    types::{ActorId, Point, Size},
};

fn element(id: &str, x: f64, y: f64) -> Element {
    Element {
        id: id.to_string(),
        shape: ElementShape::Rectangle,
        position: Point::new(x, y),
        size: Size::new(40.0, 20.0),
        z_index: 0,
        text: None,
        fill: None,
        stroke: None,
        locked: false,
    }
}

fn create(id: &str) -> OpKind {
    OpKind::CreateElement {
        element: element(id, 0.0, 0.0),
    }
}

fn move_to(id: &str, x: f64, y: f64) -> OpKind {
    OpKind::MoveElement {
        id: id.to_string(),
        to: Point::new(x, y),
    }
}

fn manager(mode: SyncMode) -> OpManager<CanvasReducer> {
    let mut manager = OpManager::new(
        Arc::new(CanvasReducer),
        mode,
        ActorId::from("alice"),
        CanvasState::new(),
    );
    manager
        .initialize(Snapshot::default(), Vec::new())
        .expect("initialize");
    manager
}

#[test]
fn append_before_initialize_is_refused() {
    let mut manager = OpManager::new(
        Arc::new(CanvasReducer),
        SyncMode::Remote,
        ActorId::from("alice"),
        CanvasState::new(),
    );
    let err = manager.append(OpDraft::new(create("a"))).unwrap_err();
    assert_eq!(err, ManagerError::NotReady);
    assert!(!manager.undo());
}

#[test]
fn invalid_payload_changes_nothing() {
    let mut manager = manager(SyncMode::Remote);
    let err = manager
        .append(OpDraft::new(move_to("a", f64::NAN, 0.0)))
        .unwrap_err();
    assert!(matches!(err, ManagerError::Validation(_)));
    assert!(manager.entries().is_empty());
    assert!(manager.drain_events().is_empty());
}

#[test]
fn confirmed_append_leaves_nothing_pending() {
    let mut manager = manager(SyncMode::Remote);
    let receipt = manager
        .append(OpDraft::new(create("a")).with_request_id("r1"))
        .expect("append");
    assert_eq!(receipt.lifecycle, Lifecycle::Pending);
    assert_eq!(manager.pending_ops().len(), 1);

    manager.confirm(receipt.id, 0).expect("confirm");
    assert!(manager.pending_ops().is_empty());
    let flags = manager.undo_redo_state();
    assert!(flags.can_undo);
    assert!(!flags.can_redo);

    let entry = manager.log().get(receipt.id).expect("entry");
    assert_eq!(entry.lifecycle, Lifecycle::Confirmed);
    assert_eq!(entry.op.op_index, Some(0));
}

#[test]
fn duplicate_request_applies_once() {
    let mut manager = manager(SyncMode::Remote);
    let first = manager
        .append(OpDraft::new(create("a")).with_request_id("r1"))
        .expect("append");
    let retry = manager
        .append(OpDraft::new(move_to("a", 9.0, 9.0)).with_request_id("r1"))
        .expect("retry");

    assert!(retry.duplicate);
    assert_eq!(retry.id, first.id);
    assert_eq!(manager.entries().len(), 1);
    assert_eq!(
        manager.state().element("a").map(|e| e.position),
        Some(Point::new(0.0, 0.0))
    );
}

#[test]
fn undo_then_redo_restores_state() {
    let mut manager = manager(SyncMode::LocalOnly);
    manager.append(OpDraft::new(create("a"))).expect("create");
    let before = manager.state().clone();
    manager.append(OpDraft::new(move_to("a", 5.0, 5.0))).expect("move");
    let after = manager.state().clone();

    assert!(manager.undo());
    assert_eq!(manager.state(), &before);
    assert!(manager.undo_redo_state().can_redo);

    assert!(manager.redo());
    assert_eq!(manager.state(), &after);
    assert!(!manager.undo_redo_state().can_redo);

    // Undo and redo append; nothing is removed from the log.
    assert_eq!(manager.entries().len(), 4);
}

#[test]
fn new_edit_invalidates_redo() {
    let mut manager = manager(SyncMode::LocalOnly);
    manager.append(OpDraft::new(create("a"))).expect("create");
    manager.append(OpDraft::new(move_to("a", 1.0, 1.0))).expect("move a");
    assert!(manager.undo());

    manager.append(OpDraft::new(move_to("a", 3.0, 3.0))).expect("move b");
    assert!(!manager.undo_redo_state().can_redo);
    assert!(!manager.redo());
    assert_eq!(
        manager.state().element("a").map(|e| e.position),
        Some(Point::new(3.0, 3.0))
    );
}

#[test]
fn update_is_undone_from_replayed_state() {
    let mut manager = manager(SyncMode::LocalOnly);
    manager.append(OpDraft::new(create("a"))).expect("create");
    manager
        .append(OpDraft::new(OpKind::UpdateElement {
            id: "a".to_string(),
            patch: ElementPatch {
                text: Some(Some("hello".to_string())),
                z_index: Some(7),
                ..ElementPatch::default()
            },
        }))
        .expect("update");

    assert!(manager.undo());
    let el = manager.state().element("a").expect("element");
    assert_eq!(el.text, None);
    assert_eq!(el.z_index, 0);
}

#[test]
fn undo_without_inverse_fails_closed() {
    let mut manager = manager(SyncMode::Remote);
    manager
        .append(OpDraft::new(OpKind::DeleteElement {
            id: "ghost".to_string(),
        }))
        .expect("delete");
    let before = manager.state().clone();
    let entries = manager.entries().len();

    assert!(!manager.undo());
    assert_eq!(manager.state(), &before);
    assert_eq!(manager.entries().len(), entries);
}

#[test]
fn local_only_confirms_on_append() {
    let mut manager = manager(SyncMode::LocalOnly);
    let receipt = manager.append(OpDraft::new(create("a"))).expect("append");
    assert_eq!(receipt.lifecycle, Lifecycle::Confirmed);
    assert!(manager.pending_ops().is_empty());

    let events = manager.drain_events();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], OpEvent::Applied { optimistic: false, .. }));
    assert!(matches!(&events[1], OpEvent::Confirmed { op_index: 0, .. }));
    assert!(manager.begin_sync().is_err());
}

#[test]
fn initialize_twice_is_a_no_op() {
    let mut manager = manager(SyncMode::LocalOnly);
    manager.append(OpDraft::new(create("a"))).expect("append");
    manager
        .initialize(Snapshot::default(), Vec::new())
        .expect("second initialize");
    assert!(manager.state().element("a").is_some());
    assert_eq!(manager.entries().len(), 1);
}

#[test]
fn teardown_requires_initialize_again() {
    let mut manager = manager(SyncMode::LocalOnly);
    manager.append(OpDraft::new(create("a"))).expect("append");
    manager.teardown();

    assert!(!manager.is_ready());
    assert!(manager.entries().is_empty());
    assert_eq!(
        manager.append(OpDraft::new(create("b"))).unwrap_err(),
        ManagerError::NotReady
    );
}

#[test]
fn history_depth_caps_undo() {
    let mut manager = manager(SyncMode::LocalOnly).with_history_depth(2);
    manager.append(OpDraft::new(create("a"))).expect("a");
    manager.append(OpDraft::new(create("b"))).expect("b");
    manager.append(OpDraft::new(create("c"))).expect("c");

    assert!(manager.undo());
    assert!(manager.undo());
    assert!(!manager.undo());
    assert!(manager.state().element("a").is_some());
}
