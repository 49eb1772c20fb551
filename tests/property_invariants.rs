use std::sync::Arc;

use proptest::prelude::*;

use canvaslog::{
    canvas::{CanvasState, Element, ElementPatch, ElementShape},
    core::{
        log::Lifecycle,
        manager::{OpManager, SyncMode},
    },
    engine::{
        canvas::CanvasReducer,
        replay::{ReplayEngine, Snapshot},
    },
    op::{OpDraft, OpKind, Operation},
    sync::remote::ConflictError,
    types::{ActorId, Point, Size},
};

#[derive(Debug, Clone)]
enum Action {
    Create { target: u8, x: i16 },
    Move { target: u8, x: i16, y: i16 },
    Restack { target: u8, z: i8 },
    Delete { target: u8 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0u8..4, any::<i16>()).prop_map(|(target, x)| Action::Create { target, x }),
        (0u8..4, any::<i16>(), any::<i16>()).prop_map(|(target, x, y)| Action::Move { target, x, y }),
        (0u8..4, any::<i8>()).prop_map(|(target, z)| Action::Restack { target, z }),
        (0u8..4).prop_map(|target| Action::Delete { target }),
    ]
}

fn kind_from(action: &Action) -> OpKind {
    match action {
        Action::Create { target, x } => OpKind::CreateElement {
            element: Element {
                id: format!("e{target}"),
                shape: ElementShape::Frame,
                position: Point::new(f64::from(*x), 0.0),
                size: Size::new(10.0, 10.0),
                z_index: 0,
                text: None,
                fill: Some("#fff".to_string()),
                stroke: None,
                locked: false,
            },
        },
        Action::Move { target, x, y } => OpKind::MoveElement {
            id: format!("e{target}"),
            to: Point::new(f64::from(*x), f64::from(*y)),
        },
        Action::Restack { target, z } => OpKind::UpdateElement {
            id: format!("e{target}"),
            patch: ElementPatch {
                z_index: Some(i64::from(*z)),
                ..ElementPatch::default()
            },
        },
        Action::Delete { target } => OpKind::DeleteElement {
            id: format!("e{target}"),
        },
    }
}

fn manager(mode: SyncMode) -> OpManager<CanvasReducer> {
    let mut manager = OpManager::new(
        Arc::new(CanvasReducer),
        mode,
        ActorId::from("prop"),
        CanvasState::new(),
    );
    manager
        .initialize(Snapshot::default(), Vec::new())
        .expect("initialize");
    manager
}

fn replay_from_empty<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> CanvasState {
    ReplayEngine::new(Arc::new(CanvasReducer)).replay(&Snapshot::default(), ops)
}

proptest! {
    #[test]
    fn undo_then_redo_is_identity(actions in prop::collection::vec(action_strategy(), 1..80)) {
        let mut manager = manager(SyncMode::LocalOnly);

        for action in &actions {
            let before = manager.state().clone();
            manager.append(OpDraft::new(kind_from(action))).expect("append");
            let after = manager.state().clone();

            if manager.undo() {
                prop_assert_eq!(manager.state(), &before);
                prop_assert!(manager.redo());
                prop_assert_eq!(manager.state(), &after);
            } else {
                // Only edits against missing targets lack an inverse, and those are no-ops.
                prop_assert_eq!(&before, &after);
            }
        }

        let plan = manager.log().replay_plan(None, manager.log().len());
        prop_assert_eq!(&replay_from_empty(&plan), manager.state());
    }

    #[test]
    fn rollback_matches_replay_of_survivors(
        actions in prop::collection::vec(action_strategy(), 1..60),
        rejected in prop::collection::vec(any::<bool>(), 60),
    ) {
        let mut manager = manager(SyncMode::Remote);
        let mut ids = Vec::new();
        for action in &actions {
            ids.push(manager.append(OpDraft::new(kind_from(action))).expect("append").id);
        }
        for (id, reject) in ids.iter().zip(&rejected) {
            if *reject {
                manager
                    .reject(*id, ConflictError { reason: "refused".to_string() })
                    .expect("reject");
            }
        }
        manager.rollback_now();

        let survivors = manager
            .log()
            .entries()
            .iter()
            .filter(|e| e.lifecycle != Lifecycle::Rejected)
            .map(|e| &e.op);
        prop_assert_eq!(&replay_from_empty(survivors), manager.state());
    }

    #[test]
    fn retried_requests_apply_once(keys in prop::collection::vec(0u8..6, 1..40)) {
        let mut manager = manager(SyncMode::Remote);
        for (n, key) in keys.iter().enumerate() {
            let kind = OpKind::MoveElement {
                id: "e0".to_string(),
                to: Point::new(n as f64, 0.0),
            };
            manager
                .append(OpDraft::new(kind).with_request_id(format!("req-{key}")))
                .expect("append");
        }

        let mut distinct = keys.clone();
        distinct.sort_unstable();
        distinct.dedup();
        prop_assert_eq!(manager.entries().len(), distinct.len());
    }
}
