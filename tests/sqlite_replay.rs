use std::sync::Arc;

use tempfile::TempDir;

use canvaslog::{
    canvas::{CanvasState, Element, ElementPatch, ElementShape},
    core::manager::{OpManager, SyncMode},
    engine::{canvas::CanvasReducer, replay::Snapshot},
    op::{OpDraft, OpKind},
    persist::sqlite::SqliteJournal,
    runtime::handle::{ManagerConfig, spawn_manager},
    sync::remote::NoRemote,
    types::{ActorId, Point, Size},
};

fn create(id: &str, x: f64) -> OpDraft {
    OpDraft::new(OpKind::CreateElement {
        element: Element {
            id: id.to_string(),
            shape: ElementShape::Sticky,
            position: Point::new(x, 0.0),
            size: Size::new(80.0, 80.0),
            z_index: 0,
            text: None,
            fill: Some("#ffeb3b".to_string()),
            stroke: None,
            locked: false,
        },
    })
}

fn local_manager() -> OpManager<CanvasReducer> {
    OpManager::new(
        Arc::new(CanvasReducer),
        SyncMode::LocalOnly,
        ActorId::from("alice"),
        CanvasState::new(),
    )
}

#[test]
fn sqlite_replay_round_trips_state() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("ops.db");

    let mut manager = local_manager();
    manager
        .initialize(Snapshot::default(), Vec::new())
        .expect("initialize");
    manager.append(create("a", 0.0)).expect("a");
    manager.append(create("b", 100.0)).expect("b");
    manager
        .append(OpDraft::new(OpKind::UpdateElement {
            id: "a".to_string(),
            patch: ElementPatch {
                text: Some(Some("todo".to_string())),
                ..ElementPatch::default()
            },
        }))
        .expect("update");
    manager
        .append(OpDraft::new(OpKind::DeleteElement {
            id: "b".to_string(),
        }))
        .expect("delete");

    let mut journal = SqliteJournal::open(&db_path).expect("open sqlite");
    let ops = manager.drain_durable();
    assert_eq!(journal.append_ops(&ops).expect("append"), Some(3));
    // Re-appending known indices is ignored.
    journal.append_ops(&ops).expect("append again");
    drop(journal);

    let journal = SqliteJournal::open(&db_path).expect("reopen");
    let (snapshot, ops) = journal.load::<CanvasState>().expect("load");
    assert_eq!(snapshot.watermark, None);
    assert_eq!(ops.len(), 4);
    assert_eq!(
        ops.iter().map(|op| op.op_index).collect::<Vec<_>>(),
        vec![Some(0), Some(1), Some(2), Some(3)]
    );

    let mut replayed = local_manager();
    replayed.initialize(snapshot, ops).expect("initialize replay");
    assert_eq!(replayed.state(), manager.state());
}

#[test]
fn load_starts_from_latest_snapshot() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("ops.db");
    let mut journal = SqliteJournal::open(&db_path).expect("open sqlite");

    let mut manager = local_manager();
    manager
        .initialize(Snapshot::default(), Vec::new())
        .expect("initialize");
    manager.append(create("a", 0.0)).expect("a");
    manager.append(create("b", 10.0)).expect("b");
    journal.append_ops(&manager.drain_durable()).expect("append");

    let snapshot = manager.checkpoint().expect("checkpoint");
    journal.write_snapshot(&snapshot).expect("snapshot");

    manager.append(create("c", 20.0)).expect("c");
    journal.append_ops(&manager.drain_durable()).expect("append");
    drop(journal);

    let journal = SqliteJournal::open(&db_path).expect("reopen");
    let (snapshot, ops) = journal.load::<CanvasState>().expect("load");
    assert_eq!(snapshot.watermark, Some(1));
    assert_eq!(snapshot.state.elements.len(), 2);
    assert_eq!(ops.len(), 1);
    assert_eq!(journal.latest_index().expect("latest"), Some(2));

    let mut replayed = local_manager();
    replayed.initialize(snapshot, ops).expect("initialize replay");
    assert_eq!(replayed.state(), manager.state());
}

#[tokio::test]
async fn runtime_persists_through_sqlite() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("ops.db");

    let journal = SqliteJournal::open(&db_path).expect("open sqlite");
    let handle = spawn_manager(
        CanvasReducer,
        NoRemote,
        Some(Box::new(journal)),
        ManagerConfig::local_only(),
    );
    handle.initialize().await.expect("initialize");
    handle.append_op(create("a", 0.0)).await.expect("a");
    handle
        .append_op(OpKind::MoveElement {
            id: "a".to_string(),
            to: Point::new(3.0, 4.0),
        })
        .await
        .expect("move");
    let before = handle.state().await.expect("state");
    handle.destroy().await.expect("destroy");

    let journal = SqliteJournal::open(&db_path).expect("reopen");
    let handle = spawn_manager(
        CanvasReducer,
        NoRemote,
        Some(Box::new(journal)),
        ManagerConfig::local_only(),
    );
    handle.initialize().await.expect("initialize again");
    assert_eq!(handle.state().await.expect("state"), before);
    handle.destroy().await.expect("destroy");
}
