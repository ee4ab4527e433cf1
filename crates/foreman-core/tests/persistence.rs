//! Persisted graphs reload with identical state and keep working.

use std::time::Duration;

use foreman_core::claim;
use foreman_core::config::{ProjectConfig, STATE_DIR, load_project_config};
use foreman_core::db::persist::{load_from_path, save_to_path};
use foreman_core::graph::edges::EdgeKind;
use foreman_core::model::{Assignee, ItemId, ItemSpec, Status};
use foreman_core::store::GraphStore;
use tempfile::TempDir;

const LOCK_WAIT: Duration = Duration::from_millis(200);

fn project() -> (TempDir, std::path::PathBuf) {
    let root = tempfile::tempdir().expect("tempdir");
    let config = load_project_config(root.path()).expect("default config");
    assert_eq!(config, ProjectConfig::default());
    let db = config.database_path(root.path());
    (root, db)
}

#[test]
fn reloaded_store_answers_queries_identically() {
    let (root, db) = project();
    let store = GraphStore::new();
    for id in ["base", "mid", "top", "doc"] {
        store
            .create(ItemSpec::new(format!("item {id}")).id(id).project("core"))
            .expect("create");
    }
    store.add_edge("mid", "base", EdgeKind::DependsOn).expect("edge");
    store.add_edge("top", "mid", EdgeKind::DependsOn).expect("edge");
    store.add_edge("doc", "top", EdgeKind::SoftDependsOn).expect("edge");
    store.add_edge("doc", "top", EdgeKind::Parent).expect("edge");
    claim::claim(&store, "base", &Assignee::worker("w1")).expect("claim");

    save_to_path(&db, &store, LOCK_WAIT).expect("save");
    assert!(db.starts_with(root.path().join(STATE_DIR)));
    let loaded = load_from_path(&db, LOCK_WAIT).expect("load");

    assert_eq!(loaded.ready_set().ids(), store.ready_set().ids());
    assert_eq!(
        loaded.dependency_graph("top").expect("graph").edges,
        store.dependency_graph("top").expect("graph").edges
    );
    assert_eq!(
        loaded.unmet_dependencies("top").expect("unmet"),
        vec![ItemId::new_unchecked("mid")]
    );

    // Ownership survives: the claim still holds.
    assert!(claim::claim(&loaded, "base", &Assignee::worker("w2")).is_err());
    let worker = Assignee::worker("w1");
    loaded
        .set_workspace_ref("base", Some("ws-base".into()))
        .expect("workspace");
    claim::begin(&loaded, "base", &worker).expect("begin");
    claim::submit_for_review(&loaded, "base", &worker).expect("submit");
    loaded
        .update_status("base", Status::Done, Status::Review)
        .expect("done");
    assert!(loaded.ready_set().contains("mid"));
}

#[test]
fn cycles_are_still_rejected_after_reload() {
    let (_root, db) = project();
    let store = GraphStore::new();
    for id in ["a", "b"] {
        store
            .create(ItemSpec::new(id).id(id).project("core"))
            .expect("create");
    }
    store.add_edge("a", "b", EdgeKind::DependsOn).expect("edge");
    save_to_path(&db, &store, LOCK_WAIT).expect("save");

    let loaded = load_from_path(&db, LOCK_WAIT).expect("load");
    assert!(loaded.add_edge("b", "a", EdgeKind::DependsOn).is_err());
    assert_eq!(loaded.snapshot().edges(), store.snapshot().edges());
}
