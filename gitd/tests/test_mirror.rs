//! Mirror engine tests against local upstreams. These exercise the
//! `git` binary for fetches, the way the server runs it.

mod common;

use std::time::Duration;

use gitd::tasks::TaskStatus;
use gitd::{ContentStore, Error, MirrorEngine, RepoStore};

fn engine(dir: &std::path::Path) -> (RepoStore, MirrorEngine) {
    let store = RepoStore::new(dir.join("root")).unwrap();
    let lfs = ContentStore::new(store.root().join("lfs")).unwrap();
    let engine = MirrorEngine::new(store.clone(), lfs, Duration::from_secs(3600));
    (store, engine)
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

#[test]
fn prepare_import_configures_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let source = common::init_source(dir.path(), "trunk");
    let (store, engine) = engine(dir.path());

    engine
        .prepare_import("copy", &common::file_url(&source))
        .unwrap();

    let path = store.open("copy").unwrap();
    // Default branch discovered from the upstream advertisement.
    assert_eq!(store.default_branch(&path), "trunk");

    let (is_mirror, url) = store.mirror_config(&path).unwrap();
    assert!(is_mirror);
    assert_eq!(url.as_deref(), Some(common::file_url(&source).as_str()));

    let config_text = std::fs::read_to_string(path.join("config")).unwrap();
    assert!(config_text.contains("+refs/heads/*:refs/heads/*"));
    assert!(config_text.contains("+refs/tags/*:refs/tags/*"));
    assert!(config_text.contains("mirror = true"));
}

#[test]
fn prepare_import_conflicts_with_existing_repo() {
    let dir = tempfile::tempdir().unwrap();
    let source = common::init_source(dir.path(), "main");
    let (store, engine) = engine(dir.path());

    store.create("copy", "main").unwrap();
    let result = engine.prepare_import("copy", &common::file_url(&source));
    assert!(matches!(result, Err(Error::AlreadyExists(_))));
    // The existing repository must survive the failed import.
    assert!(store.open("copy").is_ok());
}

// ---------------------------------------------------------------------------
// import pipeline
// ---------------------------------------------------------------------------

#[test]
fn import_copies_the_commit_graph() {
    let dir = tempfile::tempdir().unwrap();
    let source = common::init_source(dir.path(), "main");
    {
        let repo = git2::Repository::open_bare(&source).unwrap();
        common::commit_file(&repo, "main", "second.txt", b"two\n", "second");
        common::commit_file(&repo, "feature", "feat.txt", b"feat\n", "feature work");
    }
    let (store, engine) = engine(dir.path());

    engine
        .prepare_import("copy", &common::file_url(&source))
        .unwrap();
    engine.run_import("copy");

    let task = engine.import_status("copy").unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "step: {}", task.step);

    let copy = store.open("copy").unwrap();
    assert_eq!(
        common::branch_tip(&copy, "main"),
        common::branch_tip(&source, "main")
    );
    assert_eq!(
        common::branch_tip(&copy, "feature"),
        common::branch_tip(&source, "feature")
    );
}

#[test]
fn import_status_is_none_for_unknown_repo() {
    let dir = tempfile::tempdir().unwrap();
    let (_, engine) = engine(dir.path());
    assert!(engine.import_status("ghost").is_none());
}

// ---------------------------------------------------------------------------
// lazy sync
// ---------------------------------------------------------------------------

#[test]
fn ensure_synced_tracks_upstream_changes() {
    let dir = tempfile::tempdir().unwrap();
    let source = common::init_source(dir.path(), "main");
    let (store, engine) = engine(dir.path());

    engine
        .prepare_import("copy", &common::file_url(&source))
        .unwrap();
    engine.run_import("copy");

    // New upstream commit after the import.
    {
        let repo = git2::Repository::open_bare(&source).unwrap();
        common::commit_file(&repo, "main", "late.txt", b"late\n", "late commit");
    }
    let copy = store.open("copy").unwrap();
    assert_ne!(
        common::branch_tip(&copy, "main"),
        common::branch_tip(&source, "main")
    );

    // Forced sync bypasses the cooldown and picks up the new tip.
    engine.ensure_synced("copy", true).unwrap();
    assert_eq!(
        common::branch_tip(&copy, "main"),
        common::branch_tip(&source, "main")
    );
}

#[test]
fn ensure_synced_prunes_deleted_branches() {
    let dir = tempfile::tempdir().unwrap();
    let source = common::init_source(dir.path(), "main");
    {
        let repo = git2::Repository::open_bare(&source).unwrap();
        common::commit_file(&repo, "doomed", "d.txt", b"d\n", "doomed branch");
    }
    let (store, engine) = engine(dir.path());

    engine
        .prepare_import("copy", &common::file_url(&source))
        .unwrap();
    engine.run_import("copy");

    let copy = store.open("copy").unwrap();
    assert!(common::branch_tip(&copy, "doomed").is_some());

    {
        let repo = git2::Repository::open_bare(&source).unwrap();
        let mut reference = repo.find_reference("refs/heads/doomed").unwrap();
        reference.delete().unwrap();
    }

    engine.ensure_synced("copy", true).unwrap();
    assert!(common::branch_tip(&copy, "doomed").is_none());
}

#[test]
fn sync_failures_are_cached_not_returned() {
    let dir = tempfile::tempdir().unwrap();
    let (store, engine) = engine(dir.path());
    let path = store.create("copy", "main").unwrap();

    // A mirror whose upstream has vanished.
    let config = format!(
        "{}[remote \"origin\"]\n\turl = file://{}/gone.git\n\tmirror = true\n",
        std::fs::read_to_string(path.join("config")).unwrap(),
        dir.path().display()
    );
    std::fs::write(path.join("config"), config).unwrap();

    // Reads are never blocked by a failing upstream; the error is cached.
    engine.ensure_synced("copy", true).unwrap();
    assert!(engine.last_sync_error("copy").is_some());
}

#[test]
fn ensure_synced_is_a_no_op_for_plain_repos() {
    let dir = tempfile::tempdir().unwrap();
    let (store, engine) = engine(dir.path());

    store.create("plain", "main").unwrap();
    engine.ensure_synced("plain", false).unwrap();
    engine.ensure_synced("plain", true).unwrap();
}
