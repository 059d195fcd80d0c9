use gitd::{Error, RepoStore};

// ---------------------------------------------------------------------------
// create / open / delete
// ---------------------------------------------------------------------------

#[test]
fn create_initializes_empty_bare_repo() {
    let dir = tempfile::tempdir().unwrap();
    let store = RepoStore::new(dir.path()).unwrap();

    let path = store.create("demo", "main").unwrap();
    assert!(path.ends_with("demo.git"));
    assert_eq!(
        std::fs::read_to_string(path.join("HEAD")).unwrap().trim(),
        "ref: refs/heads/main"
    );
    assert_eq!(store.default_branch(&path), "main");

    // Shallow pushes are allowed on created repos.
    let config = git2::Config::open(&path.join("config")).unwrap();
    assert!(config.get_bool("receive.shallowupdate").unwrap());
}

#[test]
fn create_conflicts_when_present() {
    let dir = tempfile::tempdir().unwrap();
    let store = RepoStore::new(dir.path()).unwrap();

    store.create("demo", "main").unwrap();
    match store.create("demo", "main") {
        Err(Error::AlreadyExists(_)) => {}
        other => panic!("expected AlreadyExists, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn open_requires_existing_repo() {
    let dir = tempfile::tempdir().unwrap();
    let store = RepoStore::new(dir.path()).unwrap();

    assert!(matches!(store.open("ghost"), Err(Error::NotFound(_))));

    store.create("demo", "main").unwrap();
    // With and without the .git suffix.
    assert!(store.open("demo").is_ok());
    assert!(store.open("demo.git").is_ok());
    assert!(store.open("/demo.git").is_ok());
}

#[test]
fn delete_removes_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let store = RepoStore::new(dir.path()).unwrap();

    let path = store.create("org/demo", "main").unwrap();
    store.delete("org/demo").unwrap();
    assert!(!path.exists());
    assert!(matches!(store.delete("org/demo"), Err(Error::NotFound(_))));
}

#[test]
fn resolve_rejects_traversal_out_of_root() {
    let dir = tempfile::tempdir().unwrap();
    let store = RepoStore::new(dir.path()).unwrap();

    assert!(matches!(
        store.resolve("../escape"),
        Err(Error::InvalidPath(_))
    ));
    assert!(matches!(
        store.resolve("a/../../escape"),
        Err(Error::InvalidPath(_))
    ));
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

#[test]
fn list_walks_nested_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let store = RepoStore::new(dir.path()).unwrap();

    store.create("alpha", "main").unwrap();
    store.create("org/beta", "main").unwrap();
    store.create("org/team/gamma", "main").unwrap();
    // The lfs pool must never be listed.
    std::fs::create_dir_all(dir.path().join("lfs/ab/cd")).unwrap();

    let entries = store.list().unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "org/beta", "org/team/gamma"]);
    assert!(entries.iter().all(|e| !e.is_mirror));
}

// ---------------------------------------------------------------------------
// mirror config / default branch
// ---------------------------------------------------------------------------

#[test]
fn mirror_config_reads_origin() {
    let dir = tempfile::tempdir().unwrap();
    let store = RepoStore::new(dir.path()).unwrap();

    let path = store.create("demo", "main").unwrap();
    assert_eq!(store.mirror_config(&path).unwrap(), (false, None));

    let mut config = git2::Config::open(&path.join("config")).unwrap();
    config
        .set_str("remote.origin.url", "https://example.com/up.git")
        .unwrap();
    config.set_bool("remote.origin.mirror", true).unwrap();

    let (is_mirror, url) = store.mirror_config(&path).unwrap();
    assert!(is_mirror);
    assert_eq!(url.as_deref(), Some("https://example.com/up.git"));
}

#[test]
fn default_branch_falls_back_to_main() {
    let dir = tempfile::tempdir().unwrap();
    let store = RepoStore::new(dir.path()).unwrap();

    let path = store.create("demo", "trunk").unwrap();
    assert_eq!(store.default_branch(&path), "trunk");

    // Detached or unreadable HEAD means main.
    std::fs::write(path.join("HEAD"), "0123456789abcdef0123456789abcdef01234567\n").unwrap();
    assert_eq!(store.default_branch(&path), "main");
}
