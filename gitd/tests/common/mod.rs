use std::path::{Path, PathBuf};

/// Create a bare repository with one commit on `branch`.
pub fn init_source(dir: &Path, branch: &str) -> PathBuf {
    let path = dir.join("source.git");
    let mut opts = git2::RepositoryInitOptions::new();
    opts.bare(true);
    opts.initial_head(branch);
    let repo = git2::Repository::init_opts(&path, &opts).unwrap();
    commit_file(&repo, branch, "README.md", b"# Demo\n", "init");
    path
}

/// Commit a single file onto `branch`, creating the branch if needed.
pub fn commit_file(
    repo: &git2::Repository,
    branch: &str,
    file: &str,
    data: &[u8],
    message: &str,
) {
    let blob = repo.blob(data).unwrap();
    let refname = format!("refs/heads/{}", branch);

    let parent = repo
        .find_reference(&refname)
        .ok()
        .and_then(|r| r.target())
        .map(|oid| repo.find_commit(oid).unwrap());
    let parent_tree = parent.as_ref().map(|c| c.tree().unwrap());

    let mut builder = repo.treebuilder(parent_tree.as_ref()).unwrap();
    builder.insert(file, blob, 0o100644).unwrap();
    let tree_oid = builder.write().unwrap();
    let tree = repo.find_tree(tree_oid).unwrap();

    let sig = git2::Signature::now("test", "test@localhost").unwrap();
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some(&refname), &sig, &sig, message, &tree, &parents)
        .unwrap();
}

/// Tip commit id of `branch`, as hex.
pub fn branch_tip(path: &Path, branch: &str) -> Option<String> {
    let repo = git2::Repository::open_bare(path).ok()?;
    let reference = repo
        .find_reference(&format!("refs/heads/{}", branch))
        .ok()?;
    reference.target().map(|oid| oid.to_string())
}

#[allow(dead_code)]
pub fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}
