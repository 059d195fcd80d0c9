use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::lfs::ContentStore;
use crate::paths;
use crate::repo::RepoStore;
use crate::tasks::TaskMap;

/// Fetch refspec tracking all branches.
pub const HEADS_REFSPEC: &str = "+refs/heads/*:refs/heads/*";
/// Fetch refspec tracking all tags.
pub const TAGS_REFSPEC: &str = "+refs/tags/*:refs/tags/*";

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

/// Normalize an upstream URL: trim trailing slashes and ensure a `.git`
/// suffix.
pub fn normalize_source_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.ends_with(".git") {
        trimmed.to_string()
    } else {
        format!("{}.git", trimmed)
    }
}

/// Return true if `url` looks like a local filesystem path (no scheme prefix).
fn is_local_path(url: &str) -> bool {
    !url.starts_with("http://")
        && !url.starts_with("https://")
        && !url.starts_with("git://")
        && !url.starts_with("ssh://")
}

/// Resolve `url` to a local filesystem path (stripping `file://` if present).
fn local_path(url: &str) -> &str {
    url.strip_prefix("file://").unwrap_or(url)
}

// ---------------------------------------------------------------------------
// Subprocess plumbing
// ---------------------------------------------------------------------------

/// Run `git <args>` (optionally inside `dir`) and return stdout.
fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    let output = cmd.args(args).output()?;
    if !output.status.success() {
        return Err(Error::git_msg(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or(""),
            String::from_utf8_lossy(&output.stderr).trim(),
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Discover the default branch advertised by the upstream at `url` from
/// the `symref=HEAD:` capability of its ref advertisement.
///
/// # Errors
/// Returns [`Error::RemoteHead`] when the advertisement is unreachable
/// or carries no usable symref; callers may fall back to `main`.
pub fn remote_default_branch(url: &str) -> Result<String> {
    let listing = run_git(None, &["ls-remote", "--symref", url, "HEAD"])
        .map_err(|_| Error::RemoteHead(url.to_string()))?;

    for line in listing.lines() {
        // "ref: refs/heads/<name>\tHEAD"
        let Some(rest) = line.strip_prefix("ref: ") else {
            continue;
        };
        let target = rest.split('\t').next().unwrap_or(rest);
        if let Some(name) = target.strip_prefix("refs/heads/") {
            return Ok(name.trim().to_string());
        }
    }
    Err(Error::RemoteHead(url.to_string()))
}

// ---------------------------------------------------------------------------
// Ref enumeration
// ---------------------------------------------------------------------------

/// Heads and tags of the local repository as `{full_ref_name: hex SHA}`.
fn local_refs(repo_path: &Path) -> Result<HashMap<String, String>> {
    let repo = git2::Repository::open_bare(repo_path).map_err(Error::git)?;
    let mut refs = HashMap::new();

    let references = repo.references().map_err(Error::git)?;
    for r in references.flatten() {
        let name = match r.name() {
            Some(n) => n.to_string(),
            None => continue,
        };
        if !name.starts_with("refs/heads/") && !name.starts_with("refs/tags/") {
            continue;
        }
        if let Some(oid) = r.target().or_else(|| r.resolve().ok().and_then(|r| r.target())) {
            refs.insert(name, oid.to_string());
        }
    }

    Ok(refs)
}

/// Heads and tags advertised by the upstream, with `HEAD` and `^{}` peel
/// markers filtered out.
///
/// Local upstreams are opened directly; remote URLs are listed through an
/// anonymous remote on the mirror repository.
fn remote_refs(repo_path: &Path, url: &str) -> Result<HashMap<String, String>> {
    if is_local_path(url) {
        let path = Path::new(local_path(url));
        if !path.exists() {
            return Err(Error::upstream(format!("source {:?} does not exist", url)));
        }
        return local_refs(path);
    }

    let repo = git2::Repository::open_bare(repo_path).map_err(Error::git)?;
    let mut remote = repo.remote_anonymous(url).map_err(Error::git)?;
    remote
        .connect(git2::Direction::Fetch)
        .map_err(|e| Error::upstream(format!("connect {}: {}", url, e)))?;

    let mut refs = HashMap::new();
    for head in remote.list().map_err(Error::git)? {
        let name = head.name();
        if name.ends_with("^{}")
            || (!name.starts_with("refs/heads/") && !name.starts_with("refs/tags/"))
        {
            continue;
        }
        refs.insert(name.to_string(), head.oid().to_string());
    }

    let _ = remote.disconnect();
    Ok(refs)
}

// ---------------------------------------------------------------------------
// Per-repo sync state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SyncState {
    syncing: bool,
    last_sync: Option<Instant>,
    last_err: Option<String>,
}

#[derive(Default)]
struct SyncSlot {
    state: Mutex<SyncState>,
    done: Condvar,
}

/// Coalesces concurrent syncs per repository.
///
/// While a sync runs, later callers join it: they block on the condvar
/// barrier until the running sync finishes and then return, so at most
/// one fetch is in flight per repository. Outcomes are cached in the
/// slot; a failed sync never blocks serving stale data.
#[derive(Default)]
pub struct SyncPool {
    slots: Mutex<HashMap<PathBuf, Arc<SyncSlot>>>,
}

impl SyncPool {
    fn slot(&self, repo: &Path) -> Arc<SyncSlot> {
        let mut slots = self.slots.lock().expect("sync pool poisoned");
        Arc::clone(slots.entry(repo.to_path_buf()).or_default())
    }

    /// Run `f` as the repository's sync unless one is already running
    /// (join it) or the cooldown has not elapsed (skip).
    fn run(
        &self,
        repo: &Path,
        force: bool,
        cooldown: Duration,
        f: impl FnOnce() -> Result<bool>,
    ) -> Result<()> {
        let slot = self.slot(repo);
        {
            let mut state = slot.state.lock().expect("sync slot poisoned");
            let mut joined = false;
            while state.syncing {
                joined = true;
                state = slot.done.wait(state).expect("sync slot poisoned");
            }
            if joined {
                // The sync we waited on is the freshest possible state.
                return Ok(());
            }
            if !force {
                if let Some(last) = state.last_sync {
                    if last.elapsed() < cooldown {
                        return Ok(());
                    }
                }
            }
            state.syncing = true;
        }

        let result = f();

        let mut state = slot.state.lock().expect("sync slot poisoned");
        state.syncing = false;
        match &result {
            Ok(fetched) => {
                state.last_sync = Some(Instant::now());
                state.last_err = None;
                if *fetched {
                    info!(repo = %repo.display(), "mirror refs updated");
                }
            }
            Err(e) => {
                state.last_err = Some(e.to_string());
                warn!(repo = %repo.display(), error = %e, "mirror sync failed");
            }
        }
        slot.done.notify_all();
        drop(state);

        Ok(())
    }

    /// Record a successful sync without running one (used after import).
    fn note_success(&self, repo: &Path) {
        let slot = self.slot(repo);
        let mut state = slot.state.lock().expect("sync slot poisoned");
        state.last_sync = Some(Instant::now());
        state.last_err = None;
    }

    /// The cached error of the most recent failed sync, if any.
    pub fn last_error(&self, repo: &Path) -> Option<String> {
        let slot = self.slot(repo);
        let state = slot.state.lock().expect("sync slot poisoned");
        state.last_err.clone()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The mirror engine: initializes mirrors, runs the progressive import
/// pipeline, and keeps mirrors synchronized on demand.
pub struct MirrorEngine {
    store: RepoStore,
    lfs: ContentStore,
    tasks: TaskMap,
    sync: SyncPool,
    cooldown: Duration,
}

impl MirrorEngine {
    pub fn new(store: RepoStore, lfs: ContentStore, cooldown: Duration) -> Self {
        MirrorEngine {
            store,
            lfs,
            tasks: TaskMap::new(),
            sync: SyncPool::default(),
            cooldown,
        }
    }

    /// The import/sync task table.
    pub fn tasks(&self) -> &TaskMap {
        &self.tasks
    }

    /// Task record for the repository at `url_path`.
    pub fn import_status(&self, url_path: &str) -> Option<crate::tasks::Task> {
        let path = self.store.resolve(url_path).ok()?;
        self.tasks.get(&paths::repo_name(self.store.root(), &path))
    }

    /// Create the mirror repository and register its import task.
    ///
    /// The upstream default branch is discovered from the source's ref
    /// advertisement and becomes the initial `HEAD`; discovery failures
    /// fall back to `main`. A partially created repository is removed on
    /// any later failure.
    ///
    /// # Errors
    /// [`Error::AlreadyExists`] when the repository exists or an import
    /// for it is already running.
    pub fn prepare_import(&self, url_path: &str, source_url: &str) -> Result<()> {
        let source = normalize_source_url(source_url);
        let path = self.store.resolve(url_path)?;
        let name = paths::repo_name(self.store.root(), &path);

        if paths::is_repository(&path) {
            return Err(Error::already_exists(format!("repository {:?}", url_path)));
        }
        let preexisting = path.exists();

        self.tasks.begin(&name)?;

        let branch = match remote_default_branch(&source) {
            Ok(branch) => branch,
            Err(e) => {
                warn!(source = %source, error = %e, "default branch discovery failed");
                "main".to_string()
            }
        };

        let created = self
            .store
            .create(url_path, &branch)
            .and_then(|path| configure_mirror(&path, &source).map(|_| path));

        match created {
            Ok(_) => {
                info!(repo = %name, source = %source, branch = %branch, "mirror initialized");
                Ok(())
            }
            Err(e) => {
                // Only remove what this call created.
                if !preexisting {
                    let _ = std::fs::remove_dir_all(&path);
                }
                self.tasks.fail(&name, e.to_string());
                Err(e)
            }
        }
    }

    /// Run the progressive fetch pipeline for an initialized mirror.
    ///
    /// Intended to run on a background thread after
    /// [`prepare_import`](Self::prepare_import); the outcome is published
    /// through the task table, never returned.
    pub fn run_import(&self, url_path: &str) {
        let (name, path, source) = match self.import_target(url_path) {
            Ok(target) => target,
            Err(e) => {
                warn!(repo = %url_path, error = %e, "import target vanished");
                return;
            }
        };

        let default = self.store.default_branch(&path);

        // Shallow staircase: each phase makes the mirror servable sooner;
        // only the final full fetch is allowed to fail the task.
        self.tasks.set_step(&name, "fetching default branch (shallow)");
        let branch_spec = format!("+refs/heads/{0}:refs/heads/{0}", default);
        self.phase(&name, &path, &[
            "fetch", "--depth=1", "--filter=blob:none", "origin", branch_spec.as_str(),
        ]);

        self.tasks.set_step(&name, "fetching all refs (shallow)");
        self.phase(&name, &path, &[
            "fetch", "--depth=1", "--filter=blob:none", "origin", HEADS_REFSPEC, TAGS_REFSPEC,
        ]);

        self.tasks.set_step(&name, "deepening history");
        self.phase(&name, &path, &[
            "fetch", "--depth=10", "--filter=blob:none", "origin", HEADS_REFSPEC, TAGS_REFSPEC,
        ]);

        self.tasks.set_step(&name, "completing history");
        let shallow = run_git(Some(&path), &["rev-parse", "--is-shallow-repository"])
            .map(|out| out.trim() == "true")
            .unwrap_or(false);
        let full = if shallow {
            run_git(Some(&path), &[
                "fetch", "--unshallow", "--prune", "origin", HEADS_REFSPEC, TAGS_REFSPEC,
            ])
        } else {
            run_git(Some(&path), &[
                "fetch", "--prune", "origin", HEADS_REFSPEC, TAGS_REFSPEC,
            ])
        };
        if let Err(e) = full {
            self.tasks.fail(&name, e.to_string());
            warn!(repo = %name, error = %e, "import failed");
            return;
        }
        self.sync.note_success(&path);

        self.tasks.set_step(&name, "transferring lfs objects");
        match crate::lfs::import_objects(&path, &source, &self.lfs) {
            Ok(fetched) => {
                if fetched > 0 {
                    info!(repo = %name, fetched, "lfs objects imported");
                }
                self.tasks.set_step(&name, "done");
            }
            // LFS is best-effort: a missing tool or upstream batch error
            // leaves a completed mirror without large objects.
            Err(e) => {
                warn!(repo = %name, error = %e, "lfs transfer incomplete");
                self.tasks.set_step(&name, format!("lfs transfer incomplete: {}", e));
            }
        }

        self.tasks.complete(&name);
        info!(repo = %name, "import completed");
    }

    fn import_target(&self, url_path: &str) -> Result<(String, PathBuf, String)> {
        let path = self.store.open(url_path)?;
        let name = paths::repo_name(self.store.root(), &path);
        let (is_mirror, source) = self.store.mirror_config(&path)?;
        let source = source.filter(|_| is_mirror).ok_or_else(|| {
            Error::invalid_input(format!("repository {:?} is not a mirror", url_path))
        })?;
        Ok((name, path, source))
    }

    fn phase(&self, name: &str, path: &Path, args: &[&str]) {
        if let Err(e) = run_git(Some(path), args) {
            debug!(repo = %name, error = %e, "import phase incomplete");
        }
    }

    /// Bring the mirror at `url_path` up to date with its upstream if it
    /// is stale. No-op for non-mirrors. Concurrent calls coalesce; a
    /// cooldown suppresses upstream probing between bursts unless
    /// `force` is set. Sync failures are cached, not returned: reads
    /// proceed against the existing refs.
    ///
    /// # Errors
    /// Only repository resolution errors surface (`NotFound` etc.).
    pub fn ensure_synced(&self, url_path: &str, force: bool) -> Result<()> {
        let path = self.store.open(url_path)?;
        let (is_mirror, source) = self.store.mirror_config(&path)?;
        let Some(source) = source.filter(|_| is_mirror) else {
            return Ok(());
        };

        self.sync
            .run(&path, force, self.cooldown, || sync_refs(&path, &source))
    }

    /// The cached error of the most recent failed sync for `url_path`.
    pub fn last_sync_error(&self, url_path: &str) -> Option<String> {
        let path = self.store.resolve(url_path).ok()?;
        self.sync.last_error(&path)
    }
}

/// Write the mirror remote into the repository config: origin URL, the
/// mirror flag, and the heads + tags fetch refspecs.
fn configure_mirror(path: &Path, source: &str) -> Result<()> {
    let repo = git2::Repository::open_bare(path).map_err(Error::git)?;
    repo.remote_with_fetch("origin", source, HEADS_REFSPEC)
        .map_err(Error::git)?;
    repo.remote_add_fetch("origin", TAGS_REFSPEC)
        .map_err(Error::git)?;
    repo.config()
        .and_then(|mut c| c.set_bool("remote.origin.mirror", true))
        .map_err(Error::git)?;
    Ok(())
}

/// Probe upstream refs and fetch when anything differs.
///
/// Returns whether a fetch ran.
fn sync_refs(path: &Path, source: &str) -> Result<bool> {
    let local = local_refs(path)?;
    let remote = remote_refs(path, source).map_err(|e| Error::upstream(e.to_string()))?;

    if local == remote {
        debug!(repo = %path.display(), "mirror refs current");
        return Ok(false);
    }

    run_git(Some(path), &["fetch", "--prune", "origin", HEADS_REFSPEC, TAGS_REFSPEC])
        .map_err(|e| Error::upstream(e.to_string()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_source_urls() {
        assert_eq!(
            normalize_source_url("https://example.com/a/b"),
            "https://example.com/a/b.git"
        );
        assert_eq!(
            normalize_source_url("https://example.com/a/b.git/"),
            "https://example.com/a/b.git"
        );
        assert_eq!(
            normalize_source_url("https://example.com/a/b.git"),
            "https://example.com/a/b.git"
        );
    }

    #[test]
    fn local_url_detection() {
        assert!(is_local_path("/srv/upstream.git"));
        assert!(is_local_path("file:///srv/upstream.git"));
        assert!(!is_local_path("https://example.com/r.git"));
        assert!(!is_local_path("git://example.com/r.git"));
        assert_eq!(local_path("file:///srv/x.git"), "/srv/x.git");
    }
}
