use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::paths;

/// One entry from [`RepoStore::list`].
#[derive(Debug, Clone, Serialize)]
pub struct RepoEntry {
    pub name: String,
    pub is_mirror: bool,
}

/// Store of bare repositories rooted at a single directory.
///
/// Repositories nest arbitrarily deep below the root; the reserved `lfs/`
/// sibling holds the LFS object pool and lock table and is never listed.
#[derive(Debug, Clone)]
pub struct RepoStore {
    root: PathBuf,
}

impl RepoStore {
    /// Open a store rooted at `root`, creating the directory when absent.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
        let root = root.canonicalize().map_err(|e| Error::io(&root, e))?;
        Ok(RepoStore { root })
    }

    /// The repository root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a URL repository path to an absolute path under the root.
    /// The result may not exist; see [`paths::resolve`].
    pub fn resolve(&self, url_path: &str) -> Result<PathBuf> {
        paths::resolve(&self.root, url_path)
    }

    /// Resolve `url_path` and require an existing repository there.
    pub fn open(&self, url_path: &str) -> Result<PathBuf> {
        let path = self.resolve(url_path)?;
        if !paths::is_repository(&path) {
            return Err(Error::not_found(format!("repository {:?}", url_path)));
        }
        Ok(path)
    }

    /// Create an empty bare repository with `HEAD` pointing at
    /// `refs/heads/<default_branch>`.
    ///
    /// Shallow pushes are accepted (`receive.shallowupdate`).
    ///
    /// # Errors
    /// Returns [`Error::AlreadyExists`] when a repository is already
    /// present at the resolved path.
    pub fn create(&self, url_path: &str, default_branch: &str) -> Result<PathBuf> {
        let path = self.resolve(url_path)?;
        if paths::is_repository(&path) {
            return Err(Error::already_exists(format!("repository {:?}", url_path)));
        }

        let mut opts = git2::RepositoryInitOptions::new();
        opts.bare(true);
        opts.initial_head(default_branch);

        let repo = git2::Repository::init_opts(&path, &opts).map_err(Error::git)?;
        repo.config()
            .and_then(|mut c| c.set_bool("receive.shallowupdate", true))
            .map_err(Error::git)?;

        Ok(path)
    }

    /// Remove the repository at `url_path` and its whole on-disk tree.
    pub fn delete(&self, url_path: &str) -> Result<()> {
        let path = self.open(url_path)?;
        std::fs::remove_dir_all(&path).map_err(|e| Error::io(&path, e))?;
        Ok(())
    }

    /// Enumerate all repositories below the root.
    ///
    /// The walk emits one entry per directory passing the repository
    /// probe and does not descend into matched subtrees, so the cost is
    /// linear in the number of repositories.
    pub fn list(&self) -> Result<Vec<RepoEntry>> {
        let mut entries = Vec::new();
        self.walk(&self.root, &mut entries)?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<RepoEntry>) -> Result<()> {
        let read = match std::fs::read_dir(dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io(dir, e)),
        };

        for entry in read {
            let entry = entry.map_err(|e| Error::io(dir, e))?;
            let path = entry.path();

            // DirEntry::metadata does not traverse symlinks, so links out
            // of the root are skipped rather than followed.
            let meta = entry.metadata().map_err(|e| Error::io(&path, e))?;
            if !meta.is_dir() {
                continue;
            }
            // The LFS pool is a sibling of the repositories, not one of them.
            if dir == self.root && entry.file_name() == "lfs" {
                continue;
            }

            if paths::is_repository(&path) {
                let (is_mirror, _) = self.mirror_config(&path)?;
                out.push(RepoEntry {
                    name: paths::repo_name(&self.root, &path),
                    is_mirror,
                });
            } else {
                self.walk(&path, out)?;
            }
        }
        Ok(())
    }

    /// Whether the repository at `path` is a mirror, and its origin URL.
    ///
    /// A repository is a mirror iff `remote.origin.mirror` is set in its
    /// embedded config; the URL is `remote.origin.url`.
    pub fn mirror_config(&self, path: &Path) -> Result<(bool, Option<String>)> {
        let config_path = path.join("config");
        if !config_path.is_file() {
            return Ok((false, None));
        }
        let config = git2::Config::open(&config_path).map_err(Error::git)?;
        let mirror = config.get_bool("remote.origin.mirror").unwrap_or(false);
        let url = config.get_string("remote.origin.url").ok();
        if mirror {
            Ok((true, url))
        } else {
            Ok((false, None))
        }
    }

    /// The default branch of the repository at `path`: the symbolic
    /// target of `HEAD` with the `refs/heads/` prefix removed, falling
    /// back to `main` when `HEAD` is absent or detached.
    pub fn default_branch(&self, path: &Path) -> String {
        let head = match std::fs::read_to_string(path.join("HEAD")) {
            Ok(head) => head,
            Err(_) => return "main".to_string(),
        };
        head.trim()
            .strip_prefix("ref: refs/heads/")
            .map(str::to_string)
            .unwrap_or_else(|| "main".to_string())
    }
}
