use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Resolve a URL repository path to an absolute path under `root`.
///
/// Strips leading slashes, appends `.git` when missing, joins with `root`
/// and lexically normalizes the result. Any path that would escape `root`
/// is rejected; the result is not required to exist on disk.
///
/// # Arguments
/// * `root` - Absolute repository root directory.
/// * `url_path` - Raw repository path from the request URL.
///
/// # Errors
/// Returns [`Error::InvalidPath`] for empty paths and path traversal.
pub fn resolve(root: &Path, url_path: &str) -> Result<PathBuf> {
    let trimmed = url_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(Error::invalid_path("repository path must not be empty"));
    }

    let mut segments: Vec<&str> = Vec::new();
    for seg in trimmed.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                // Popping past the root escapes rootDir.
                if segments.pop().is_none() {
                    return Err(Error::invalid_path(format!(
                        "path {:?} escapes the repository root",
                        url_path,
                    )));
                }
            }
            _ => segments.push(seg),
        }
    }

    if segments.is_empty() {
        return Err(Error::invalid_path("repository path must not be empty"));
    }

    let mut rel = segments.join("/");
    if !rel.ends_with(".git") {
        rel.push_str(".git");
    }

    Ok(root.join(rel))
}

/// Returns `true` when `path` holds a bare repository: a non-empty `HEAD`
/// regular file exists. Tolerates both `git init --bare` output and
/// minimal hand-built bare trees.
pub fn is_repository(path: &Path) -> bool {
    let head = path.join("HEAD");
    match std::fs::metadata(&head) {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// The URL-facing name of a repository at `path` relative to `root`:
/// the relative path with a trailing `.git` removed and `/` separators.
pub fn repo_name(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let name = rel.to_string_lossy().replace('\\', "/");
    name.strip_suffix(".git").unwrap_or(&name).to_string()
}
