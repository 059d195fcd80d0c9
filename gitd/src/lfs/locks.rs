use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Read;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The holder of a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub name: String,
}

/// One LFS file lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub id: String,
    pub path: String,
    pub owner: Owner,
    pub locked_at: DateTime<Utc>,
}

type Table = BTreeMap<String, Vec<Lock>>;

/// Durable per-repository lock table.
///
/// The whole table is one JSON document keyed by repository name, with
/// each value sorted by `locked_at` ascending. Mutations are
/// read-modify-write transactions serialized across threads and
/// processes by an exclusive advisory lock on the table file, and made
/// durable by writing a temporary sibling and renaming it over the
/// original.
#[derive(Debug, Clone)]
pub struct LockStore {
    path: PathBuf,
}

impl LockStore {
    /// Open (or create) the lock table at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        Ok(LockStore { path })
    }

    fn with_table<T>(&self, mutate: bool, f: impl FnOnce(&mut Table) -> Result<T>) -> Result<T> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        if mutate {
            file.lock_exclusive().map_err(|e| Error::io(&self.path, e))?;
        } else {
            file.lock_shared().map_err(|e| Error::io(&self.path, e))?;
        }

        let result = self.transact(&file, mutate, f);

        let _ = fs2::FileExt::unlock(&file);
        result
    }

    fn transact<T>(
        &self,
        file: &std::fs::File,
        mutate: bool,
        f: impl FnOnce(&mut Table) -> Result<T>,
    ) -> Result<T> {
        let mut raw = String::new();
        let mut reader = file;
        reader
            .read_to_string(&mut raw)
            .map_err(|e| Error::io(&self.path, e))?;

        let mut table: Table = if raw.trim().is_empty() {
            Table::new()
        } else {
            serde_json::from_str(&raw)?
        };

        let value = f(&mut table)?;

        if mutate {
            let tmp = self.path.with_extension("tmp");
            let data = serde_json::to_vec(&table)?;
            std::fs::write(&tmp, data).map_err(|e| Error::io(&tmp, e))?;
            std::fs::rename(&tmp, &self.path).map_err(|e| Error::io(&self.path, e))?;
        }
        Ok(value)
    }

    /// Create a lock on `(repo, path)` held by `owner`.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyExists`] when any lock already covers that
    /// path in that repository.
    pub fn add(&self, repo: &str, path: &str, owner: &str) -> Result<Lock> {
        let lock = Lock {
            id: new_lock_id(),
            path: path.to_string(),
            owner: Owner {
                name: owner.to_string(),
            },
            locked_at: Utc::now(),
        };

        self.with_table(true, |table| {
            let locks = table.entry(repo.to_string()).or_default();
            if locks.iter().any(|l| l.path == path) {
                return Err(Error::already_exists(format!(
                    "lock already created: {}",
                    path,
                )));
            }
            locks.push(lock.clone());
            locks.sort_by(|a, b| a.locked_at.cmp(&b.locked_at).then(a.id.cmp(&b.id)));
            Ok(lock)
        })
    }

    /// All locks for `repo`, ordered by `locked_at` ascending.
    pub fn list(&self, repo: &str) -> Result<Vec<Lock>> {
        self.with_table(false, |table| {
            Ok(table.get(repo).cloned().unwrap_or_default())
        })
    }

    /// Cursor-paginated, path-filtered listing.
    ///
    /// `cursor` names the id of the first element to return; an unknown
    /// cursor is an error. `path` filters by exact match. A non-negative
    /// `limit` truncates the result, returning the id of the first
    /// dropped element as the next cursor.
    pub fn filtered(
        &self,
        repo: &str,
        path: Option<&str>,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<(Vec<Lock>, Option<String>)> {
        if let Some(limit) = limit {
            if limit < 0 {
                return Err(Error::invalid_input(format!("invalid limit {}", limit)));
            }
        }

        let mut locks = self.list(repo)?;

        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            let start = locks
                .iter()
                .position(|l| l.id == cursor)
                .ok_or_else(|| Error::invalid_input(format!("cursor {:?} not found", cursor)))?;
            locks.drain(..start);
        }

        if let Some(path) = path.filter(|p| !p.is_empty()) {
            locks.retain(|l| l.path == path);
        }

        let mut next_cursor = None;
        if let Some(limit) = limit {
            let limit = limit as usize;
            if locks.len() > limit {
                next_cursor = Some(locks[limit].id.clone());
                locks.truncate(limit);
            }
        }

        Ok((locks, next_cursor))
    }

    /// Remove the lock `id` in `repo` on behalf of `user`.
    ///
    /// Returns the removed lock, or `None` when no such lock exists.
    ///
    /// # Errors
    /// Returns [`Error::NotOwner`] when the lock belongs to someone else
    /// and `force` is not set.
    pub fn delete(&self, repo: &str, user: &str, id: &str, force: bool) -> Result<Option<Lock>> {
        self.with_table(true, |table| {
            let Some(locks) = table.get_mut(repo) else {
                return Ok(None);
            };
            let Some(idx) = locks.iter().position(|l| l.id == id) else {
                return Ok(None);
            };
            if locks[idx].owner.name != user && !force {
                return Err(Error::NotOwner(
                    id.to_string(),
                    locks[idx].owner.name.clone(),
                ));
            }
            let lock = locks.remove(idx);
            if locks.is_empty() {
                table.remove(repo);
            }
            Ok(Some(lock))
        })
    }
}

/// 20 random bytes as lowercase hex.
fn new_lock_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_ids_are_hex40() {
        let id = new_lock_id();
        assert_eq!(id.len(), 40);
        assert!(id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));
    }
}
