//! Process-local state for background import and sync tasks.
//!
//! One record per repository while a pipeline runs; records survive until
//! overwritten by the next run and are lost on restart.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Completed,
    Failed,
}

/// The observable state of one import/sync pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub status: TaskStatus,
    pub step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Map of repository name to task record, guarded by a reader-writer
/// lock. Writers touch it only on create, step update, and terminal
/// transition.
#[derive(Debug, Default)]
pub struct TaskMap {
    inner: RwLock<HashMap<String, Task>>,
}

impl TaskMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new in-progress task for `repo`.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyExists`] while a previous task for the
    /// same repository is still in progress.
    pub fn begin(&self, repo: &str) -> Result<()> {
        let mut map = self.inner.write().expect("task map poisoned");
        if let Some(task) = map.get(repo) {
            if task.status == TaskStatus::InProgress {
                return Err(Error::already_exists(format!(
                    "import of {:?} already in progress",
                    repo,
                )));
            }
        }
        map.insert(
            repo.to_string(),
            Task {
                status: TaskStatus::InProgress,
                step: "queued".to_string(),
                error: None,
            },
        );
        Ok(())
    }

    /// Record the current phase label of a running task.
    pub fn set_step(&self, repo: &str, step: impl Into<String>) {
        let mut map = self.inner.write().expect("task map poisoned");
        if let Some(task) = map.get_mut(repo) {
            task.step = step.into();
        }
    }

    /// Transition the task to `completed`.
    pub fn complete(&self, repo: &str) {
        let mut map = self.inner.write().expect("task map poisoned");
        if let Some(task) = map.get_mut(repo) {
            task.status = TaskStatus::Completed;
        }
    }

    /// Transition the task to `failed` with an error message.
    pub fn fail(&self, repo: &str, error: impl Into<String>) {
        let mut map = self.inner.write().expect("task map poisoned");
        if let Some(task) = map.get_mut(repo) {
            task.status = TaskStatus::Failed;
            task.error = Some(error.into());
        }
    }

    /// Snapshot of the task record for `repo`, if any.
    pub fn get(&self, repo: &str) -> Option<Task> {
        self.inner
            .read()
            .expect("task map poisoned")
            .get(repo)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_conflicts_while_running() {
        let tasks = TaskMap::new();
        tasks.begin("demo").unwrap();
        assert!(tasks.begin("demo").is_err());

        tasks.complete("demo");
        assert!(tasks.begin("demo").is_ok());
    }

    #[test]
    fn terminal_transitions() {
        let tasks = TaskMap::new();
        tasks.begin("demo").unwrap();
        tasks.set_step("demo", "fetch default branch");
        tasks.fail("demo", "upstream unreachable");

        let task = tasks.get("demo").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.step, "fetch default branch");
        assert_eq!(task.error.as_deref(), Some("upstream unreachable"));
        assert!(tasks.get("other").is_none());
    }
}
