//! Repository orchestration core for the gitd hosting server.
//!
//! `gitd` manages bare git repositories on a hierarchical filesystem
//! namespace and keeps lazy, progressively-fetched mirrors of upstream
//! repositories, alongside a Git LFS backend (content-addressed object
//! pool and durable file locks). The companion `gitd-server` binary puts
//! this core behind the Smart-HTTP and git daemon protocols.
//!
//! # Key types
//!
//! - [`RepoStore`] — creates, opens, deletes, and enumerates bare
//!   repositories under a root directory.
//! - [`MirrorEngine`] — initializes mirrors, runs the progressive import
//!   pipeline, and coalesces on-demand ref synchronization.
//! - [`ContentStore`] — the global content-addressed LFS object pool.
//! - [`LockStore`] — the per-repository LFS file-lock table.
//!
//! All I/O is blocking; async callers wrap operations in
//! `spawn_blocking`.
//!
//! # Quick example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use gitd::{ContentStore, MirrorEngine, RepoStore};
//!
//! let repos = RepoStore::new("/srv/gitd").unwrap();
//! let lfs = ContentStore::new(repos.root().join("lfs")).unwrap();
//! let mirrors = MirrorEngine::new(repos.clone(), lfs, Duration::from_secs(10));
//!
//! repos.create("demo", "main").unwrap();
//! mirrors.ensure_synced("demo", false).unwrap(); // no-op: not a mirror
//! ```

pub mod error;
pub mod lfs;
pub mod mirror;
pub mod paths;
pub mod pkt;
pub mod repo;
pub mod service;
pub mod tasks;

// Re-export primary public types at crate root.
pub use error::{Error, Result};
pub use lfs::{ContentStore, Lock, LockStore, Owner};
pub use mirror::MirrorEngine;
pub use repo::{RepoEntry, RepoStore};
pub use service::Service;
pub use tasks::{Task, TaskMap, TaskStatus};
