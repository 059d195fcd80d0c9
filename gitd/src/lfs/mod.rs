//! Git LFS backend: the content-addressed object pool, the durable file
//! lock table, and the upstream batch client used during mirror import.

pub mod client;
pub mod content;
pub mod locks;

pub use client::{import_objects, PointerRef};
pub use content::{is_valid_oid, ContentStore};
pub use locks::{Lock, LockStore, Owner};
