use std::sync::Arc;

use gitd::{ContentStore, LockStore, MirrorEngine, RepoStore};

use crate::auth::Authenticator;

/// Shared server state: handles to the core components plus the
/// optional authenticator. The server owns the components; no component
/// holds the server back.
pub struct AppState {
    pub repos: RepoStore,
    pub mirrors: Arc<MirrorEngine>,
    pub lfs: ContentStore,
    pub locks: LockStore,
    pub auth: Option<Arc<dyn Authenticator>>,
    /// URL prefix the server is mounted under, e.g. `/git`. Empty when
    /// serving from the root.
    pub prefix: String,
}

impl AppState {
    /// Strip the configured mount prefix from a request path.
    ///
    /// Returns `None` when a prefix is configured and the path lies
    /// outside it.
    pub fn strip_prefix<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            return Some(path);
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) if rest.is_empty() => Some("/"),
            Some(rest) if rest.starts_with('/') => Some(rest),
            _ => None,
        }
    }
}
