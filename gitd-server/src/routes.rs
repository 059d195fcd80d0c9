use std::sync::Arc;

use axum::routing::{any, get, post};
use axum::Router;

use crate::state::AppState;
use crate::{api, lfs, smart};

/// Build the full route table.
///
/// Management and object endpoints are fixed routes; Git smart paths and
/// repo-scoped LFS paths nest arbitrarily deep, so they are dispatched
/// by suffix from the fallback.
pub fn router(state: Arc<AppState>) -> Router {
    let base = Router::new()
        .route("/api/repositories", get(api::list_repositories))
        .route("/api/repositories/{*rest}", any(api::dispatch))
        .route("/objects/{oid}", get(lfs::get_object).put(lfs::put_object))
        .route("/objects/{oid}/verify", post(lfs::verify_object));

    let app = if state.prefix.is_empty() {
        base
    } else {
        Router::new().nest(&state.prefix, base)
    };

    // The fallback sees the original (unstripped) URI; dispatch removes
    // the mount prefix itself.
    app.fallback(smart::dispatch).with_state(state)
}
