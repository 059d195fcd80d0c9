//! LFS file-locking endpoints.

use std::sync::Arc;

use axum::extract::{Query, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use gitd::{paths, Lock};

use crate::auth;
use crate::respond::{error_lfs, lfs_json, message_lfs};
use crate::state::AppState;

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<String>,
}

#[derive(Serialize)]
struct LockList {
    locks: Vec<Lock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct VerifyBody {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Serialize)]
struct VerifyList {
    ours: Vec<Lock>,
    theirs: Vec<Lock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct CreateBody {
    path: String,
}

#[derive(Serialize)]
struct OneLock {
    lock: Lock,
}

#[derive(Deserialize, Default)]
struct UnlockBody {
    #[serde(default)]
    force: bool,
}

/// Resolve the URL repo path to the lock-table key, which is the same
/// for `demo`, `/demo` and `demo.git`.
fn lock_key(state: &AppState, repo: &str) -> Result<String, Response> {
    match state.repos.open(repo) {
        Ok(path) => Ok(paths::repo_name(state.repos.root(), &path)),
        Err(_) => Err(message_lfs(StatusCode::NOT_FOUND, "repository not found")),
    }
}

/// `GET {repo}/info/lfs/locks`
pub async fn list(state: Arc<AppState>, repo: &str, req: Request) -> Response {
    if let Err(resp) = auth::require(&state, req.headers()) {
        return resp;
    }
    let key = match lock_key(&state, repo) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    let query: ListQuery = match Query::try_from_uri(req.uri()) {
        Ok(Query(query)) => query,
        Err(e) => return message_lfs(StatusCode::BAD_REQUEST, format!("bad query: {}", e)),
    };
    let limit = match query.limit.as_deref().filter(|l| !l.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<i64>() {
            Ok(limit) => Some(limit),
            Err(_) => {
                return message_lfs(StatusCode::BAD_REQUEST, format!("invalid limit {:?}", raw))
            }
        },
    };

    let locks = state.locks.clone();
    let result = tokio::task::spawn_blocking(move || {
        locks.filtered(
            &key,
            query.path.as_deref(),
            query.cursor.as_deref(),
            limit,
        )
    })
    .await;

    match result {
        Ok(Ok((locks, next_cursor))) => {
            lfs_json(StatusCode::OK, &LockList { locks, next_cursor })
        }
        Ok(Err(e)) => error_lfs(&e),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// `POST {repo}/info/lfs/locks/verify`
pub async fn verify(state: Arc<AppState>, repo: &str, req: Request) -> Response {
    let principal = match auth::require(&state, req.headers()) {
        Ok(principal) => principal,
        Err(resp) => return resp,
    };
    let key = match lock_key(&state, repo) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    let body = match axum::body::to_bytes(req.into_body(), 1024 * 1024).await {
        Ok(body) => body,
        Err(_) => return message_lfs(StatusCode::BAD_REQUEST, "unreadable request body"),
    };
    let request: VerifyBody = if body.is_empty() {
        VerifyBody {
            cursor: None,
            limit: None,
        }
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return message_lfs(StatusCode::BAD_REQUEST, format!("bad body: {}", e)),
        }
    };
    let limit = request.limit.unwrap_or(100);

    let locks = state.locks.clone();
    let cursor = request.cursor.clone();
    let result = tokio::task::spawn_blocking(move || {
        locks.filtered(&key, None, cursor.as_deref(), Some(limit))
    })
    .await;

    match result {
        Ok(Ok((locks, next_cursor))) => {
            let (ours, theirs) = locks
                .into_iter()
                .partition(|lock| lock.owner.name == principal);
            lfs_json(
                StatusCode::OK,
                &VerifyList {
                    ours,
                    theirs,
                    next_cursor,
                },
            )
        }
        Ok(Err(e)) => error_lfs(&e),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// `POST {repo}/info/lfs/locks`
pub async fn create(state: Arc<AppState>, repo: &str, req: Request) -> Response {
    let principal = match auth::require(&state, req.headers()) {
        Ok(principal) => principal,
        Err(resp) => return resp,
    };
    let key = match lock_key(&state, repo) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    let body = match axum::body::to_bytes(req.into_body(), 1024 * 1024).await {
        Ok(body) => body,
        Err(_) => return message_lfs(StatusCode::BAD_REQUEST, "unreadable request body"),
    };
    let request: CreateBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return message_lfs(StatusCode::BAD_REQUEST, format!("bad body: {}", e)),
    };
    if request.path.is_empty() {
        return message_lfs(StatusCode::BAD_REQUEST, "path required");
    }

    let locks = state.locks.clone();
    let result =
        tokio::task::spawn_blocking(move || locks.add(&key, &request.path, &principal)).await;

    match result {
        Ok(Ok(lock)) => {
            debug!(id = %lock.id, path = %lock.path, "lock created");
            lfs_json(StatusCode::CREATED, &OneLock { lock })
        }
        Ok(Err(e)) => error_lfs(&e),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// `POST {repo}/info/lfs/locks/{id}/unlock`
pub async fn unlock(state: Arc<AppState>, repo: &str, id: &str, req: Request) -> Response {
    let principal = match auth::require(&state, req.headers()) {
        Ok(principal) => principal,
        Err(resp) => return resp,
    };
    let key = match lock_key(&state, repo) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    let body = match axum::body::to_bytes(req.into_body(), 1024 * 1024).await {
        Ok(body) => body,
        Err(_) => return message_lfs(StatusCode::BAD_REQUEST, "unreadable request body"),
    };
    let request: UnlockBody = if body.is_empty() {
        UnlockBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return message_lfs(StatusCode::BAD_REQUEST, format!("bad body: {}", e)),
        }
    };

    let locks = state.locks.clone();
    let id = id.to_string();
    let result = tokio::task::spawn_blocking(move || {
        locks.delete(&key, &principal, &id, request.force)
    })
    .await;

    match result {
        Ok(Ok(Some(lock))) => lfs_json(StatusCode::OK, &OneLock { lock }),
        Ok(Ok(None)) => message_lfs(StatusCode::NOT_FOUND, "lock not found"),
        Ok(Err(e)) => error_lfs(&e),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
