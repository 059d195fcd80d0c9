//! JSON management API under `/api/repositories`.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::info;

use gitd::RepoEntry;

use crate::auth;
use crate::respond::{error_json, json_response, message_json};
use crate::state::AppState;

#[derive(Serialize)]
struct RepoList {
    repositories: Vec<RepoEntry>,
}

#[derive(Deserialize, Default)]
struct CreateBody {
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Deserialize)]
struct ImportBody {
    source_url: String,
}

#[derive(Serialize)]
struct MirrorInfo {
    is_mirror: bool,
    source_url: String,
}

/// `GET /api/repositories`
pub async fn list_repositories(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = auth::require(&state, &headers) {
        return resp;
    }

    let repos = state.repos.clone();
    match tokio::task::spawn_blocking(move || repos.list()).await {
        Ok(Ok(repositories)) => json_response(StatusCode::OK, &RepoList { repositories }),
        Ok(Err(e)) => error_json(&e),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Suffix dispatch for `/api/repositories/{repo}[.git][/...]`.
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
    req: Request,
) -> Response {
    if let Err(resp) = auth::require(&state, req.headers()) {
        return resp;
    }

    if let Some(repo) = rest.strip_suffix("/import/status") {
        return if req.method() == Method::GET {
            import_status(state, repo).await
        } else {
            StatusCode::METHOD_NOT_ALLOWED.into_response()
        };
    }
    if let Some(repo) = rest.strip_suffix("/import") {
        return if req.method() == Method::POST {
            import(state, repo.to_string(), req).await
        } else {
            StatusCode::METHOD_NOT_ALLOWED.into_response()
        };
    }
    if let Some(repo) = rest.strip_suffix("/sync") {
        return if req.method() == Method::POST {
            sync(state, repo).await
        } else {
            StatusCode::METHOD_NOT_ALLOWED.into_response()
        };
    }
    if let Some(repo) = rest.strip_suffix("/mirror") {
        return if req.method() == Method::GET {
            mirror_info(state, repo).await
        } else {
            StatusCode::METHOD_NOT_ALLOWED.into_response()
        };
    }

    if req.method() == Method::POST {
        create(state, rest, req).await
    } else if req.method() == Method::DELETE {
        delete(state, &rest).await
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

/// `POST /api/repositories/{repo}.git`
async fn create(state: Arc<AppState>, repo: String, req: Request) -> Response {
    let body = match axum::body::to_bytes(req.into_body(), 64 * 1024).await {
        Ok(body) => body,
        Err(_) => return message_json(StatusCode::BAD_REQUEST, "unreadable request body"),
    };
    let options: CreateBody = if body.is_empty() {
        CreateBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(options) => options,
            Err(e) => return message_json(StatusCode::BAD_REQUEST, format!("bad body: {}", e)),
        }
    };
    let branch = options.default_branch.unwrap_or_else(|| "main".to_string());

    let repos = state.repos.clone();
    let result = tokio::task::spawn_blocking(move || repos.create(&repo, &branch)).await;
    match result {
        Ok(Ok(path)) => {
            info!(repo = %path.display(), "repository created");
            StatusCode::CREATED.into_response()
        }
        Ok(Err(e)) => error_json(&e),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// `DELETE /api/repositories/{repo}.git`
async fn delete(state: Arc<AppState>, repo: &str) -> Response {
    let repos = state.repos.clone();
    let repo = repo.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let deleted = repos.delete(&repo);
        if deleted.is_ok() {
            info!(repo, "repository deleted");
        }
        deleted
    })
    .await;
    match result {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => error_json(&e),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// `POST /api/repositories/{repo}.git/import`
async fn import(state: Arc<AppState>, repo: String, req: Request) -> Response {
    let body = match axum::body::to_bytes(req.into_body(), 64 * 1024).await {
        Ok(body) => body,
        Err(_) => return message_json(StatusCode::BAD_REQUEST, "unreadable request body"),
    };
    let request: ImportBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return message_json(StatusCode::BAD_REQUEST, format!("bad body: {}", e)),
    };
    if request.source_url.is_empty() {
        return message_json(StatusCode::BAD_REQUEST, "source_url required");
    }

    let engine = Arc::clone(&state.mirrors);
    let prepare_repo = repo.clone();
    let prepared = tokio::task::spawn_blocking(move || {
        engine.prepare_import(&prepare_repo, &request.source_url)
    })
    .await;
    match prepared {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return error_json(&e),
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }

    // The fetch pipeline continues after this response; progress is
    // polled from /import/status.
    let engine = Arc::clone(&state.mirrors);
    let background_repo = repo.clone();
    tokio::task::spawn_blocking(move || engine.run_import(&background_repo));

    match state.mirrors.import_status(&repo) {
        Some(task) => json_response(StatusCode::ACCEPTED, &task),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// `GET /api/repositories/{repo}.git/import/status`
async fn import_status(state: Arc<AppState>, repo: &str) -> Response {
    match state.mirrors.import_status(repo) {
        Some(task) => json_response(StatusCode::OK, &task),
        None => message_json(StatusCode::NOT_FOUND, "no import task"),
    }
}

/// `POST /api/repositories/{repo}.git/sync`
async fn sync(state: Arc<AppState>, repo: &str) -> Response {
    if state.repos.open(repo).is_err() {
        return message_json(StatusCode::NOT_FOUND, "repository not found");
    }

    let engine = Arc::clone(&state.mirrors);
    let repo = repo.to_string();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = engine.ensure_synced(&repo, true) {
            tracing::warn!(repo, error = %e, "forced sync failed");
        }
    });

    StatusCode::ACCEPTED.into_response()
}

/// `GET /api/repositories/{repo}.git/mirror`
async fn mirror_info(state: Arc<AppState>, repo: &str) -> Response {
    let path = match state.repos.open(repo) {
        Ok(path) => path,
        Err(e) => return error_json(&e),
    };
    match state.repos.mirror_config(&path) {
        Ok((is_mirror, source_url)) => json_response(
            StatusCode::OK,
            &MirrorInfo {
                is_mirror,
                source_url: source_url.unwrap_or_default(),
            },
        ),
        Err(e) => error_json(&e),
    }
}
