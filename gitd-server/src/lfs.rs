//! HTTP face of the LFS content store: the batch endpoint plus the
//! object upload/download/verify endpoints it hands out.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::SyncIoBridge;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, warn};

use gitd::lfs::is_valid_oid;

use crate::auth;
use crate::respond::{error_lfs, lfs_json, message_lfs};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct BatchRequest {
    pub operation: String,
    #[serde(default)]
    pub objects: Vec<ObjectSpec>,
}

#[derive(Deserialize)]
pub struct ObjectSpec {
    pub oid: String,
    pub size: u64,
}

#[derive(Serialize)]
pub struct BatchResponse {
    pub transfer: &'static str,
    pub objects: Vec<ObjectResponse>,
}

#[derive(Serialize)]
pub struct ObjectResponse {
    pub oid: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<HashMap<&'static str, Action>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ObjectError>,
}

#[derive(Serialize)]
pub struct Action {
    pub href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<HashMap<&'static str, String>>,
}

#[derive(Serialize)]
pub struct ObjectError {
    pub code: u16,
    pub message: String,
}

impl ObjectResponse {
    fn stored(oid: String, size: u64) -> Self {
        ObjectResponse {
            oid,
            size,
            actions: None,
            error: None,
        }
    }

    fn with_error(oid: String, size: u64, code: u16, message: &str) -> Self {
        ObjectResponse {
            oid,
            size,
            actions: None,
            error: Some(ObjectError {
                code,
                message: message.to_string(),
            }),
        }
    }

    fn with_actions(oid: String, size: u64, actions: HashMap<&'static str, Action>) -> Self {
        ObjectResponse {
            oid,
            size,
            actions: Some(actions),
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Absolute base URL the action hrefs hang off: scheme from
/// `X-Forwarded-Proto` (falling back to plain http) and the request
/// `Host`.
fn base_url(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{}://{}", scheme, host)
}

/// Headers echoed into every action: the LFS accept header plus the
/// caller's credentials so the follow-up request passes the same auth.
fn action_headers(headers: &HeaderMap) -> Option<HashMap<&'static str, String>> {
    let mut out = HashMap::from([("Accept", "application/vnd.git-lfs".to_string())]);
    if let Some(authorization) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        out.insert("Authorization", authorization.to_string());
    }
    Some(out)
}

pub async fn batch(state: Arc<AppState>, repo: &str, req: Request) -> Response {
    if let Err(resp) = auth::require(&state, req.headers()) {
        return resp;
    }
    if state.repos.open(repo).is_err() {
        return message_lfs(StatusCode::NOT_FOUND, "repository not found");
    }

    let headers = req.headers().clone();
    let body = match axum::body::to_bytes(req.into_body(), 4 * 1024 * 1024).await {
        Ok(body) => body,
        Err(_) => return message_lfs(StatusCode::BAD_REQUEST, "unreadable request body"),
    };
    let request: BatchRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return message_lfs(StatusCode::BAD_REQUEST, format!("bad batch request: {}", e)),
    };

    let is_upload = match request.operation.as_str() {
        "download" => false,
        "upload" => true,
        other => {
            return message_lfs(
                StatusCode::BAD_REQUEST,
                format!("invalid operation {:?}", other),
            )
        }
    };

    let base = base_url(&headers);
    let action_headers = action_headers(&headers);

    let objects = request
        .objects
        .into_iter()
        .map(|obj| {
            if !is_valid_oid(&obj.oid) {
                return ObjectResponse::with_error(obj.oid, obj.size, 422, "Invalid oid");
            }
            let exists = state.lfs.exists(&obj.oid);
            let href = format!("{}/objects/{}", base, obj.oid);
            match (is_upload, exists) {
                // Nothing to transfer: the pool already has the bytes.
                (true, true) => ObjectResponse::stored(obj.oid, obj.size),
                (true, false) => {
                    let actions = HashMap::from([
                        (
                            "upload",
                            Action {
                                href: href.clone(),
                                header: action_headers.clone(),
                            },
                        ),
                        (
                            "verify",
                            Action {
                                href: format!("{}/verify", href),
                                header: action_headers.clone(),
                            },
                        ),
                    ]);
                    ObjectResponse::with_actions(obj.oid, obj.size, actions)
                }
                (false, true) => {
                    let actions = HashMap::from([(
                        "download",
                        Action {
                            href,
                            header: action_headers.clone(),
                        },
                    )]);
                    ObjectResponse::with_actions(obj.oid, obj.size, actions)
                }
                (false, false) => ObjectResponse::with_error(obj.oid, obj.size, 404, "Not found"),
            }
        })
        .collect();

    lfs_json(
        StatusCode::OK,
        &BatchResponse {
            transfer: "basic",
            objects,
        },
    )
}

// ---------------------------------------------------------------------------
// Object endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ObjectQuery {
    #[serde(default)]
    pub filename: Option<String>,
}

/// `GET`/`HEAD /objects/{oid}`: range-capable object download.
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Path(oid): Path<String>,
    Query(query): Query<ObjectQuery>,
    req: Request,
) -> Response {
    if let Err(resp) = auth::require(&state, req.headers()) {
        return resp;
    }
    if !is_valid_oid(&oid) {
        return message_lfs(StatusCode::BAD_REQUEST, "invalid oid");
    }
    if !state.lfs.exists(&oid) {
        return message_lfs(StatusCode::NOT_FOUND, "object not found");
    }

    // ServeFile supplies Last-Modified and byte-range handling.
    let serve = ServeFile::new(state.lfs.object_path(&oid));
    let mut response = match serve.oneshot(req).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            warn!(oid, error = %e, "object read failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Some(filename) = query.filename.filter(|f| !f.is_empty()) {
        let disposition = format!("attachment; filename={:?}", filename);
        if let Ok(value) = disposition.parse() {
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, value);
        }
    }
    response
}

/// `PUT /objects/{oid}`: streamed, verified upload.
pub async fn put_object(
    State(state): State<Arc<AppState>>,
    Path(oid): Path<String>,
    req: Request,
) -> Response {
    if let Err(resp) = auth::require(&state, req.headers()) {
        return resp;
    }
    if !is_valid_oid(&oid) {
        return message_lfs(StatusCode::BAD_REQUEST, "invalid oid");
    }

    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let Some(declared) = declared else {
        return message_lfs(StatusCode::BAD_REQUEST, "Content-Length required");
    };

    let stream = req
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    let reader = tokio_util::io::StreamReader::new(stream);
    let mut bridge = SyncIoBridge::new(reader);

    let store = state.lfs.clone();
    let put_oid = oid.clone();
    let result =
        tokio::task::spawn_blocking(move || store.put(&put_oid, &mut bridge, declared)).await;

    match result {
        Ok(Ok(())) => {
            debug!(oid, size = declared, "lfs object stored");
            StatusCode::OK.into_response()
        }
        Ok(Err(e)) => {
            warn!(oid, error = %e, "lfs upload rejected");
            error_lfs(&e)
        }
        Err(e) => {
            warn!(oid, error = %e, "lfs upload task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    pub oid: String,
    pub size: u64,
}

/// `POST /objects/{oid}/verify`: assert existence and size.
pub async fn verify_object(
    State(state): State<Arc<AppState>>,
    Path(oid): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if let Err(resp) = auth::require(&state, &headers) {
        return resp;
    }
    let request: VerifyRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return message_lfs(StatusCode::BAD_REQUEST, format!("bad verify request: {}", e))
        }
    };
    if request.oid != oid || !is_valid_oid(&oid) {
        return message_lfs(StatusCode::BAD_REQUEST, "oid mismatch");
    }

    match state.lfs.info(&oid) {
        Ok(meta) if meta.len() == request.size => {
            lfs_json(StatusCode::OK, &serde_json::json!({}))
        }
        Ok(meta) => message_lfs(
            StatusCode::BAD_REQUEST,
            format!("size mismatch: stored {}, declared {}", meta.len(), request.size),
        ),
        Err(e) => error_lfs(&e),
    }
}
