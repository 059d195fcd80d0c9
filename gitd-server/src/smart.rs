//! Smart-HTTP serving: suffix dispatch for Git and LFS paths plus the
//! `upload-pack`/`receive-pack` subprocess plumbing.
//!
//! Repositories nest arbitrarily deep under the root, so these paths are
//! matched by suffix from the router fallback rather than by fixed
//! segment patterns. Match order follows the route table: Git smart
//! paths first, then LFS batch and locks.

use std::io::Read;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use flate2::read::GzDecoder;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use gitd::Service;

use crate::respond::LFS_MEDIA_TYPE;
use crate::state::AppState;
use crate::{auth, lfs, locks};

pub async fn dispatch(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let full_path = req.uri().path().to_string();
    let Some(path) = state.strip_prefix(&full_path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let path = path.to_string();

    if let Some(repo) = path.strip_suffix("/info/refs") {
        if req.method() != Method::GET {
            return StatusCode::METHOD_NOT_ALLOWED.into_response();
        }
        return info_refs(state, repo, req).await;
    }

    for service in [Service::UploadPack, Service::ReceivePack] {
        if let Some(repo) = path.strip_suffix(&format!("/{}", service.wire_name())) {
            if req.method() != Method::POST {
                return StatusCode::METHOD_NOT_ALLOWED.into_response();
            }
            return service_rpc(state, repo, service, req).await;
        }
    }

    // LFS endpoints only exist for clients speaking the LFS media type;
    // anything else falls through to 404.
    if let Some(repo) = path.strip_suffix("/info/lfs/objects/batch") {
        if !lfs_accepted(req.headers()) {
            return StatusCode::NOT_FOUND.into_response();
        }
        if req.method() != Method::POST {
            return StatusCode::METHOD_NOT_ALLOWED.into_response();
        }
        return lfs::batch(state, repo, req).await;
    }

    if let Some(repo) = path.strip_suffix("/info/lfs/locks/verify") {
        if !lfs_accepted(req.headers()) {
            return StatusCode::NOT_FOUND.into_response();
        }
        if req.method() != Method::POST {
            return StatusCode::METHOD_NOT_ALLOWED.into_response();
        }
        return locks::verify(state, repo, req).await;
    }

    if let Some((repo, id)) = unlock_target(&path) {
        if !lfs_accepted(req.headers()) {
            return StatusCode::NOT_FOUND.into_response();
        }
        if req.method() != Method::POST {
            return StatusCode::METHOD_NOT_ALLOWED.into_response();
        }
        return locks::unlock(state, &repo, &id, req).await;
    }

    if let Some(repo) = path.strip_suffix("/info/lfs/locks") {
        if !lfs_accepted(req.headers()) {
            return StatusCode::NOT_FOUND.into_response();
        }
        return if req.method() == Method::GET {
            locks::list(state, repo, req).await
        } else if req.method() == Method::POST {
            locks::create(state, repo, req).await
        } else {
            StatusCode::METHOD_NOT_ALLOWED.into_response()
        };
    }

    StatusCode::NOT_FOUND.into_response()
}

/// Split `{repo}/info/lfs/locks/{id}/unlock` into repo and lock id.
fn unlock_target(path: &str) -> Option<(String, String)> {
    let rest = path.strip_suffix("/unlock")?;
    let (head, id) = rest.rsplit_once('/')?;
    let repo = head.strip_suffix("/info/lfs/locks")?;
    if id.is_empty() || repo.is_empty() {
        return None;
    }
    Some((repo.to_string(), id.to_string()))
}

/// The batch and lock endpoints are matched only for clients whose
/// `Accept` primary media type is exactly the LFS one.
fn lfs_accepted(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim() == LFS_MEDIA_TYPE)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Smart-HTTP handlers
// ---------------------------------------------------------------------------

async fn info_refs(state: Arc<AppState>, repo: &str, req: Request) -> Response {
    if let Err(resp) = auth::require(&state, req.headers()) {
        return resp;
    }

    let service = req
        .uri()
        .query()
        .unwrap_or("")
        .split('&')
        .find_map(|kv| kv.strip_prefix("service="));
    let Some(service) = service else {
        return (StatusCode::BAD_REQUEST, "missing service parameter").into_response();
    };
    let Some(service) = Service::from_wire(service) else {
        return (StatusCode::FORBIDDEN, "unsupported service").into_response();
    };

    let Ok(repo_path) = state.repos.open(repo) else {
        return (StatusCode::NOT_FOUND, "repository not found").into_response();
    };
    let is_mirror = match state.repos.mirror_config(&repo_path) {
        Ok((is_mirror, _)) => is_mirror,
        Err(e) => {
            warn!(repo, error = %e, "mirror config read failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if is_mirror && service == Service::ReceivePack {
        return (StatusCode::FORBIDDEN, "repository is a read-only mirror").into_response();
    }

    if is_mirror && service == Service::UploadPack {
        lazy_sync(&state, repo).await;
    }

    let output = Command::new("git")
        .args(service.rpc_args(true))
        .arg(&repo_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await;
    let output = match output {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            warn!(repo, service = %service, stderr = %String::from_utf8_lossy(&output.stderr), "advertisement failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        Err(e) => {
            warn!(repo, service = %service, error = %e, "failed to spawn git");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut body = service.advertisement_header();
    body.extend_from_slice(&output.stdout);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, service.advertisement_content_type())
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn service_rpc(
    state: Arc<AppState>,
    repo: &str,
    service: Service,
    req: Request,
) -> Response {
    if let Err(resp) = auth::require(&state, req.headers()) {
        return resp;
    }

    let Ok(repo_path) = state.repos.open(repo) else {
        return (StatusCode::NOT_FOUND, "repository not found").into_response();
    };
    let is_mirror = match state.repos.mirror_config(&repo_path) {
        Ok((is_mirror, _)) => is_mirror,
        Err(e) => {
            warn!(repo, error = %e, "mirror config read failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if is_mirror && service == Service::ReceivePack {
        return (StatusCode::FORBIDDEN, "repository is a read-only mirror").into_response();
    }
    if is_mirror && service == Service::UploadPack {
        lazy_sync(&state, repo).await;
    }

    let gzipped = req
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);

    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            debug!(repo, error = %e, "request body read failed");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    let body = if gzipped {
        let mut decoded = Vec::new();
        if let Err(e) = GzDecoder::new(&body[..]).read_to_end(&mut decoded) {
            debug!(repo, error = %e, "gzip decode failed");
            return StatusCode::BAD_REQUEST.into_response();
        }
        decoded
    } else {
        body.to_vec()
    };

    let child = Command::new("git")
        .args(service.rpc_args(false))
        .arg(&repo_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            warn!(repo, service = %service, error = %e, "failed to spawn git");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(&body).await {
            debug!(error = %e, "git stdin closed early");
        }
        // stdin drops here, signalling EOF to the subprocess
    });

    // Once the first body byte is out the status is fixed; subprocess
    // failures from here on only terminate the stream.
    let stream = ReaderStream::new(RpcStream {
        _child: child,
        stdout,
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, service.result_content_type())
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Best-effort on-demand mirror sync; failures are cached by the engine
/// and stale refs are served.
async fn lazy_sync(state: &Arc<AppState>, repo: &str) {
    let engine = Arc::clone(&state.mirrors);
    let repo = repo.to_string();
    let result = tokio::task::spawn_blocking(move || engine.ensure_synced(&repo, false)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "lazy sync skipped"),
        Err(e) => warn!(error = %e, "lazy sync task panicked"),
    }
}

/// Couples the subprocess lifetime to its stdout stream: dropping the
/// response body kills the child (`kill_on_drop`), which is how request
/// cancellation propagates.
struct RpcStream {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for RpcStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlock_suffix_parsing() {
        let (repo, id) = unlock_target("/demo.git/info/lfs/locks/abc123/unlock").unwrap();
        assert_eq!(repo, "/demo.git");
        assert_eq!(id, "abc123");

        assert!(unlock_target("/demo.git/info/lfs/locks/unlock").is_none());
        assert!(unlock_target("/unlock").is_none());
    }

    #[test]
    fn accept_gate() {
        let mut headers = HeaderMap::new();
        assert!(!lfs_accepted(&headers));

        headers.insert(header::ACCEPT, "application/vnd.git-lfs+json".parse().unwrap());
        assert!(lfs_accepted(&headers));

        headers.insert(
            header::ACCEPT,
            "application/vnd.git-lfs+json; charset=utf-8".parse().unwrap(),
        );
        assert!(lfs_accepted(&headers));

        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        assert!(!lfs_accepted(&headers));
    }
}
