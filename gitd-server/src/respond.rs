//! Response helpers shared by the handlers: JSON bodies in the right
//! media type and the single place errors map to HTTP statuses.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Media type of every LFS batch and lock response.
pub const LFS_MEDIA_TYPE: &str = "application/vnd.git-lfs+json";

#[derive(Serialize)]
struct Message {
    message: String,
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response {
    body_with_type(status, body, "application/json")
}

pub fn lfs_json<T: Serialize>(status: StatusCode, body: &T) -> Response {
    body_with_type(status, body, LFS_MEDIA_TYPE)
}

fn body_with_type<T: Serialize>(status: StatusCode, body: &T, content_type: &str) -> Response {
    let json = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(json))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// HTTP status for a core error.
pub fn status_for(err: &gitd::Error) -> StatusCode {
    use gitd::Error::*;
    match err {
        NotFound(_) => StatusCode::NOT_FOUND,
        AlreadyExists(_) => StatusCode::CONFLICT,
        InvalidPath(_) | InvalidInput(_) | Json(_) => StatusCode::BAD_REQUEST,
        Forbidden(_) | NotOwner(..) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_json(err: &gitd::Error) -> Response {
    json_response(
        status_for(err),
        &Message {
            message: err.to_string(),
        },
    )
}

pub fn error_lfs(err: &gitd::Error) -> Response {
    lfs_json(
        status_for(err),
        &Message {
            message: err.to_string(),
        },
    )
}

pub fn message_lfs(status: StatusCode, message: impl Into<String>) -> Response {
    lfs_json(
        status,
        &Message {
            message: message.into(),
        },
    )
}

pub fn message_json(status: StatusCode, message: impl Into<String>) -> Response {
    json_response(
        status,
        &Message {
            message: message.into(),
        },
    )
}
