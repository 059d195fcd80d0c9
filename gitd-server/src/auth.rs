//! Optional HTTP Basic authentication.

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;

use crate::state::AppState;

/// Principal name used when no authenticator is configured.
pub const ANONYMOUS: &str = "anonymous";

/// A credential-checking capability. Returns the principal name on
/// success.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, user: &str, pass: &str) -> Option<String>;
}

/// Single-account authenticator configured from `--auth user:pass`.
pub struct StaticAuthenticator {
    user: String,
    pass: String,
}

impl StaticAuthenticator {
    /// Parse a `user:pass` credential string.
    pub fn parse(spec: &str) -> Option<Self> {
        let (user, pass) = spec.split_once(':')?;
        if user.is_empty() {
            return None;
        }
        Some(StaticAuthenticator {
            user: user.to_string(),
            pass: pass.to_string(),
        })
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, user: &str, pass: &str) -> Option<String> {
        (user == self.user && pass == self.pass).then(|| user.to_string())
    }
}

/// Authenticate a request against the configured authenticator.
///
/// Returns the principal name, or the ready-made 401 challenge response
/// when credentials are missing or wrong. Without an authenticator every
/// request is `anonymous`.
pub fn require(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let Some(authenticator) = &state.auth else {
        return Ok(ANONYMOUS.to_string());
    };

    let credentials = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
        .and_then(|raw| String::from_utf8(raw).ok());

    if let Some(credentials) = credentials {
        if let Some((user, pass)) = credentials.split_once(':') {
            if let Some(name) = authenticator.authenticate(user, pass) {
                return Ok(name);
            }
        }
    }

    Err(challenge())
}

fn challenge() -> Response {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(header::WWW_AUTHENTICATE, "Basic realm=\"gitd\"")
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::UNAUTHORIZED.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_authenticator_matches_exact_pair() {
        let auth = StaticAuthenticator::parse("alice:s3cret").unwrap();
        assert_eq!(auth.authenticate("alice", "s3cret").as_deref(), Some("alice"));
        assert!(auth.authenticate("alice", "wrong").is_none());
        assert!(auth.authenticate("bob", "s3cret").is_none());
    }

    #[test]
    fn parse_rejects_bad_specs() {
        assert!(StaticAuthenticator::parse("nocolon").is_none());
        assert!(StaticAuthenticator::parse(":pass").is_none());
        assert!(StaticAuthenticator::parse("user:").is_some());
    }
}
