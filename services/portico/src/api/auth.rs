//! Bearer-token authentication.
//!
//! An empty secret lets every request through. Otherwise the request must
//! carry `Authorization: Bearer <secret>`; WebSocket upgrades may pass the
//! secret as a `token` query parameter instead, since browsers cannot set
//! headers on the handshake.

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::api::error::ApiError;
use crate::api::state::AppState;

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub async fn require_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let secret = state.hub().secret();
    if secret.is_empty() {
        return Ok(next.run(request).await);
    }

    let headers = request.headers();
    let presented = if is_websocket_upgrade(headers) {
        bearer_token(headers).or_else(|| {
            Query::<TokenQuery>::try_from_uri(request.uri())
                .ok()
                .and_then(|Query(q)| q.token)
        })
    } else {
        bearer_token(headers)
    };

    match presented {
        Some(token) if secret_matches(&secret, &token) => Ok(next.run(request).await),
        _ => Err(ApiError::unauthorized(
            "unauthorized",
            "Missing or invalid Authorization token",
        )),
    }
}

pub(crate) fn secret_matches(secret: &str, token: &str) -> bool {
    secret.as_bytes().ct_eq(token.as_bytes()).into()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = auth.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_token = |name: header::HeaderName, want: &str| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case(want))
    };
    has_token(header::CONNECTION, "upgrade") && has_token(header::UPGRADE, "websocket")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use rstest::rstest;

    #[rstest]
    #[case("s3cret", "s3cret", true)]
    #[case("s3cret", "s3creT", false)]
    #[case("s3cret", "s3cre", false)]
    #[case("s3cret", "", false)]
    fn test_secret_matches(#[case] secret: &str, #[case] token: &str, #[case] expected: bool) {
        assert_eq!(secret_matches(secret, token), expected);
    }

    #[rstest]
    #[case(Some("Bearer abc"), Some("abc"))]
    #[case(Some("Bearer   abc  "), Some("abc"))]
    #[case(Some("Basic abc"), None)]
    #[case(Some("Bearer "), None)]
    #[case(None, None)]
    fn test_bearer_token(#[case] header: Option<&str>, #[case] expected: Option<&str>) {
        let mut headers = HeaderMap::new();
        if let Some(value) = header {
            headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        assert_eq!(bearer_token(&headers).as_deref(), expected);
    }

    #[test]
    fn test_websocket_upgrade_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));

        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_websocket_upgrade(&headers));
    }
}
