//! Header-based gating for the intake surface.
//!
//! Create is gated by a merchant API key, the callback by the shared webhook
//! secret. A missing server-side secret means the endpoint is not configured
//! and answers 503 rather than silently accepting anything.

use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const SHARED_SECRET_HEADER: &str = "x-zano-secret";

pub type Rejection = (StatusCode, Json<Value>);

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub fn not_configured(what: &str) -> Rejection {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": format!("{what} not configured") })),
    )
}

pub fn require_api_key(headers: &HeaderMap, expected: Option<&str>) -> Result<(), Rejection> {
    let Some(expected) = expected.filter(|s| !s.is_empty()) else {
        tracing::warn!("api key not configured; rejecting create");
        return Err(not_configured("api key"));
    };
    match header_value(headers, API_KEY_HEADER) {
        Some(got) if got == expected => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid api key" })))),
    }
}

pub fn require_shared_secret(headers: &HeaderMap, expected: Option<&str>) -> Result<(), Rejection> {
    let Some(expected) = expected.filter(|s| !s.is_empty()) else {
        tracing::warn!("callback secret not configured; rejecting callback");
        return Err(not_configured("callback secret"));
    };
    match header_value(headers, SHARED_SECRET_HEADER) {
        Some(got) if got == expected => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid secret" })))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_paths() {
        let mut headers = HeaderMap::new();
        assert_eq!(require_api_key(&headers, None).unwrap_err().0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            require_api_key(&headers, Some("k")).unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );
        headers.insert(API_KEY_HEADER, "k".parse().unwrap());
        assert!(require_api_key(&headers, Some("k")).is_ok());
        assert_eq!(
            require_api_key(&headers, Some("other")).unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn shared_secret_paths() {
        let mut headers = HeaderMap::new();
        headers.insert(SHARED_SECRET_HEADER, "s".parse().unwrap());
        assert!(require_shared_secret(&headers, Some("s")).is_ok());
        assert_eq!(
            require_shared_secret(&headers, Some("x")).unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );
    }
}
