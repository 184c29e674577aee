//! Subscription handshake for webhook registration.
//!
//! The platform calls `GET ...?mode=subscribe&verify_token=...&challenge=...` (or the `hub.`
//! prefixed names) and expects the challenge echoed back only when the token matches.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

/// The only mode we accept.
pub const SUBSCRIBE_MODE: &str = "subscribe";

#[derive(Debug, Default, Deserialize)]
pub struct VerifyParams {
    #[serde(default, alias = "hub.mode")]
    pub mode: Option<String>,
    #[serde(default, alias = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(default, alias = "hub.challenge")]
    pub challenge: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Echo this challenge with 200.
    Verified(String),
    /// 403 with no body.
    Forbidden,
}

/// Check mode and token against the configured secret. No secret configured means nothing verifies.
pub fn verify(params: &VerifyParams, expected_token: Option<&str>) -> Verification {
    let Some(expected) = expected_token.filter(|t| !t.is_empty()) else {
        return Verification::Forbidden;
    };
    let mode_ok = params.mode.as_deref() == Some(SUBSCRIBE_MODE);
    let token_ok = params
        .verify_token
        .as_deref()
        .is_some_and(|t| constant_time_eq(t.as_bytes(), expected.as_bytes()));
    if mode_ok && token_ok {
        Verification::Verified(params.challenge.clone().unwrap_or_default())
    } else {
        Verification::Forbidden
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl IntoResponse for Verification {
    fn into_response(self) -> Response {
        match self {
            Verification::Verified(challenge) => (StatusCode::OK, challenge).into_response(),
            Verification::Forbidden => StatusCode::FORBIDDEN.into_response(),
        }
    }
}
