//! Decoding of the claims payload carried by an access credential.
//!
//! Access credentials are three-segment signed tokens
//! (`header.payload.signature`, each segment base64url). Only the payload is
//! read here; the signature is the backend's business.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::SessionError;

/// Number of `.`-separated segments in a signed token
const TOKEN_SEGMENTS: usize = 3;

/// Decoded claims of an access credential.
///
/// `exp` is required; a payload without it does not decode. The identity
/// fields mirror what the backend's token serializer adds on top of the
/// standard registered claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Expiry, seconds since the Unix epoch
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Everything else in the payload (`user_id`, `sub`, custom claims)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    /// Subject identifier, from `user_id` or the standard `sub` claim.
    pub fn user_id(&self) -> Option<String> {
        ["user_id", "sub"]
            .iter()
            .filter_map(|key| self.extra.get(*key))
            .find_map(|value| match value {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    /// Best human-readable name for the identity
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.email.clone())
            .or_else(|| self.user_id())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    pub fn time_until_expiry(&self) -> Duration {
        match self.expires_at() {
            Some(expiry) => expiry - Utc::now(),
            None => Duration::zero(),
        }
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }
}

/// Decode the claims payload of an access credential.
///
/// Never panics: malformed structure, bad base64, non-JSON payloads and a
/// missing `exp` all come back as [`SessionError::MalformedCredential`],
/// which callers treat as "expired".
pub fn decode(token: &str) -> Result<Claims, SessionError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != TOKEN_SEGMENTS || segments.iter().any(|s| s.is_empty()) {
        return Err(SessionError::MalformedCredential(format!(
            "expected {} segments, got {}",
            TOKEN_SEGMENTS,
            segments.len()
        )));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .map_err(|e| SessionError::MalformedCredential(format!("invalid base64 payload: {e}")))?;

    serde_json::from_slice(&payload)
        .map_err(|e| SessionError::MalformedCredential(format!("invalid claims payload: {e}")))
}

/// Whether decoded claims still authorize calls at `now_ms`.
///
/// `clock_skew_tolerance_ms` is a safety margin: the credential is treated as
/// expired that many milliseconds before its `exp`.
pub fn is_valid(claims: Option<&Claims>, now_ms: i64, clock_skew_tolerance_ms: i64) -> bool {
    match claims {
        Some(claims) => {
            claims
                .exp
                .saturating_mul(1000)
                .saturating_sub(clock_skew_tolerance_ms)
                > now_ms
        }
        None => false,
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Short, non-reversible label for a token, safe to put in logs.
pub(crate) fn fingerprint(token: &str) -> String {
    let tail: String = token
        .chars()
        .rev()
        .take(6)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{tail}")
}
