//! Bearer credentials and the claim set decoded from them.
//!
//! Claims are extracted without signature verification: the token stays
//! opaque to this crate apart from its payload segment.

use std::collections::BTreeSet;
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Number of dot-separated segments in a JWT-shaped token.
const TOKEN_SEGMENTS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClaimsError {
    #[error("Expected 3 token segments, found {0}")]
    SegmentCount(usize),

    #[error("Payload is not valid base64url: {0}")]
    Encoding(String),

    #[error("Payload is not a JSON object: {0}")]
    Payload(String),
}

/// Structured data decoded from a credential.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimSet {
    pub subject: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub authorities: BTreeSet<String>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl ClaimSet {
    /// Decode the payload segment of a JWT-shaped token.
    pub fn decode(token: &str) -> Result<Self, ClaimsError> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != TOKEN_SEGMENTS {
            return Err(ClaimsError::SegmentCount(segments.len()));
        }

        let payload = URL_SAFE_NO_PAD
            .decode(segments[1].trim_end_matches('='))
            .map_err(|e| ClaimsError::Encoding(e.to_string()))?;
        let mut object: Map<String, Value> = serde_json::from_slice(&payload)
            .map_err(|e| ClaimsError::Payload(e.to_string()))?;

        let subject = object
            .remove("sub")
            .and_then(|v| v.as_str().map(str::to_string));
        let issued_at = object.remove("iat").as_ref().and_then(epoch_seconds);
        let expires_at = object.remove("exp").as_ref().and_then(epoch_seconds);
        let authorities = object
            .remove("authorities")
            .map(|v| parse_authorities(&v))
            .unwrap_or_default();

        Ok(Self {
            subject,
            issued_at,
            expires_at,
            authorities,
            extra: object,
        })
    }
}

/// Accepts integer, float or numeric-string epoch seconds.
fn epoch_seconds(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp(secs, 0)
}

/// Authorities arrive as `["A","B"]`, `[{"authority":"A"}]` or `"A,B"`.
fn parse_authorities(value: &Value) -> BTreeSet<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(obj) => obj
                    .get("authority")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// An opaque bearer token together with its decoded claims.
///
/// Immutable once built; a refresh replaces the whole value.
#[derive(Clone, PartialEq)]
pub struct Credential {
    token: String,
    claims: ClaimSet,
}

impl Credential {
    /// Build a credential from a raw token.
    ///
    /// A token whose claims cannot be decoded gets an empty claim set, which
    /// the expiry evaluator classifies as expired.
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let claims = ClaimSet::decode(&token).unwrap_or_else(|e| {
            debug!(error = %e, "Credential claims are malformed");
            ClaimSet::default()
        });
        Self { token, claims }
    }

    /// Rebuild a credential from a raw token and a previously derived claim set.
    pub(crate) fn from_parts(token: String, claims: ClaimSet) -> Self {
        Self { token, claims }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    pub fn subject(&self) -> Option<&str> {
        self.claims.subject.as_deref()
    }

    /// Value for an `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("claims", &self.claims)
            .finish()
    }
}
