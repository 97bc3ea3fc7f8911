//! Pure freshness checks over a claim set and a point in time.
//!
//! Missing or unparsable expiry is treated as expired: an untrusted
//! credential is never considered usable.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::claims::ClaimSet;

/// Default window before expiry in which a credential counts as expiring soon.
pub const DEFAULT_EXPIRING_SOON_THRESHOLD_SECS: u64 = 300;

/// Freshness classification of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Valid,
    ExpiringSoon,
    Expired,
}

pub fn is_expired(claims: &ClaimSet, now: DateTime<Utc>) -> bool {
    match claims.expires_at {
        Some(expires_at) => now >= expires_at,
        None => true,
    }
}

/// True when `0 < expires_at - now <= threshold`.
pub fn is_expiring_soon(claims: &ClaimSet, now: DateTime<Utc>, threshold: Duration) -> bool {
    match claims.expires_at {
        Some(expires_at) => {
            let remaining = expires_at - now;
            remaining > Duration::zero() && remaining <= threshold
        }
        None => false,
    }
}

pub fn evaluate(claims: &ClaimSet, now: DateTime<Utc>, threshold: Duration) -> Freshness {
    if is_expired(claims, now) {
        Freshness::Expired
    } else if is_expiring_soon(claims, now, threshold) {
        Freshness::ExpiringSoon
    } else {
        Freshness::Valid
    }
}

/// Time left before expiry, clamped at zero.
pub fn time_until_expiry(claims: &ClaimSet, now: DateTime<Utc>) -> Duration {
    claims
        .expires_at
        .map(|expires_at| (expires_at - now).max(Duration::zero()))
        .unwrap_or_else(Duration::zero)
}

/// Convert a configured threshold in seconds.
pub fn threshold_from_secs(secs: u64) -> Duration {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1_000);
    Duration::seconds(secs)
}
