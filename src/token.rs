//! Decode-only inspection of access tokens.
//!
//! The signature is never checked here. Everything in this module is advisory: it lets
//! the client skip requests that are bound to fail and decide when to refresh, while the
//! backend stays the only authority on whether a token is accepted.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde_json::{Map, Value as JsonValue};
use time::{Duration, OffsetDateTime};

/// Tokens expiring within this window are refreshed ahead of time.
pub const REFRESH_HORIZON: Duration = Duration::seconds(300);

const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Claims read from a token payload without verifying the signature.
#[derive(Debug, Clone)]
pub struct UnverifiedClaims {
    inner: Map<String, JsonValue>,
}

impl UnverifiedClaims {
    /// Gets a claim value by key.
    #[must_use]
    pub fn get_claim(&self, key: &str) -> Option<&JsonValue> {
        self.inner.get(key)
    }

    /// Subject claim (`sub`), when present as a string.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.inner.get("sub").and_then(JsonValue::as_str)
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.inner.get("email").and_then(JsonValue::as_str)
    }

    /// Issued-at claim (`iat`) in Unix seconds.
    #[must_use]
    pub fn issued_at(&self) -> Option<i64> {
        self.inner.get("iat").and_then(numeric_date)
    }

    /// Expiry claim (`exp`) in Unix seconds. `None` when absent or not a number.
    #[must_use]
    pub fn expires_at(&self) -> Option<i64> {
        match self.expiry() {
            Expiry::At(exp) => Some(exp),
            Expiry::Never | Expiry::Unreadable => None,
        }
    }

    fn expiry(&self) -> Expiry {
        match self.inner.get("exp") {
            None | Some(JsonValue::Null) => Expiry::Never,
            Some(value) => numeric_date(value).map_or(Expiry::Unreadable, Expiry::At),
        }
    }

    /// Whether `sub` and `iat` are present and `exp`, if present, is a NumericDate.
    #[must_use]
    pub fn has_required_claims(&self) -> bool {
        self.inner.get("sub").is_some_and(|v| !v.is_null())
            && self.inner.get("iat").is_some_and(|v| !v.is_null())
            && self.expiry() != Expiry::Unreadable
    }

    /// `exp <= now`. A token without `exp` is never expired; an unreadable `exp` always is.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        match self.expiry() {
            Expiry::Never => false,
            Expiry::At(exp) => exp <= now.unix_timestamp(),
            Expiry::Unreadable => true,
        }
    }

    /// `exp < now + horizon`. A token without `exp` never needs an early refresh.
    #[must_use]
    pub fn expires_within(&self, horizon: Duration, now: OffsetDateTime) -> bool {
        match self.expiry() {
            Expiry::Never => false,
            Expiry::At(exp) => exp < (now + horizon).unix_timestamp(),
            Expiry::Unreadable => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    Never,
    At(i64),
    Unreadable,
}

// NumericDate is seconds since the epoch; some issuers emit it as a float.
fn numeric_date(value: &JsonValue) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.floor() as i64))
}

/// Decodes the payload segment of a three-part token.
///
/// Returns `None` if the token does not have exactly three dot-separated segments, or
/// the middle one is not base64 encoded JSON object.
#[must_use]
pub fn decode_claims(token: &str) -> Option<UnverifiedClaims> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };

    // Accept the standard alphabet too; some encoders do not produce base64url.
    let normalized: String = payload
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    let bytes = PAYLOAD_ENGINE.decode(normalized).ok()?;

    match serde_json::from_slice::<JsonValue>(&bytes).ok()? {
        JsonValue::Object(inner) => Some(UnverifiedClaims { inner }),
        _ => None,
    }
}

/// Outcome of inspecting an access token at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// Wrong shape, undecodable payload, missing `sub`/`iat`, or a non-numeric `exp`.
    Malformed,
    Expired,
    /// Still valid, but expires within the refresh horizon.
    ExpiringSoon,
    Valid,
}

impl TokenStatus {
    /// Whether the token can still be sent to the API.
    #[must_use]
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Valid | Self::ExpiringSoon)
    }

    /// Whether a refresh should be attempted before using the token.
    #[must_use]
    pub fn wants_refresh(self) -> bool {
        !matches!(self, Self::Valid)
    }
}

#[must_use]
pub fn inspect(token: &str) -> TokenStatus {
    inspect_at(token, OffsetDateTime::now_utc(), REFRESH_HORIZON)
}

#[must_use]
pub fn inspect_at(token: &str, now: OffsetDateTime, horizon: Duration) -> TokenStatus {
    let Some(claims) = decode_claims(token) else {
        return TokenStatus::Malformed;
    };
    if !claims.has_required_claims() {
        return TokenStatus::Malformed;
    }
    if claims.is_expired_at(now) {
        TokenStatus::Expired
    } else if claims.expires_within(horizon, now) {
        TokenStatus::ExpiringSoon
    } else {
        TokenStatus::Valid
    }
}

/// Strict validity: decodable, not expired, and carrying `sub` and `iat`.
#[must_use]
pub fn is_token_valid(token: &str) -> bool {
    inspect(token).is_usable()
}

/// Whether the token is past its `exp`. Undecodable tokens count as expired.
#[must_use]
pub fn is_token_expired(token: &str) -> bool {
    is_token_expired_at(token, OffsetDateTime::now_utc())
}

#[must_use]
pub fn is_token_expired_at(token: &str, now: OffsetDateTime) -> bool {
    decode_claims(token).is_none_or(|claims| claims.is_expired_at(now))
}

/// Whether the token expires within [`REFRESH_HORIZON`]. Undecodable tokens need a refresh.
#[must_use]
pub fn needs_refresh(token: &str) -> bool {
    needs_refresh_at(token, OffsetDateTime::now_utc(), REFRESH_HORIZON)
}

#[must_use]
pub fn needs_refresh_at(token: &str, now: OffsetDateTime, horizon: Duration) -> bool {
    decode_claims(token).is_none_or(|claims| claims.expires_within(horizon, now))
}
