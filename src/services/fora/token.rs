use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};

/// Tokens this close to their expiry are refreshed ahead of time
pub const EXPIRY_MARGIN_MS: i64 = 60_000;

/// Reads the `exp` claim of an access token without verifying it
///
/// A token that cannot be decoded, or has no usable `exp`, counts as expired.
pub fn is_access_token_expired(token: &str, now: DateTime<Utc>) -> bool {
    match token_expiry(token) {
        Some(exp) => exp * 1000.0 < (now.timestamp_millis() + EXPIRY_MARGIN_MS) as f64,
        None => true,
    }
}

fn token_expiry(token: &str) -> Option<f64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;

    claims.get("exp")?.as_f64().filter(|exp| *exp > 0.0)
}
