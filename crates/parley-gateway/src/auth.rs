//! Authentication gate for inbound WebSocket upgrades.
//!
//! The credential arrives either as a `token` query parameter on the upgrade
//! request or inside the ambient `auth-token` cookie. Missing, malformed,
//! expired, and badly signed tokens are all rejected identically — the caller
//! only ever learns "unauthorized".

use axum::http::HeaderMap;
use jsonwebtoken::{decode, DecodingKey, Validation};
use tracing::debug;

use parley_types::api::Claims;

/// Resolve the credential for an upgrade request: explicit query parameter
/// first, `auth-token` cookie as fallback.
pub fn extract_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    let cookie_header = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    token_from_cookie_header(cookie_header, "auth-token")
}

/// Verify a JWT credential. `None` covers every failure mode uniformly.
pub fn verify_credential(token: &str, secret: &str) -> Option<Claims> {
    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => Some(data.claims),
        Err(e) => {
            debug!("rejected gateway credential: {}", e);
            None
        }
    }
}

fn token_from_cookie_header(header: &str, name: &str) -> Option<String> {
    header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix(name)?.strip_prefix('='))
        .map(|raw| raw.trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}
