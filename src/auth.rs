//! Tunnel upgrade authentication.
//!
//! The agent registers by upgrading `{tunnel.path}/{bucket}` to a WebSocket,
//! where `bucket` is the current unix time divided by 100 seconds, and
//! presents the shared secret in the `sec-auth-key` header. The gateway
//! accepts the current and the previous bucket so an agent that computed its
//! URL just before a boundary still gets in.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;

/// Header carrying the shared secret on the tunnel upgrade.
pub const AUTH_HEADER: &str = "sec-auth-key";

/// Sent by an agent that has no password configured.
pub const NO_PASSWORD: &str = "NONE";

/// Width of one route bucket in seconds.
pub const ROUTE_BUCKET_SECS: u64 = 100;

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, byte) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= byte ^ p;
    }
    diff == 0
}

/// Check the `sec-auth-key` header against the configured password.
///
/// With no password configured every agent is accepted.
pub fn secret_matches(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|provided| constant_time_eq(expected.as_bytes(), provided.as_bytes()))
}

/// Route bucket for `now`.
pub fn route_bucket(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() / ROUTE_BUCKET_SECS)
        .unwrap_or(0)
}

/// Tunnel upgrade path for `bucket`, e.g. `/gateway/17600000`.
pub fn tunnel_route(prefix: &str, bucket: u64) -> String {
    format!("{}/{bucket}", prefix.trim_end_matches('/'))
}

/// Whether `path` is the tunnel upgrade route at `now`.
pub fn is_tunnel_route(prefix: &str, path: &str, now: SystemTime) -> bool {
    let bucket = route_bucket(now);
    path == tunnel_route(prefix, bucket)
        || bucket
            .checked_sub(1)
            .is_some_and(|previous| path == tunnel_route(prefix, previous))
}
