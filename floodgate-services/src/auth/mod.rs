//! Credential-checking filters.
//!
//! Each auth driver supports a family of `Authorization-Type` aliases,
//! compared case-insensitively with hyphens and underscores ignored. A
//! request naming a scheme the filter does not support is rejected with
//! 401; a request without the header goes straight to credential
//! extraction. Failures write the response and stop the chain.

use std::time::{SystemTime, UNIX_EPOCH};

use floodgate_core::context::Context;
use http::StatusCode;

pub mod aksk;
pub mod apikey;
pub mod basic;
pub mod jwt;

/// Header naming the credential scheme the client intends to use.
pub const AUTHORIZATION_TYPE: &str = "Authorization-Type";

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("invalid user")]
    InvalidUser,
    #[error("user expired")]
    Expired,
    #[error("unsupported authorization type")]
    SchemeMismatch,
    #[error("{0}")]
    Malformed(String),
}

pub(crate) fn normalize_scheme(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

pub(crate) fn check_authorization_type(
    supported: &[&str],
    ctx: &Context,
) -> Result<(), AuthError> {
    let Some(value) = ctx
        .request()
        .headers()
        .get(AUTHORIZATION_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return Ok(());
    };
    let normalized = normalize_scheme(value);
    if supported.iter().any(|s| normalize_scheme(s) == normalized) {
        Ok(())
    } else {
        Err(AuthError::SchemeMismatch)
    }
}

pub(crate) fn reject(ctx: &mut Context, filter: &str, err: &AuthError) {
    tracing::debug!(filter, "authentication rejected: {err}");
    ctx.set_error_response(StatusCode::UNAUTHORIZED, &format!("[{filter}] {err}"));
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `expire` is a unix timestamp in seconds; zero never expires.
pub(crate) fn expired(expire: i64) -> bool {
    expire != 0 && now_unix() >= expire
}
