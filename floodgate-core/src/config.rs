//! Shared configuration helpers.
//!
//! Every worker is configured through a generic [`serde_json::Value`]
//! document carrying the driver-specific fields; drivers deserialize it
//! into their typed config struct with [`from_value`]. Defaults shared by
//! several drivers live here.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::worker::WorkerError;

/// Default service timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Default cap for buffered request and response bodies.
pub const DEFAULT_MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Deserialize a driver config document into its typed form.
pub fn from_value<T: DeserializeOwned>(config: &Value) -> Result<T, WorkerError> {
    serde_json::from_value(config.clone()).map_err(|e| WorkerError::Config(e.to_string()))
}

pub const fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

pub const fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}
