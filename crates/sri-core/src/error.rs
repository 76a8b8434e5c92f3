// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for sri-core.
//!
//! Two kinds of failure travel through the engine:
//!
//! - [`SriError`]: intentional and typed. Carries the HTTP status, body and extra
//!   headers that reach the client unchanged (validation failures, not found,
//!   forbidden, malformed batches, unknown query parameters).
//! - Everything else ([`Error::Database`], [`Error::Json`], [`Error::Internal`]):
//!   unexpected. Logged with full detail server-side and reported to the client
//!   as a generic 500.

use std::fmt;

use serde_json::{Value, json};

/// Result type using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Typed failure carrying `{status, body, headers}`.
#[derive(Debug, Clone, PartialEq)]
pub struct SriError {
    /// HTTP status returned to the client.
    pub status: u16,
    /// JSON body returned to the client.
    pub body: Value,
    /// Extra response headers.
    pub headers: Vec<(String, String)>,
}

impl SriError {
    /// Build an error whose body follows the `{status, errors: [...]}` convention.
    pub fn new(status: u16, errors: Vec<Value>) -> Self {
        Self {
            status,
            body: json!({ "status": status, "errors": errors }),
            headers: Vec::new(),
        }
    }

    /// Build an error with a single `{code, msg}` entry.
    pub fn with_code(status: u16, code: &str, msg: impl Into<String>) -> Self {
        Self::new(status, vec![json!({ "code": code, "msg": msg.into() })])
    }

    /// Build an error with an arbitrary body.
    pub fn with_body(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            headers: Vec::new(),
        }
    }

    /// Attach an extra response header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The generic body sent for unexpected failures.
    pub fn internal() -> Self {
        Self::with_code(500, "internal.server.error", "Internal server error")
    }

    /// The client disconnected; work stops at the next barrier.
    pub fn cancelled() -> Self {
        Self::with_code(499, "request.cancelled", "Client closed the request")
    }

    /// Error codes listed in the body, in order.
    pub fn codes(&self) -> Vec<&str> {
        self.body
            .get("errors")
            .and_then(Value::as_array)
            .map(|errors| {
                errors
                    .iter()
                    .filter_map(|e| e.get("code").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Display for SriError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SRI error {}: {}", self.status, self.body)
    }
}

impl std::error::Error for SriError {}

/// Errors that can occur while serving a request.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Intentional failure, passed through with its declared status.
    #[error(transparent)]
    Sri(#[from] SriError),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Engine configuration is invalid (bad identifiers, ambiguous routes).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Any other unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this is an intentional [`SriError`].
    pub fn is_sri(&self) -> bool {
        matches!(self, Self::Sri(_))
    }

    /// HTTP status this error maps to.
    pub fn status(&self) -> u16 {
        match self {
            Self::Sri(e) => e.status,
            _ => 500,
        }
    }

    /// The client-facing form of this error.
    ///
    /// Non-[`SriError`] failures collapse into [`SriError::internal`]; callers
    /// are expected to have logged the detail already.
    pub fn to_sri(&self) -> SriError {
        match self {
            Self::Sri(e) => e.clone(),
            _ => SriError::internal(),
        }
    }
}
