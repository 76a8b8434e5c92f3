// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-operation request context and handler responses.
//!
//! One [`SriRequest`] exists per logical operation: a direct HTTP call, or one
//! item of a batch. Batch items get their own request derived from the batch,
//! sharing only the cancellation flag and the dry-run decision.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, Method};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::SriError;
use crate::streaming::StreamingOutput;

/// Path parameters extracted by route matching (`:key` -> value).
pub type PathParams = BTreeMap<String, String>;

/// Accumulated timing entries, exposed through `Server-Timing`.
#[derive(Debug, Default)]
pub struct Timings {
    entries: Mutex<Vec<(String, Duration)>>,
}

impl Timings {
    /// Add `elapsed` to the entry called `name`, creating it if needed.
    pub fn record(&self, name: impl Into<String>, elapsed: Duration) {
        let name = name.into();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, total)) => *total += elapsed,
            None => entries.push((name, elapsed)),
        }
    }

    /// Record the time elapsed since `start`.
    pub fn record_since(&self, name: impl Into<String>, start: Instant) {
        self.record(name, start.elapsed());
    }

    /// Snapshot of all entries in recording order.
    pub fn entries(&self) -> Vec<(String, Duration)> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether an entry called `name` was recorded.
    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|(n, _)| n == name)
    }

    /// Render as a `Server-Timing` header value.
    pub fn server_timing(&self) -> String {
        self.entries()
            .iter()
            .map(|(name, d)| format!("{};dur={:.3}", name, d.as_secs_f64() * 1000.0))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Mutable context threaded through one logical operation.
#[derive(Debug)]
pub struct SriRequest {
    /// Unique id, used in logs.
    pub id: Uuid,
    /// HTTP verb.
    pub verb: Method,
    /// Path without query string.
    pub path: String,
    /// Path plus query string as received.
    pub original_url: String,
    /// Decoded query parameters in order of appearance.
    pub query: Vec<(String, String)>,
    /// Request headers (batch items inherit the batch's headers).
    pub headers: HeaderMap,
    /// Parsed JSON body.
    pub body: Option<Value>,
    /// Caller identity, usually set by a transform-request hook.
    pub user: Option<Value>,
    /// Parameters extracted from the matched route pattern.
    pub path_params: PathParams,
    /// Set on requests built from a batch item.
    pub is_batch_part: bool,
    /// `dryRun=true`: the transaction is always rolled back.
    pub dry_run: bool,
    /// Output stream for streaming routes.
    pub stream: Option<StreamingOutput>,
    cancelled: Arc<AtomicBool>,
    timings: Timings,
    user_data: Mutex<Map<String, Value>>,
}

impl SriRequest {
    /// Build a request from a verb and a path with optional query string.
    pub fn new(verb: Method, url: &str) -> Self {
        let (path, query) = split_url(url);
        let dry_run = query
            .iter()
            .any(|(k, v)| k == "dryRun" && v.eq_ignore_ascii_case("true"));
        Self {
            id: Uuid::new_v4(),
            verb,
            path,
            original_url: url.to_string(),
            query,
            headers: HeaderMap::new(),
            body: None,
            user: None,
            path_params: PathParams::new(),
            is_batch_part: false,
            dry_run,
            stream: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            timings: Timings::default(),
            user_data: Mutex::new(Map::new()),
        }
    }

    /// Attach headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Attach a JSON body.
    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    /// Derive the request for one batch item.
    ///
    /// The item shares the parent's cancellation flag, headers, user and
    /// dry-run decision; everything else is its own.
    pub fn batch_part(&self, verb: Method, href: &str, body: Option<Value>) -> Self {
        let mut part = Self::new(verb, href);
        part.headers = self.headers.clone();
        part.body = body;
        part.user = self.user.clone();
        part.is_batch_part = true;
        part.dry_run = self.dry_run;
        part.cancelled = self.cancelled.clone();
        part
    }

    /// First value of a query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Path parameter extracted by route matching.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    /// Whether the client went away. Handlers check this cooperatively.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Mark the request (and every batch part sharing the flag) as cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Guard that cancels this request when dropped, unless disarmed.
    pub fn cancellation_guard(&self) -> CancellationGuard {
        CancellationGuard {
            flag: Some(self.cancelled.clone()),
        }
    }

    /// Timing entries of this operation.
    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Store a value for later hooks of the same operation.
    pub fn set_user_data(&self, key: impl Into<String>, value: Value) {
        self.user_data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value);
    }

    /// Read a value stored by an earlier hook.
    pub fn user_data(&self, key: &str) -> Option<Value> {
        self.user_data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

/// Sets the shared cancellation flag on drop.
///
/// The HTTP layer holds one while a request is processed on its own task; a
/// client disconnect drops the HTTP future and with it the guard.
#[derive(Debug)]
pub struct CancellationGuard {
    flag: Option<Arc<AtomicBool>>,
}

impl CancellationGuard {
    /// Request finished normally, do not cancel.
    pub fn disarm(mut self) {
        self.flag = None;
    }
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        if let Some(flag) = self.flag.take() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Result of one operation: status, headers and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct SriResponse {
    /// HTTP status.
    pub status: u16,
    /// Extra response headers.
    pub headers: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<Value>,
    /// The body was already written to the operation's stream.
    pub streamed: bool,
}

impl SriResponse {
    /// Response with an explicit status.
    pub fn with_status(status: u16, body: Option<Value>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
            streamed: false,
        }
    }

    /// 200 with a body.
    pub fn ok(body: Value) -> Self {
        Self::with_status(200, Some(body))
    }

    /// 201 with a body.
    pub fn created(body: Value) -> Self {
        Self::with_status(201, Some(body))
    }

    /// Marker response for a body already written through a stream.
    pub fn streamed(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: None,
            streamed: true,
        }
    }

    /// Attach an extra header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<SriError> for SriResponse {
    fn from(err: SriError) -> Self {
        Self {
            status: err.status,
            headers: err.headers,
            body: Some(err.body),
            streamed: false,
        }
    }
}

/// Split `path?query` and decode the query pairs.
fn split_url(url: &str) -> (String, Vec<(String, String)>) {
    let (path, query) = match url.split_once('?') {
        Some((p, q)) => (p, q),
        None => (url, ""),
    };
    let pairs = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(k), decode_component(v))
        })
        .collect();
    (path.to_string(), pairs)
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}
