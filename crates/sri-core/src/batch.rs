// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch matching, execution and response assembly.
//!
//! A batch body is a JSON array. Each level holds either items
//! (`{"href", "verb", "body"?}`) or groups (nested arrays), never both:
//!
//! ```text
//! [ {item}, {item}, {item} ]            one wave of three aligned items
//! [ [ {item}, {item} ], [ {item} ] ]    two groups, each with its own barriers
//! ```
//!
//! Matching happens before the database is touched: one unknown href fails
//! the whole batch. Every item then runs the same handler it would run as a
//! standalone request, as a job of one [`phase_synced_settle`] call. The whole
//! batch shares a single transaction; one non-2xx item rolls all of it back.

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::Method;
use serde_json::{Map, Value, json};
use tracing::{debug, error};

use crate::api::Api;
use crate::error::{Result, SriError};
use crate::lifecycle::{route_job, settle_options};
use crate::persistence::DbHandle;
use crate::request::{SriRequest, SriResponse};
use crate::routing::RouteMatch;
use crate::scheduler::{Job, Settled, phase_synced_settle};
use crate::streaming::StreamingOutput;

static VERBS: [Method; 5] = [
    Method::GET,
    Method::PUT,
    Method::POST,
    Method::PATCH,
    Method::DELETE,
];

/// One matched batch item.
#[derive(Debug)]
pub struct BatchItem {
    /// Target as sent by the client.
    pub href: String,
    /// Verb as sent by the client.
    pub verb: Method,
    /// Request derived from the batch request.
    pub request: SriRequest,
    /// Matched route.
    pub route: RouteMatch,
}

/// A level of a matched batch.
#[derive(Debug)]
pub enum BatchNode {
    /// Single operation.
    Item(BatchItem),
    /// Nested array, run as its own aligned set.
    Group(Vec<BatchNode>),
}

fn invalid(code: &str, msg: impl Into<String>) -> SriError {
    SriError::with_code(400, code, msg)
}

/// Validate the batch body and resolve every item's route.
pub fn match_batch(api: &Api, parent: &SriRequest) -> std::result::Result<Vec<BatchNode>, SriError> {
    let body = parent
        .body
        .as_ref()
        .ok_or_else(|| invalid("batch.body.invalid", "batch body must be a JSON array"))?;

    let mut unmatched = Vec::new();
    let nodes = match_level(api, parent, body, &mut unmatched)?;

    if !unmatched.is_empty() {
        return Err(SriError::new(404, unmatched));
    }
    Ok(nodes)
}

fn match_level(
    api: &Api,
    parent: &SriRequest,
    level: &Value,
    unmatched: &mut Vec<Value>,
) -> std::result::Result<Vec<BatchNode>, SriError> {
    let Value::Array(entries) = level else {
        return Err(invalid("batch.body.invalid", "batch body must be a JSON array"));
    };
    if entries.is_empty() {
        return Err(invalid("batch.body.empty", "batch must contain at least one item"));
    }

    if entries.iter().all(Value::is_array) {
        return entries
            .iter()
            .map(|group| match_level(api, parent, group, unmatched).map(BatchNode::Group))
            .collect();
    }
    if !entries.iter().all(Value::is_object) {
        return Err(invalid(
            "batch.body.invalid",
            "a batch level must contain only items or only nested arrays",
        ));
    }

    let mut writes = HashSet::new();
    let mut nodes = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(item) = match_item(api, parent, entry, unmatched)? else {
            continue;
        };
        if item.verb != Method::GET && !writes.insert(item.request.path.clone()) {
            return Err(SriError::new(
                400,
                vec![json!({
                    "code": "batch.duplicate.href",
                    "msg": "the same resource is written twice in one batch level",
                    "href": item.href,
                })],
            ));
        }
        nodes.push(BatchNode::Item(item));
    }
    Ok(nodes)
}

fn match_item(
    api: &Api,
    parent: &SriRequest,
    entry: &Value,
    unmatched: &mut Vec<Value>,
) -> std::result::Result<Option<BatchItem>, SriError> {
    let href = entry
        .get("href")
        .and_then(Value::as_str)
        .filter(|h| h.starts_with('/'))
        .ok_or_else(|| invalid("batch.item.invalid", "every batch item needs an absolute href"))?;
    let verb = entry
        .get("verb")
        .and_then(Value::as_str)
        .and_then(|v| VERBS.iter().find(|m| m.as_str().eq_ignore_ascii_case(v)))
        .cloned()
        .ok_or_else(|| {
            SriError::new(
                400,
                vec![json!({
                    "code": "batch.item.invalid",
                    "msg": "verb must be one of GET, PUT, POST, PATCH, DELETE",
                    "href": href,
                })],
            )
        })?;

    let Some(route) = api.routes.match_href(&verb, href) else {
        unmatched.push(json!({
            "code": "no.matching.route",
            "msg": format!("no route for {} {}", verb, href),
            "href": href,
            "verb": verb.as_str(),
        }));
        return Ok(None);
    };
    if route.record.is_batch() {
        return Err(SriError::new(
            400,
            vec![json!({
                "code": "batch.nested.batch",
                "msg": "batch items cannot target a batch route, use nested arrays",
                "href": href,
            })],
        ));
    }

    let mut request = parent.batch_part(verb.clone(), href, entry.get("body").cloned());
    request.path_params = route.params.clone();
    Ok(Some(BatchItem {
        href: href.to_string(),
        verb,
        request,
        route,
    }))
}

/// True when every item's route is read-only.
pub fn is_read_only(nodes: &[BatchNode]) -> bool {
    nodes.iter().all(|node| match node {
        BatchNode::Item(item) => item.route.record.read_only,
        BatchNode::Group(children) => is_read_only(children),
    })
}

/// Number of items, groups flattened.
pub fn item_count(nodes: &[BatchNode]) -> usize {
    nodes
        .iter()
        .map(|node| match node {
            BatchNode::Item(_) => 1,
            BatchNode::Group(children) => item_count(children),
        })
        .sum()
}

enum Label {
    Item { href: String, verb: Method },
    Group(Vec<Label>),
}

fn build_jobs(
    api: &Arc<Api>,
    db: &DbHandle,
    nodes: Vec<BatchNode>,
) -> (Vec<Job<SriResponse>>, Vec<Label>) {
    let mut jobs = Vec::with_capacity(nodes.len());
    let mut labels = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            BatchNode::Item(item) => {
                labels.push(Label::Item {
                    href: item.href,
                    verb: item.verb,
                });
                jobs.push(route_job(
                    api.clone(),
                    item.route.record,
                    Arc::new(item.request),
                    db.clone(),
                ));
            }
            BatchNode::Group(children) => {
                let (nested, nested_labels) = build_jobs(api, db, children);
                jobs.push(Job::Nested(nested));
                labels.push(Label::Group(nested_labels));
            }
        }
    }
    (jobs, labels)
}

fn item_result(href: &str, verb: &Method, settled: Settled<SriResponse>) -> (Value, u16) {
    let (status, body) = match settled {
        Settled::Fulfilled(response) => (response.status, response.body),
        Settled::Rejected(err) => {
            if !err.is_sri() {
                error!(href, verb = %verb, error = %err, "Batch item failed unexpectedly");
            }
            let sri = err.to_sri();
            (sri.status, Some(sri.body))
        }
        Settled::Nested(_) => {
            error!(href, "Batch item settled as a group");
            (500, Some(SriError::internal().body))
        }
    };

    let mut result = Map::new();
    result.insert("href".into(), json!(href));
    result.insert("verb".into(), json!(verb.as_str()));
    result.insert("status".into(), json!(status));
    if let Some(body) = body {
        result.insert("body".into(), body);
    }
    (Value::Object(result), status)
}

fn assemble(labels: Vec<Label>, settled: Vec<Settled<SriResponse>>, statuses: &mut Vec<u16>) -> Vec<Value> {
    labels
        .into_iter()
        .zip(settled)
        .map(|(label, settled)| match (label, settled) {
            (Label::Item { href, verb }, settled) => {
                let (value, status) = item_result(&href, &verb, settled);
                statuses.push(status);
                value
            }
            (Label::Group(labels), Settled::Nested(children)) => {
                Value::Array(assemble(labels, children, statuses))
            }
            (Label::Group(_), _) => {
                statuses.push(500);
                Value::Array(Vec::new())
            }
        })
        .collect()
}

/// `200` when every item succeeded, otherwise the highest item status.
pub fn overall_status(statuses: &[u16]) -> u16 {
    if statuses.iter().all(|s| (200..300).contains(s)) {
        200
    } else {
        statuses.iter().copied().max().unwrap_or(500)
    }
}

/// Run a matched batch and build the response.
///
/// The response status is the overall status and the body is the array of
/// item results in submission order. For streaming batches the head is sent
/// before the items run so the heartbeat covers the whole execution; the
/// results themselves are written by the lifecycle driver once the session
/// is finished.
pub async fn execute(
    api: &Arc<Api>,
    request: &Arc<SriRequest>,
    db: &DbHandle,
    nodes: Vec<BatchNode>,
    stream: Option<&StreamingOutput>,
) -> Result<SriResponse> {
    if let Some(stream) = stream {
        stream.start()?;
    }

    debug!(request = %request.id, items = item_count(&nodes), "Running batch");
    let (jobs, labels) = build_jobs(api, db, nodes);
    let settled = phase_synced_settle(jobs, settle_options(api)).await;

    let mut statuses = Vec::new();
    let results = assemble(labels, settled, &mut statuses);
    Ok(SriResponse::with_status(
        overall_status(&statuses),
        Some(Value::Array(results)),
    ))
}
