// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request lifecycle driver.
//!
//! ```text
//! admit -> transform -> match route -> match batch -> acquire (task | transaction)
//!       -> run jobs -> commit | rollback | release -> after-request hooks -> respond
//! ```
//!
//! The session is finished exactly once. It is rolled back when the handler
//! failed, when the final status is not 2xx, on `dryRun=true`, or when the
//! client went away while the request ran.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value, json};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::admission::AdmissionPermit;
use crate::api::{Api, RouteContext};
use crate::batch::{self, BatchNode};
use crate::error::{Error, Result, SriError};
use crate::persistence::{DbHandle, DbMode};
use crate::request::{SriRequest, SriResponse};
use crate::resource::{handlers, list};
use crate::routing::{BatchHandlerRecord, HandlerKind, RouteMatch};
use crate::scheduler::{Job, SettleOptions, Settled, phase_synced_settle};
use crate::streaming::{Dispatch, ReplySlot, StreamingOutput};

/// Before-phase hooks of `api` as settle options.
pub(crate) fn settle_options(api: &Api) -> SettleOptions {
    SettleOptions {
        before_phase: api.hooks.before_phase.clone(),
    }
}

/// Job running the handler of `record` for `request`.
pub(crate) fn route_job(
    api: Arc<Api>,
    record: Arc<BatchHandlerRecord>,
    request: Arc<SriRequest>,
    db: DbHandle,
) -> Job<SriResponse> {
    Job::task(request, move |syncer| {
        let ctx = RouteContext {
            request: syncer.request().clone(),
            db,
            syncer,
            config: api.config.clone(),
        };
        run_handler(record, ctx)
    })
}

async fn run_handler(record: Arc<BatchHandlerRecord>, ctx: RouteContext) -> Result<SriResponse> {
    let resource = || {
        record
            .resource
            .clone()
            .ok_or_else(|| Error::Internal("resource route without resource".to_string()))
    };
    match &record.kind {
        HandlerKind::Get => handlers::get(resource()?, ctx).await,
        HandlerKind::Put => handlers::put(resource()?, ctx).await,
        HandlerKind::Patch => handlers::patch(resource()?, ctx).await,
        HandlerKind::Delete => handlers::delete(resource()?, ctx).await,
        HandlerKind::List => list::list(resource()?, ctx).await,
        HandlerKind::Custom(handler) => handler.handle(ctx).await,
        HandlerKind::Batch { .. } => Err(Error::Internal(
            "batch routes are not run as jobs".to_string(),
        )),
    }
}

fn no_route(request: &SriRequest) -> SriError {
    SriError::new(
        404,
        vec![json!({
            "code": "no.matching.route",
            "msg": format!("no route for {} {}", request.verb, request.path),
            "href": request.path,
            "verb": request.verb.as_str(),
        })],
    )
}

/// Log unexpected failures in full; clients only ever see the generic 500.
fn client_error(request: &SriRequest, err: &Error) -> SriError {
    if !err.is_sri() {
        error!(request = %request.id, path = %request.path, error = %err, "Request failed unexpectedly");
    }
    err.to_sri()
}

fn complete(reply: &ReplySlot, response: SriResponse) {
    if !reply.send(Dispatch::Complete(response)) {
        debug!("Client went away before the response was ready");
    }
}

#[instrument(skip(api), fields(backend = api.db.backend()))]
async fn open_session(api: &Api, mode: DbMode) -> Result<DbHandle> {
    let session = api.db.acquire(mode).await?;
    debug!("Session acquired");
    Ok(DbHandle::new(session))
}

/// Serve one top-level request, handing the response to `reply`.
pub async fn handle_request(api: Arc<Api>, request: SriRequest, reply: ReplySlot) {
    let span = info_span!("request", id = %request.id, verb = %request.verb, path = %request.path);
    drive(api, request, reply).instrument(span).await
}

async fn drive(api: Arc<Api>, mut request: SriRequest, reply: ReplySlot) {
    let started = Instant::now();

    let Some(_permit) = AdmissionPermit::try_acquire(&api.admission) else {
        warn!("Rejecting request, server overloaded");
        complete(
            &reply,
            SriError::with_code(503, "server.overloaded", "too many requests in flight").into(),
        );
        return;
    };

    for transform in &api.hooks.transform_request {
        if let Err(err) = transform(&mut request) {
            complete(&reply, err.into());
            return;
        }
    }

    let Some(route) = api.routes.match_href(&request.verb, &request.path) else {
        complete(&reply, no_route(&request).into());
        return;
    };
    request.path_params = route.params.clone();

    let nodes = if route.record.is_batch() {
        match batch::match_batch(&api, &request) {
            Ok(nodes) => Some(nodes),
            Err(err) => {
                complete(&reply, err.into());
                return;
            }
        }
    } else {
        None
    };

    let read_only = match &nodes {
        Some(nodes) => batch::is_read_only(nodes),
        None => route.record.read_only,
    };

    let stream = route.record.streaming.then(|| {
        let output = StreamingOutput::new(reply.clone(), api.config.streaming_keep_alive);
        if request.dry_run {
            output.set_header("dry-run", "true");
        }
        output
    });
    request.stream = stream.clone();
    let request = Arc::new(request);

    let (mode, timing) = if read_only {
        (DbMode::Task, "db-starttask")
    } else {
        (DbMode::Transaction, "db-starttransaction")
    };
    let acquire_started = Instant::now();
    let db = match open_session(&api, mode).await {
        Ok(db) => db,
        Err(err) => {
            let sri = client_error(&request, &err);
            complete(&reply, sri.into());
            return;
        }
    };
    request.timings().record_since(timing, acquire_started);

    let mut outcome = run(&api, &route, &request, &db, nodes, stream.as_ref()).await;
    if request.is_cancelled()
        && outcome.as_ref().is_ok_and(|r| (200..300).contains(&r.status))
    {
        debug!("Request cancelled after its handlers finished");
        outcome = Err(SriError::cancelled().into());
    }

    let status = match &outcome {
        Ok(response) => response.status,
        Err(err) => err.status(),
    };
    let commit = (200..300).contains(&status) && !request.dry_run && !request.is_cancelled();
    let outcome = finish_session(&request, &db, commit).await.and(outcome);

    let final_status = match &outcome {
        Ok(response) => response.status,
        Err(err) => err.status(),
    };
    run_after_request(&api, &request, final_status).await;

    match stream.filter(|s| s.is_started()) {
        Some(stream) => respond_streamed(&api, &request, &stream, outcome).await,
        None => {
            let response = match outcome {
                Ok(response) => response,
                Err(err) => client_error(&request, &err).into(),
            };
            complete(&reply, decorate(&api, &request, response));
        }
    }

    info!(
        status = final_status,
        committed = commit,
        dry_run = request.dry_run,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request finished"
    );
}

async fn run(
    api: &Arc<Api>,
    route: &RouteMatch,
    request: &Arc<SriRequest>,
    db: &DbHandle,
    nodes: Option<Vec<BatchNode>>,
    stream: Option<&StreamingOutput>,
) -> Result<SriResponse> {
    if let Some(nodes) = nodes {
        return batch::execute(api, request, db, nodes, stream).await;
    }

    let job = route_job(api.clone(), route.record.clone(), request.clone(), db.clone());
    let mut settled = phase_synced_settle(vec![job], settle_options(api)).await;
    match settled.pop() {
        Some(Settled::Fulfilled(response)) => Ok(response),
        Some(Settled::Rejected(err)) => Err(err),
        _ => Err(Error::Internal("request job did not settle".to_string())),
    }
}

async fn finish_session(request: &SriRequest, db: &DbHandle, commit: bool) -> Result<()> {
    let started = Instant::now();
    let completion = db.finish(commit).await?;
    request
        .timings()
        .record_since(completion.timing_name(), started);
    debug!(completion = ?completion, "Database session finished");
    Ok(())
}

async fn run_after_request(api: &Api, request: &Arc<SriRequest>, status: u16) {
    for hook in &api.hooks.after_request {
        if let Err(err) = hook(request.clone(), status).await {
            warn!(status = err.status, error = %err.body, "After-request hook failed");
        }
    }
}

/// Add the dry-run and timing headers to a complete response.
fn decorate(api: &Api, request: &SriRequest, mut response: SriResponse) -> SriResponse {
    if request.dry_run {
        response.headers.push(("dry-run".to_string(), "true".to_string()));
    }
    if api.config.server_timing {
        response
            .headers
            .push(("server-timing".to_string(), request.timings().server_timing()));
    }
    response
}

/// Finish a response whose head already went out.
async fn respond_streamed(
    api: &Api,
    request: &SriRequest,
    stream: &StreamingOutput,
    outcome: Result<SriResponse>,
) {
    let written = match outcome {
        Err(err) => {
            stream.fail(&client_error(request, &err)).await;
            return;
        }
        Ok(response) if response.streamed => Ok(()),
        Ok(response) => write_results(stream, response).await,
    };
    if let Err(err) = written {
        debug!(error = %err, "Streamed response not delivered");
        stream.close();
        return;
    }

    if api.config.server_timing {
        let trailers = [("server-timing".to_string(), request.timings().server_timing())];
        if let Err(err) = stream.send_trailers(&trailers).await {
            debug!(error = %err, "Trailers not delivered");
        }
    }
    stream.close();
}

/// Write a buffered response into an open stream as
/// `{"results": [...], "status": N}`.
async fn write_results(stream: &StreamingOutput, response: SriResponse) -> Result<()> {
    let mut extra = Map::new();
    extra.insert("status".to_string(), json!(response.status));

    stream.begin_results(None).await?;
    match response.body {
        Some(Value::Array(items)) => {
            for item in &items {
                stream.push(item).await?;
            }
        }
        Some(other) => stream.push(&other).await?,
        None => {}
    }
    stream.finish(&extra).await
}

/// Run `request` to completion on its own task and wait for the response.
///
/// Convenience for embedding and tests; the HTTP layer uses
/// [`handle_request`] directly.
pub async fn execute(api: Arc<Api>, request: SriRequest) -> Result<Dispatch> {
    let (reply, rx) = ReplySlot::new();
    tokio::spawn(handle_request(api, request, reply));
    rx.await
        .map_err(|_| Error::Internal("request ended without a response".to_string()))
}
