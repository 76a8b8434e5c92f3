// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP front end.
//!
//! Routing is done by the [`Api`]'s own route table, so the axum router is a
//! single fallback that turns the HTTP request into an [`SriRequest`], runs
//! the lifecycle on its own task and maps the [`Dispatch`] it produces back
//! to an HTTP response.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_TYPE, TRAILER};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::api::Api;
use crate::error::SriError;
use crate::lifecycle;
use crate::request::{CancellationGuard, SriRequest, SriResponse};
use crate::streaming::{Dispatch, ReplySlot, StreamHead, into_body};

/// Largest request body accepted.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Router serving every route of `api`.
pub fn router(api: Arc<Api>) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(api)
        .layer(TraceLayer::new_for_http())
}

async fn dispatch(State(api): State<Arc<Api>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "Failed to read request body");
            return complete_response(
                SriError::with_code(400, "body.invalid", "request body could not be read").into(),
            );
        }
    };
    let body = if bytes.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                return complete_response(
                    SriError::with_code(400, "body.invalid", format!("invalid JSON: {}", err))
                        .into(),
                );
            }
        }
    };

    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let request = SriRequest::new(parts.method, url)
        .with_headers(parts.headers)
        .with_body(body);
    let guard = request.cancellation_guard();

    let (reply, rx) = ReplySlot::new();
    let server_timing = api.config.server_timing;
    tokio::spawn(lifecycle::handle_request(api, request, reply));

    match rx.await {
        Ok(Dispatch::Complete(response)) => {
            guard.disarm();
            complete_response(response)
        }
        Ok(Dispatch::Stream(head)) => stream_response(head, server_timing, guard),
        Err(_) => {
            guard.disarm();
            error!("Request task ended without a response");
            complete_response(SriError::internal().into())
        }
    }
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn append_headers(response: &mut Response, headers: &[(String, String)]) {
    for (name, value) in headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => warn!(header = %name, "Dropping invalid response header"),
        }
    }
}

fn complete_response(response: SriResponse) -> Response {
    let body = match &response.body {
        Some(value) => match serde_json::to_vec(value) {
            Ok(bytes) => Body::from(bytes),
            Err(err) => {
                error!(error = %err, "Failed to serialize response body");
                return complete_response(SriError::internal().into());
            }
        },
        None => Body::empty(),
    };

    let mut http = Response::new(body);
    *http.status_mut() = status_code(response.status);
    if response.body.is_some() {
        http.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    append_headers(&mut http, &response.headers);
    http
}

fn stream_response(
    head: StreamHead,
    server_timing: bool,
    guard: CancellationGuard,
) -> Response {
    let mut http = Response::new(into_body(head.frames, guard));
    *http.status_mut() = status_code(head.status);
    if server_timing {
        http.headers_mut()
            .insert(TRAILER, HeaderValue::from_static("server-timing"));
    }
    append_headers(&mut http, &head.headers);
    http
}

/// Serve `api` on an already bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    api: Arc<Api>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router(api))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

/// Bind `addr` and serve `api` until `shutdown` resolves.
pub async fn run_http_server(
    api: Arc<Api>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, api, shutdown).await
}
