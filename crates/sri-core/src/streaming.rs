// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Incremental response output for streaming routes.
//!
//! The lifecycle driver and the HTTP layer meet at a [`ReplySlot`]: whoever
//! fills it first decides the shape of the response. A plain handler ends with
//! [`Dispatch::Complete`]; a streaming handler calls
//! [`StreamingOutput::start`], which sends the status line and headers right
//! away as [`Dispatch::Stream`] and keeps the body channel open until
//! [`StreamingOutput::close`].
//!
//! While the stream is open a heartbeat task writes a single space every
//! keep-alive interval so proxies do not time the connection out. Whitespace
//! between JSON tokens is harmless, and every frame we write ends on a token
//! boundary.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use http_body::Frame;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result, SriError};
use crate::request::{CancellationGuard, SriResponse};

/// One body frame on its way to the client.
pub type BodyFrame = std::result::Result<Frame<Bytes>, io::Error>;

const CHANNEL_CAPACITY: usize = 64;

/// Size of the filler written before an in-stream error, so that clients
/// buffering the response still get to see the diagnostic.
const ERROR_PADDING: usize = 8 * 1024;

/// Status, headers and body channel of a response that is already underway.
#[derive(Debug)]
pub struct StreamHead {
    /// HTTP status.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Body and trailer frames; an `Err` aborts the connection.
    pub frames: mpsc::Receiver<BodyFrame>,
}

/// What the HTTP layer should send.
#[derive(Debug)]
pub enum Dispatch {
    /// Whole response at once.
    Complete(SriResponse),
    /// Response head now, body frames as they come.
    Stream(StreamHead),
}

/// One-shot hand-off of the response to the HTTP layer.
#[derive(Clone, Debug)]
pub struct ReplySlot {
    tx: Arc<Mutex<Option<oneshot::Sender<Dispatch>>>>,
}

impl ReplySlot {
    /// New slot and the receiving end for the HTTP layer.
    pub fn new() -> (Self, oneshot::Receiver<Dispatch>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Fill the slot. Returns `false` when it was already filled or the
    /// receiver is gone.
    pub fn send(&self, dispatch: Dispatch) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        match tx {
            Some(tx) => tx.send(dispatch).is_ok(),
            None => false,
        }
    }

    /// Whether a response (complete or streamed) was handed off already.
    pub fn is_sent(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

#[derive(Default)]
struct State {
    status: Option<u16>,
    headers: Vec<(String, String)>,
    tx: Option<mpsc::Sender<BodyFrame>>,
    started: bool,
    closed: bool,
    results_open: bool,
    items: usize,
    heartbeat: Option<JoinHandle<()>>,
}

struct Inner {
    reply: ReplySlot,
    keep_alive: Duration,
    state: Mutex<State>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(heartbeat) = state.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

/// Writer for a streaming response, shared by every clone.
#[derive(Clone)]
pub struct StreamingOutput {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamingOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("StreamingOutput")
            .field("started", &state.started)
            .field("closed", &state.closed)
            .field("items", &state.items)
            .finish()
    }
}

impl StreamingOutput {
    /// Writer that delivers through `reply`.
    pub fn new(reply: ReplySlot, keep_alive: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                reply,
                keep_alive,
                state: Mutex::new(State::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Status to send with the head. Ignored once started.
    pub fn set_status(&self, status: u16) {
        let mut state = self.lock();
        if !state.started {
            state.status = Some(status);
        }
    }

    /// Extra header for the head. Ignored once started.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        let mut state = self.lock();
        if !state.started {
            state.headers.push((name.into(), value.into()));
        }
    }

    /// Whether the head was sent.
    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    /// Status sent (or to be sent) with the head.
    pub fn status(&self) -> u16 {
        self.lock().status.unwrap_or(200)
    }

    /// Send the head and start the heartbeat. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock();
        if state.started {
            return Ok(());
        }
        if self.inner.reply.is_sent() {
            return Err(Error::Internal(
                "response already sent, cannot start streaming".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        headers.append(&mut state.headers);

        let head = StreamHead {
            status: state.status.unwrap_or(200),
            headers,
            frames: rx,
        };
        if !self.inner.reply.send(Dispatch::Stream(head)) {
            return Err(Error::Internal("client went away".to_string()));
        }

        state.heartbeat = Some(spawn_heartbeat(tx.clone(), self.inner.keep_alive));
        state.tx = Some(tx);
        state.started = true;
        debug!("Streaming response started");
        Ok(())
    }

    async fn send(&self, frame: BodyFrame) -> Result<()> {
        let tx = {
            let state = self.lock();
            if state.closed {
                return Err(Error::Internal("stream already closed".to_string()));
            }
            state.tx.clone()
        };
        let tx = match tx {
            Some(tx) => tx,
            None => {
                self.start()?;
                self.lock()
                    .tx
                    .clone()
                    .ok_or_else(|| Error::Internal("stream not started".to_string()))?
            }
        };
        tx.send(frame)
            .await
            .map_err(|_| Error::Internal("client went away".to_string()))
    }

    /// Write raw bytes, starting the stream if needed.
    pub async fn write_raw(&self, chunk: impl Into<Bytes>) -> Result<()> {
        self.send(Ok(Frame::data(chunk.into()))).await
    }

    /// Open the `{"$$meta": …, "results": [` envelope.
    pub async fn begin_results(&self, meta: Option<&Value>) -> Result<()> {
        let opening = match meta {
            Some(meta) => format!(r#"{{"$$meta":{},"results":["#, meta),
            None => r#"{"results":["#.to_string(),
        };
        self.write_raw(opening).await?;
        let mut state = self.lock();
        state.results_open = true;
        state.items = 0;
        Ok(())
    }

    /// Append one element to the open results array.
    pub async fn push(&self, item: &Value) -> Result<()> {
        let first = {
            let state = self.lock();
            if !state.results_open {
                return Err(Error::Internal("results array not open".to_string()));
            }
            state.items == 0
        };
        let mut chunk = String::new();
        if !first {
            chunk.push(',');
        }
        chunk.push_str(&item.to_string());
        self.write_raw(chunk).await?;
        self.lock().items += 1;
        Ok(())
    }

    /// Close the results array, append `extra` as sibling keys and close the
    /// envelope.
    pub async fn finish(&self, extra: &Map<String, Value>) -> Result<()> {
        let mut chunk = String::from("]");
        for (key, value) in extra {
            chunk.push_str(&format!(",{}:{}", Value::String(key.clone()), value));
        }
        chunk.push('}');
        self.write_raw(chunk).await?;
        self.lock().results_open = false;
        Ok(())
    }

    /// Number of elements pushed into the current results array.
    pub fn items(&self) -> usize {
        self.lock().items
    }

    /// Send trailers (e.g. `server-timing`) after the body.
    pub async fn send_trailers(&self, trailers: &[(String, String)]) -> Result<()> {
        let mut map = HeaderMap::new();
        for (name, value) in trailers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| Error::Internal(format!("invalid trailer name: {}", e)))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| Error::Internal(format!("invalid trailer value: {}", e)))?;
            map.append(name, value);
        }
        self.send(Ok(Frame::trailers(map))).await
    }

    /// End the body. Further writes fail.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.tx = None;
        if let Some(heartbeat) = state.heartbeat.take() {
            heartbeat.abort();
        }
    }

    /// Report an error after the head went out, then abort the connection.
    ///
    /// The status line cannot change anymore, so the error is written into
    /// the body behind a block of filler whitespace, and the body is ended
    /// with an error frame so the client sees a broken transfer instead of a
    /// well-formed document.
    pub async fn fail(&self, err: &SriError) {
        warn!(status = err.status, error = %err.body, "Aborting streamed response");
        let mut chunk = " ".repeat(ERROR_PADDING);
        chunk.push_str(&format!("\n\n{}\n", err.body));
        if self.write_raw(chunk).await.is_ok() {
            let _ = self
                .send(Err(io::Error::other(format!(
                    "stream aborted with status {}",
                    err.status
                ))))
                .await;
        }
        self.close();
    }
}

fn spawn_heartbeat(tx: mpsc::Sender<BodyFrame>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            ticker.tick().await;
            if tx.send(Ok(Frame::data(Bytes::from_static(b" ")))).await.is_err() {
                break;
            }
        }
    })
}

/// Turn a stream head's frame channel into a response body.
///
/// `guard` lives as long as the body: a client that disconnects mid-stream
/// drops it and cancels the request. It is disarmed once the writer closed.
pub fn into_body(mut frames: mpsc::Receiver<BodyFrame>, guard: CancellationGuard) -> Body {
    let stream = async_stream::stream! {
        let guard = guard;
        while let Some(frame) = frames.recv().await {
            yield frame;
        }
        guard.disarm();
    };
    Body::new(http_body_util::StreamBody::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn collect(head: &mut StreamHead) -> (String, Option<HeaderMap>, bool) {
        let mut body = String::new();
        let mut trailers = None;
        let mut failed = false;
        while let Some(frame) = head.frames.recv().await {
            match frame {
                Ok(frame) => match frame.into_data() {
                    Ok(data) => body.push_str(std::str::from_utf8(&data).unwrap()),
                    Err(frame) => trailers = frame.into_trailers().ok(),
                },
                Err(_) => failed = true,
            }
        }
        (body, trailers, failed)
    }

    fn head(dispatch: Dispatch) -> StreamHead {
        match dispatch {
            Dispatch::Stream(head) => head,
            other => panic!("expected stream, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_results_envelope_and_trailers() {
        let (slot, rx) = ReplySlot::new();
        let out = StreamingOutput::new(slot, Duration::from_secs(60));
        out.set_status(201);
        out.set_header("x-extra", "1");

        out.begin_results(Some(&json!({"count": 2}))).await.unwrap();
        let mut head = head(rx.await.unwrap());
        assert_eq!(head.status, 201);
        assert!(head.headers.iter().any(|(k, v)| k == "x-extra" && v == "1"));

        out.push(&json!({"a": 1})).await.unwrap();
        out.push(&json!({"b": 2})).await.unwrap();
        let mut extra = Map::new();
        extra.insert("status".to_string(), json!(200));
        out.finish(&extra).await.unwrap();
        out.send_trailers(&[("server-timing".to_string(), "db-commit;dur=1.000".to_string())])
            .await
            .unwrap();
        assert_eq!(out.items(), 2);
        out.close();

        let (body, trailers, failed) = collect(&mut head).await;
        let parsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(
            parsed,
            json!({"$$meta": {"count": 2}, "results": [{"a": 1}, {"b": 2}], "status": 200})
        );
        assert_eq!(
            trailers.unwrap().get("server-timing").unwrap(),
            "db-commit;dur=1.000"
        );
        assert!(!failed);
    }

    #[tokio::test]
    async fn test_start_fails_when_reply_already_sent() {
        let (slot, _rx) = ReplySlot::new();
        assert!(slot.send(Dispatch::Complete(SriResponse::ok(json!({})))));
        assert!(!slot.send(Dispatch::Complete(SriResponse::ok(json!({})))));

        let out = StreamingOutput::new(slot, Duration::from_secs(60));
        assert!(out.start().is_err());
    }

    #[tokio::test]
    async fn test_push_requires_open_results() {
        let (slot, _rx) = ReplySlot::new();
        let out = StreamingOutput::new(slot, Duration::from_secs(60));
        assert!(out.push(&json!(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_writes_whitespace_while_idle() {
        let (slot, rx) = ReplySlot::new();
        let out = StreamingOutput::new(slot, Duration::from_millis(100));
        out.start().unwrap();
        let mut head = head(rx.await.unwrap());

        tokio::time::sleep(Duration::from_millis(350)).await;
        out.write_raw("{}").await.unwrap();
        out.close();

        let (body, _, _) = collect(&mut head).await;
        assert_eq!(body, "   {}");
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_fail_pads_and_aborts() {
        let (slot, rx) = ReplySlot::new();
        let out = StreamingOutput::new(slot, Duration::from_secs(60));
        out.begin_results(None).await.unwrap();
        let mut head = head(rx.await.unwrap());

        let reader = tokio::spawn(async move { collect(&mut head).await });
        out.fail(&SriError::with_code(500, "boom", "exploded")).await;

        let (body, _, failed) = reader.await.unwrap();
        assert!(failed);
        assert!(body.len() > ERROR_PADDING);
        assert!(body.contains("boom"));
        assert!(out.write_raw("x").await.is_err());
    }
}
