// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for sri-core integration tests.
//!
//! Provides a [`TestContext`] that serves an api from an in-memory SQLite
//! database wrapped in a [`RecordingDatabase`], so tests can assert how many
//! sessions were acquired, committed and rolled back.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use sri_core::persistence::{DocumentRow, SelectQuery};
use sri_core::resource::ResourceBuilder;
use sri_core::{
    ApiBuilder, Config, Database, DbMode, DbSession, Resource, ResourceDefinition, Result,
    SqliteDatabase, server,
};

/// Counters shared by a [`RecordingDatabase`] and its sessions.
#[derive(Debug, Default)]
pub struct Counters {
    pub tasks: AtomicUsize,
    pub transactions: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub writes: AtomicUsize,
}

impl Counters {
    pub fn acquisitions(&self) -> usize {
        self.tasks.load(Ordering::SeqCst) + self.transactions.load(Ordering::SeqCst)
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Database wrapper that counts what the engine does with it.
pub struct RecordingDatabase {
    inner: Arc<dyn Database>,
    pub counters: Arc<Counters>,
}

impl RecordingDatabase {
    pub async fn new() -> Self {
        Self::wrap(Arc::new(SqliteDatabase::in_memory().await.unwrap()))
    }

    pub fn wrap(inner: Arc<dyn Database>) -> Self {
        Self {
            inner,
            counters: Arc::new(Counters::default()),
        }
    }
}

#[async_trait]
impl Database for RecordingDatabase {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        self.inner.ensure_table(table).await
    }

    async fn acquire(&self, mode: DbMode) -> Result<Box<dyn DbSession>> {
        match mode {
            DbMode::Task => self.counters.tasks.fetch_add(1, Ordering::SeqCst),
            DbMode::Transaction => self.counters.transactions.fetch_add(1, Ordering::SeqCst),
        };
        Ok(Box::new(RecordingSession {
            inner: self.inner.acquire(mode).await?,
            counters: self.counters.clone(),
        }))
    }
}

struct RecordingSession {
    inner: Box<dyn DbSession>,
    counters: Arc<Counters>,
}

#[async_trait]
impl DbSession for RecordingSession {
    fn mode(&self) -> DbMode {
        self.inner.mode()
    }

    async fn fetch(&mut self, table: &str, key: &str) -> Result<Option<DocumentRow>> {
        self.inner.fetch(table, key).await
    }

    async fn insert(&mut self, table: &str, key: &str, body: &Value) -> Result<DocumentRow> {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(table, key, body).await
    }

    async fn update(
        &mut self,
        table: &str,
        key: &str,
        body: &Value,
    ) -> Result<Option<DocumentRow>> {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update(table, key, body).await
    }

    async fn soft_delete(&mut self, table: &str, key: &str) -> Result<bool> {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.soft_delete(table, key).await
    }

    async fn select(&mut self, table: &str, query: &SelectQuery) -> Result<Vec<DocumentRow>> {
        self.inner.select(table, query).await
    }

    async fn count(&mut self, table: &str, query: &SelectQuery) -> Result<i64> {
        self.inner.count(table, query).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.inner.rollback().await
    }
}

/// JSON schema of the `/persons` test resource.
pub fn persons_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "key": {"type": "string"},
            "firstname": {"type": "string"},
            "lastname": {"type": "string"},
            "age": {"type": "integer", "minimum": 0}
        },
        "required": ["firstname"],
        "additionalProperties": false
    })
}

/// `/persons` resource builder.
pub fn persons() -> ResourceBuilder {
    let mut definition = ResourceDefinition::new("/persons", "persons");
    definition.schema = Some(persons_schema());
    Resource::builder(definition)
}

/// `/cities` resource builder, listed as a stream.
pub fn cities() -> ResourceBuilder {
    let mut definition = ResourceDefinition::new("/cities", "cities");
    definition.streaming_list = true;
    Resource::builder(definition)
}

/// Config for tests: server timing on.
pub fn test_config() -> Config {
    Config {
        streaming_keep_alive: Duration::from_secs(30),
        server_timing: true,
        ..Config::default()
    }
}

/// A response read to the end.
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub trailers: Option<HeaderMap>,
    pub text: String,
}

impl TestResponse {
    /// Body as JSON; `Null` for an empty body.
    pub fn json(&self) -> Value {
        let trimmed = self.text.trim();
        if trimmed.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(trimmed)
                .unwrap_or_else(|e| panic!("body is not JSON ({}): {}", e, self.text))
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Api served through the axum router, without a socket.
pub struct TestContext {
    pub api: Arc<sri_core::Api>,
    pub counters: Arc<Counters>,
    router: Router,
}

impl TestContext {
    /// `/persons` and `/cities` with the default test config.
    pub async fn new() -> Self {
        Self::with(test_config(), |builder| builder.resource(persons()).resource(cities())).await
    }

    /// Custom config and api.
    pub async fn with(config: Config, build: impl FnOnce(ApiBuilder) -> ApiBuilder) -> Self {
        Self::over(RecordingDatabase::new().await, config, build).await
    }

    /// Custom config and api over an already wrapped backend.
    pub async fn over(
        db: RecordingDatabase,
        config: Config,
        build: impl FnOnce(ApiBuilder) -> ApiBuilder,
    ) -> Self {
        let counters = db.counters.clone();
        let api = build(ApiBuilder::new(config, Arc::new(db)))
            .build()
            .await
            .unwrap();
        let router = server::router(api.clone());
        Self {
            api,
            counters,
            router,
        }
    }

    /// Send a JSON request and read the whole response.
    pub async fn send(&self, verb: Method, url: &str, body: Option<Value>) -> TestResponse {
        let body = match body {
            Some(value) => Body::from(serde_json::to_vec(&value).unwrap()),
            None => Body::empty(),
        };
        self.send_raw(verb, url, body).await
    }

    /// Send an arbitrary body and read the whole response.
    pub async fn send_raw(&self, verb: Method, url: &str, body: Body) -> TestResponse {
        let request = Request::builder()
            .method(verb)
            .uri(url)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let collected = response.into_body().collect().await.unwrap();
        let trailers = collected.trailers().cloned();
        let text = String::from_utf8(collected.to_bytes().to_vec()).unwrap();
        TestResponse {
            status,
            headers,
            trailers,
            text,
        }
    }

    pub async fn get(&self, url: &str) -> TestResponse {
        self.send(Method::GET, url, None).await
    }

    pub async fn put(&self, url: &str, body: Value) -> TestResponse {
        self.send(Method::PUT, url, Some(body)).await
    }

    pub async fn batch(&self, url: &str, items: Value) -> TestResponse {
        self.send(Method::POST, url, Some(items)).await
    }

    /// Create a person, asserting 201.
    pub async fn create_person(&self, key: &str, firstname: &str, age: i64) {
        let response = self
            .put(
                &format!("/persons/{}", key),
                json!({"firstname": firstname, "lastname": "Test", "age": age}),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.text);
    }

    pub fn commits(&self) -> usize {
        Counters::get(&self.counters.commits)
    }

    pub fn rollbacks(&self) -> usize {
        Counters::get(&self.counters.rollbacks)
    }

    pub fn writes(&self) -> usize {
        Counters::get(&self.counters.writes)
    }

    pub fn acquisitions(&self) -> usize {
        self.counters.acquisitions()
    }

    pub fn tasks(&self) -> usize {
        Counters::get(&self.counters.tasks)
    }

    pub fn transactions(&self) -> usize {
        Counters::get(&self.counters.transactions)
    }
}
