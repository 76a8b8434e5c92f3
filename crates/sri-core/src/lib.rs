// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! sri-core - Phase-synchronized REST resource engine
//!
//! This crate serves collections of JSON documents over HTTP: single-document
//! reads and writes, filtered lists, and batches of operations that run inside
//! one database transaction. Every handler is split into phases, and a batch
//! runs all of its items phase by phase so that, for example, every item is
//! validated before any item writes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              HTTP clients                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  server        axum fallback -> SriRequest, Dispatch -> Response         │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  lifecycle     admission -> routing -> session -> settle -> commit       │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                        │                         │
//!           ▼                        ▼                         ▼
//! ┌───────────────────┐  ┌───────────────────────┐  ┌─────────────────────┐
//! │ batch             │  │ scheduler             │  │ streaming           │
//! │ match + assemble  │─►│ phase_synced_settle   │  │ heartbeat, trailers │
//! └───────────────────┘  └───────────────────────┘  └─────────────────────┘
//!                                    │
//!                                    ▼
//!                        ┌───────────────────────┐
//!                        │ resource handlers     │
//!                        │ GET PUT PATCH DELETE  │
//!                        │ list, filters, hooks  │
//!                        └───────────────────────┘
//!                                    │
//!                                    ▼
//!                 ┌─────────────────────────────────────┐
//!                 │ persistence: PostgreSQL | SQLite    │
//!                 └─────────────────────────────────────┘
//! ```
//!
//! # Routes
//!
//! For a resource registered at `/persons`:
//!
//! | Verb | Path | Handler |
//! |------|------|---------|
//! | `GET` | `/persons/:key` | read one document |
//! | `PUT` | `/persons/:key` | create (201) or replace (200) |
//! | `PATCH` | `/persons/:key` | JSON merge patch |
//! | `DELETE` | `/persons/:key` | soft delete |
//! | `GET` | `/persons` | filtered, ordered, paged list |
//! | `PUT`/`POST` | `/persons/batch` | batch, buffered response |
//! | `PUT`/`POST` | `/persons/batch_streaming` | batch, streamed response |
//!
//! `/batch` and `/batch_streaming` are also registered at the root.
//!
//! # Transactions
//!
//! A request whose routes are all read-only runs on a plain connection.
//! Anything else runs in a transaction that is committed only when the final
//! status is 2xx, `dryRun=true` was not given, and the client is still
//! connected. After a disconnect every job stops at its next barrier with
//! `499 request.cancelled`.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SRI_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `SRI_HTTP_PORT` | No | `5000` | HTTP server port |
//! | `SRI_MAX_CONCURRENT_REQUESTS` | No | `32` | Admission gate capacity |
//! | `SRI_STREAMING_KEEP_ALIVE_MS` | No | `20000` | Heartbeat interval |
//! | `SRI_SERVER_TIMING` | No | `false` | Emit `Server-Timing` |
//! | `SRI_DEFAULT_PAGE_SIZE` | No | `30` | List page size |
//! | `SRI_MAX_PAGE_SIZE` | No | `500` | Largest accepted `limit` |
//! | `SRI_RESOURCES_FILE` | No | `resources.json` | Resource definitions |

#![warn(missing_docs)]

/// Admission control for incoming requests.
pub mod admission;

/// The immutable api: resources, routes and global hooks.
pub mod api;

/// Batch matching, execution and response assembly.
pub mod batch;

/// Server configuration loaded from environment variables.
pub mod config;

/// Error types and the SRI error body format.
pub mod error;

/// Resource hook stages and global hooks.
pub mod hooks;

/// Request lifecycle: admission, session, settle, commit.
pub mod lifecycle;

/// Database sessions and the PostgreSQL and SQLite backends.
pub mod persistence;

/// Requests, responses and timing.
pub mod request;

/// Resources and their CRUD and list handlers.
pub mod resource;

/// Route patterns and the route table.
pub mod routing;

/// Embeddable runtime for serving an api from an existing application.
pub mod runtime;

/// The phase-synchronized scheduler.
pub mod scheduler;

/// JSON Schema validation of resource documents.
pub mod schema;

/// HTTP front end.
pub mod server;

/// Streaming response output.
pub mod streaming;

pub use api::{Api, ApiBuilder, CustomHandler, CustomRoute, RouteContext};
pub use config::Config;
pub use error::{Error, Result, SriError};
pub use hooks::{Element, Hook, HookContext, Stage};
pub use persistence::{Database, DbHandle, DbMode, DbSession, PostgresDatabase, SqliteDatabase};
pub use request::{SriRequest, SriResponse};
pub use resource::{Resource, ResourceDefinition};
pub use scheduler::{Job, PhaseSyncer, Settled, phase_synced_settle};
pub use streaming::StreamingOutput;
