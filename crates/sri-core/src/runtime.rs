// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for sri-core.
//!
//! [`SriRuntime`] serves an [`Api`] from inside an existing tokio application
//! instead of the standalone binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sri_core::{ApiBuilder, Config, SqliteDatabase};
//! use sri_core::runtime::SriRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let db = Arc::new(SqliteDatabase::connect("sqlite://data.db").await?);
//!     let api = ApiBuilder::new(Config::default(), db).build().await?;
//!
//!     let runtime = SriRuntime::builder()
//!         .api(api)
//!         .bind_addr("0.0.0.0:5000".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::api::Api;
use crate::server;

/// Builder for creating a [`SriRuntime`].
#[derive(Debug)]
pub struct SriRuntimeBuilder {
    api: Option<Arc<Api>>,
    bind_addr: SocketAddr,
}

impl Default for SriRuntimeBuilder {
    fn default() -> Self {
        Self {
            api: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
        }
    }
}

impl SriRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the api to serve (required).
    pub fn api(mut self, api: Arc<Api>) -> Self {
        self.api = Some(api);
        self
    }

    /// Set the bind address. Port 0 picks a free port.
    ///
    /// Default: `0.0.0.0:5000`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<SriRuntimeConfig> {
        let api = self
            .api
            .ok_or_else(|| anyhow::anyhow!("api is required"))?;

        Ok(SriRuntimeConfig {
            api,
            bind_addr: self.bind_addr,
        })
    }
}

/// Configuration for a [`SriRuntime`].
#[derive(Debug)]
pub struct SriRuntimeConfig {
    api: Arc<Api>,
    bind_addr: SocketAddr,
}

impl SriRuntimeConfig {
    /// Bind the listener and spawn the HTTP server task.
    pub async fn start(self) -> Result<SriRuntime> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let shutdown = async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
            info!("HTTP server received shutdown signal");
        };
        let server_handle = tokio::spawn(server::serve(listener, self.api.clone(), shutdown));

        info!(addr = %local_addr, "SriRuntime started");

        Ok(SriRuntime {
            server_handle,
            shutdown_tx,
            api: self.api,
            local_addr,
        })
    }
}

/// A running sri-core server embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination: in-flight
/// requests finish, new connections are refused.
#[derive(Debug)]
pub struct SriRuntime {
    server_handle: JoinHandle<Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    api: Arc<Api>,
    local_addr: SocketAddr,
}

impl SriRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> SriRuntimeBuilder {
        SriRuntimeBuilder::new()
    }

    /// Address the server actually listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The served api.
    pub fn api(&self) -> &Arc<Api> {
        &self.api
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!("SriRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("SriRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("SriRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("SriRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }
}
