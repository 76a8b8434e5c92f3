// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! sri-server - standalone resource server
//!
//! Loads resource definitions from a JSON file, creates their tables and
//! serves them over HTTP until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use sri_core::config::Config;
use sri_core::persistence::{Database, PostgresDatabase, SqliteDatabase};
use sri_core::resource::{Resource, ResourceDefinition};
use sri_core::{ApiBuilder, server};

async fn connect(url: &str) -> Result<Arc<dyn Database>> {
    let db: Arc<dyn Database> = if url.starts_with("postgres://") || url.starts_with("postgresql://")
    {
        Arc::new(PostgresDatabase::connect(url).await?)
    } else {
        Arc::new(SqliteDatabase::connect(url).await?)
    };
    Ok(db)
}

fn load_resources(config: &Config) -> Result<Vec<ResourceDefinition>> {
    let raw = std::fs::read_to_string(&config.resources_file).with_context(|| {
        format!(
            "reading resource definitions from {}",
            config.resources_file.display()
        )
    })?;
    let definitions: Vec<ResourceDefinition> =
        serde_json::from_str(&raw).context("parsing resource definitions")?;
    Ok(definitions)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sri_core=info".parse()?),
        )
        .init();

    info!("Starting sri-server");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        http_addr = %config.http_addr,
        max_requests = config.max_concurrent_requests,
        server_timing = config.server_timing,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let db = connect(&config.database_url).await?;
    info!(backend = db.backend(), "Database connection established");

    let definitions = load_resources(&config)?;
    info!(count = definitions.len(), "Resource definitions loaded");

    let addr = config.http_addr;
    let mut builder = ApiBuilder::new(config, db);
    for definition in definitions {
        builder = builder.resource(Resource::builder(definition));
    }
    let api = builder.build().await?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutting down...");
    };
    server::run_http_server(api, addr, shutdown).await?;

    info!("Shutdown complete");
    Ok(())
}
