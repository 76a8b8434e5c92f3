// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The immutable [`Api`]: configuration, resources, routes and hooks.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sri_core::{ApiBuilder, Config, Resource, ResourceDefinition, SqliteDatabase};
//!
//! let db = Arc::new(SqliteDatabase::in_memory().await?);
//! let api = ApiBuilder::new(Config::default(), db)
//!     .resource(Resource::builder(ResourceDefinition::new("/persons", "persons")))
//!     .build()
//!     .await?;
//! let app = sri_core::server::router(api);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::Method;
use futures::future::BoxFuture;
use tracing::info;

use crate::admission::{AdmissionGate, ConcurrencyGate};
use crate::config::Config;
use crate::error::{Error, Result, SriError};
use crate::hooks::{AfterRequestFn, Element, GlobalHooks, HookContext, TransformRequestFn};
use crate::persistence::{Database, DbHandle};
use crate::request::{SriRequest, SriResponse};
use crate::resource::{Resource, ResourceBuilder};
use crate::routing::{BatchHandlerRecord, HandlerKind, RoutePattern, RouteRegistry};
use crate::scheduler::PhaseSyncer;
use crate::streaming::StreamingOutput;

/// What a route handler gets to work with.
#[derive(Debug)]
pub struct RouteContext {
    /// The operation.
    pub request: Arc<SriRequest>,
    /// Shared session of the top-level request.
    pub db: DbHandle,
    /// Barrier access for this job.
    pub syncer: PhaseSyncer,
    /// Server configuration.
    pub config: Arc<Config>,
}

impl RouteContext {
    /// Wait for the rest of the wave; see [`PhaseSyncer::phase`].
    pub async fn phase(&mut self) -> Result<()> {
        self.syncer.phase().await
    }

    /// Output stream, for streaming routes.
    pub fn stream(&self) -> Option<&StreamingOutput> {
        self.request.stream.as_ref()
    }

    /// Hook context for `elements`.
    pub fn hook_context(&self, elements: Vec<Element>) -> HookContext {
        HookContext {
            db: self.db.clone(),
            request: self.request.clone(),
            elements,
        }
    }
}

/// Application route handler.
#[async_trait]
pub trait CustomHandler: Send + Sync {
    /// Handle one operation.
    async fn handle(&self, ctx: RouteContext) -> Result<SriResponse>;
}

#[async_trait]
impl<F> CustomHandler for F
where
    F: Fn(RouteContext) -> BoxFuture<'static, Result<SriResponse>> + Send + Sync,
{
    async fn handle(&self, ctx: RouteContext) -> Result<SriResponse> {
        (self)(ctx).await
    }
}

/// Registration of an application route.
pub struct CustomRoute {
    pattern: String,
    verb: Method,
    handler: Arc<dyn CustomHandler>,
    read_only: bool,
    streaming: bool,
}

impl CustomRoute {
    /// Writable, non-streaming route.
    pub fn new(verb: Method, pattern: impl Into<String>, handler: impl CustomHandler + 'static) -> Self {
        Self {
            pattern: pattern.into(),
            verb,
            handler: Arc::new(handler),
            read_only: false,
            streaming: false,
        }
    }

    /// The route never writes.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// The handler writes through [`RouteContext::stream`].
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }
}

/// Everything needed to serve requests. Built once, never mutated.
pub struct Api {
    pub(crate) config: Arc<Config>,
    pub(crate) db: Arc<dyn Database>,
    pub(crate) routes: RouteRegistry,
    pub(crate) resources: Vec<Arc<Resource>>,
    pub(crate) hooks: GlobalHooks,
    pub(crate) admission: Arc<dyn AdmissionGate>,
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api")
            .field("backend", &self.db.backend())
            .field("resources", &self.resources)
            .field("routes", &self.routes.routes().len())
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl Api {
    /// Configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Database.
    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Route table.
    pub fn routes(&self) -> &RouteRegistry {
        &self.routes
    }

    /// Resource by collection path.
    pub fn resource(&self, type_path: &str) -> Option<&Arc<Resource>> {
        self.resources.iter().find(|r| r.type_path() == type_path)
    }
}

/// Builder for [`Api`].
pub struct ApiBuilder {
    config: Config,
    db: Arc<dyn Database>,
    resources: Vec<ResourceBuilder>,
    routes: Vec<CustomRoute>,
    hooks: GlobalHooks,
    admission: Option<Arc<dyn AdmissionGate>>,
}

impl std::fmt::Debug for ApiBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiBuilder")
            .field("config", &self.config)
            .field("resources", &self.resources.len())
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl ApiBuilder {
    /// Start with a configuration and a database.
    pub fn new(config: Config, db: Arc<dyn Database>) -> Self {
        Self {
            config,
            db,
            resources: Vec::new(),
            routes: Vec::new(),
            hooks: GlobalHooks::default(),
            admission: None,
        }
    }

    /// Add a resource.
    pub fn resource(mut self, resource: ResourceBuilder) -> Self {
        self.resources.push(resource);
        self
    }

    /// Add an application route.
    pub fn route(mut self, route: CustomRoute) -> Self {
        self.routes.push(route);
        self
    }

    /// Add a transform-request hook.
    pub fn transform_request(
        mut self,
        hook: impl Fn(&mut SriRequest) -> std::result::Result<(), SriError> + Send + Sync + 'static,
    ) -> Self {
        let hook: TransformRequestFn = Arc::new(hook);
        self.hooks.transform_request.push(hook);
        self
    }

    /// Add a before-phase hook.
    pub fn before_phase(
        mut self,
        hook: impl Fn(usize, Vec<Arc<SriRequest>>) -> BoxFuture<'static, std::result::Result<(), SriError>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.hooks.before_phase.push(Arc::new(hook));
        self
    }

    /// Add an after-request hook.
    pub fn after_request(
        mut self,
        hook: impl Fn(Arc<SriRequest>, u16) -> BoxFuture<'static, std::result::Result<(), SriError>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        let hook: AfterRequestFn = Arc::new(hook);
        self.hooks.after_request.push(hook);
        self
    }

    /// Replace the default [`ConcurrencyGate`].
    pub fn admission(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.admission = Some(gate);
        self
    }

    /// Compile resources, create their tables and freeze the route table.
    pub async fn build(self) -> Result<Arc<Api>> {
        if self.config.streaming_keep_alive.is_zero() {
            return Err(Error::Configuration(
                "streaming keep-alive interval must be positive".to_string(),
            ));
        }

        let mut resources = Vec::with_capacity(self.resources.len());
        let mut routes = Vec::new();

        for builder in self.resources {
            let resource = Arc::new(builder.build()?);
            self.db.ensure_table(resource.table()).await?;
            routes.extend(resource.routes()?);
            info!(
                resource = resource.type_path(),
                table = resource.table(),
                "Resource registered"
            );
            resources.push(resource);
        }

        for verb in [Method::PUT, Method::POST] {
            for (pattern, streaming) in [("/batch", false), ("/batch_streaming", true)] {
                routes.push(BatchHandlerRecord::new(
                    RoutePattern::parse(pattern)?,
                    verb.clone(),
                    HandlerKind::Batch { streaming },
                ));
            }
        }

        for route in self.routes {
            routes.push(
                BatchHandlerRecord::new(
                    RoutePattern::parse(&route.pattern)?,
                    route.verb,
                    HandlerKind::Custom(route.handler),
                )
                .read_only(route.read_only)
                .streaming(route.streaming),
            );
        }

        let routes = RouteRegistry::new(routes)?;
        let admission = self.admission.unwrap_or_else(|| {
            Arc::new(ConcurrencyGate::new(self.config.max_concurrent_requests))
        });

        info!(
            backend = self.db.backend(),
            resources = resources.len(),
            routes = routes.routes().len(),
            "Api built"
        );

        Ok(Arc::new(Api {
            config: Arc::new(self.config),
            db: self.db,
            routes,
            resources,
            hooks: self.hooks,
            admission,
        }))
    }
}
