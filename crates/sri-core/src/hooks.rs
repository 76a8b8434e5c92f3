// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hook pipeline.
//!
//! Resource hooks are grouped per [`Stage`] and run in registration order; the
//! first failure stops the pipeline and becomes the operation's result.
//! Global hooks act on whole requests:
//!
//! | Hook | When | Failure |
//! |------|------|---------|
//! | transform-request | before route matching | rejects the request |
//! | before-phase | every barrier of a job set | rejects every job in the wave |
//! | after-request | after commit/rollback | logged only |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::SriError;
use crate::persistence::DbHandle;
use crate::request::SriRequest;
use crate::scheduler::BeforePhaseFn;

/// Point in a resource operation where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Before fetching for GET and list.
    BeforeRead,
    /// After fetching for GET and list.
    AfterRead,
    /// Before a new document is written.
    BeforeInsert,
    /// After a new document was written.
    AfterInsert,
    /// Before an existing document is replaced.
    BeforeUpdate,
    /// After an existing document was replaced.
    AfterUpdate,
    /// Before a soft delete.
    BeforeDelete,
    /// After a soft delete.
    AfterDelete,
}

/// One document affected by the operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    /// `/type/key`.
    pub permalink: String,
    /// Document sent by the client (PUT/PATCH), if any.
    pub incoming: Option<Value>,
    /// Stored document before (or after, for after-stages) the operation.
    pub stored: Option<Value>,
}

/// Everything a resource hook can see.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Shared session of the request.
    pub db: DbHandle,
    /// The operation (the batch item, for batch parts).
    pub request: Arc<SriRequest>,
    /// Affected documents.
    pub elements: Vec<Element>,
}

/// A resource hook.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Run the hook; an error aborts the operation with that response.
    async fn call(&self, ctx: &HookContext) -> Result<(), SriError>;
}

#[async_trait]
impl<F> Hook for F
where
    F: Fn(HookContext) -> BoxFuture<'static, Result<(), SriError>> + Send + Sync,
{
    async fn call(&self, ctx: &HookContext) -> Result<(), SriError> {
        (self)(ctx.clone()).await
    }
}

/// Resource hooks keyed by stage.
#[derive(Clone, Default)]
pub struct HookPipeline {
    stages: HashMap<Stage, Vec<Arc<dyn Hook>>>,
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<_, _> = self.stages.iter().map(|(s, h)| (*s, h.len())).collect();
        f.debug_struct("HookPipeline").field("stages", &counts).finish()
    }
}

impl HookPipeline {
    /// Append a hook to `stage`.
    pub fn add(&mut self, stage: Stage, hook: Arc<dyn Hook>) {
        self.stages.entry(stage).or_default().push(hook);
    }

    /// Number of hooks registered for `stage`.
    pub fn len(&self, stage: Stage) -> usize {
        self.stages.get(&stage).map_or(0, Vec::len)
    }

    /// Run every hook of `stage` in order, stopping at the first failure.
    pub async fn run(&self, stage: Stage, ctx: &HookContext) -> Result<(), SriError> {
        let Some(hooks) = self.stages.get(&stage) else {
            return Ok(());
        };
        for hook in hooks {
            hook.call(ctx).await?;
        }
        Ok(())
    }
}

/// Rewrites or rejects a request before route matching.
pub type TransformRequestFn = Arc<dyn Fn(&mut SriRequest) -> Result<(), SriError> + Send + Sync>;

/// Observes a finished request and its final status.
pub type AfterRequestFn =
    Arc<dyn Fn(Arc<SriRequest>, u16) -> BoxFuture<'static, Result<(), SriError>> + Send + Sync>;

/// Hooks that apply to every request.
#[derive(Clone, Default)]
pub struct GlobalHooks {
    /// Run in order on the incoming request.
    pub transform_request: Vec<TransformRequestFn>,
    /// Run at every barrier.
    pub before_phase: Vec<BeforePhaseFn>,
    /// Run after the session was finished.
    pub after_request: Vec<AfterRequestFn>,
}

impl std::fmt::Debug for GlobalHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalHooks")
            .field("transform_request", &self.transform_request.len())
            .field("before_phase", &self.before_phase.len())
            .field("after_request", &self.after_request.len())
            .finish()
    }
}
