// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The barrier scheduler: drives a set of jobs one phase at a time.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use super::syncer::{Barrier, PhaseSyncer};
use crate::error::{Error, Result, SriError};
use crate::request::SriRequest;

/// Boxed future of one job.
pub type JobFuture<T> = BoxFuture<'static, Result<T>>;

type JobFn<T> = Box<dyn FnOnce(PhaseSyncer) -> JobFuture<T> + Send>;

/// Hook run once per wave, after every unsettled job parked and before any
/// of them is released. Receives the barrier number and the parked requests.
pub type BeforePhaseFn = Arc<
    dyn Fn(usize, Vec<Arc<SriRequest>>) -> BoxFuture<'static, std::result::Result<(), SriError>>
        + Send
        + Sync,
>;

/// One schedulable unit of work.
pub enum Job<T> {
    /// A phase-driven handler bound to its request.
    Task {
        /// Request the handler operates on.
        request: Arc<SriRequest>,
        /// The handler, started with its own [`PhaseSyncer`].
        run: Box<dyn FnOnce(PhaseSyncer) -> JobFuture<T> + Send>,
    },
    /// A sub-batch with its own barrier sequence.
    Nested(Vec<Job<T>>),
}

impl<T> Job<T> {
    /// Wrap an async handler as a job.
    pub fn task<F, Fut>(request: Arc<SriRequest>, handler: F) -> Self
    where
        F: FnOnce(PhaseSyncer) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let run: JobFn<T> = Box::new(move |syncer| Box::pin(handler(syncer)));
        Self::Task { request, run }
    }
}

impl<T> std::fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task { request, .. } => f
                .debug_struct("Task")
                .field("verb", &request.verb)
                .field("path", &request.path)
                .finish(),
            Self::Nested(jobs) => f.debug_tuple("Nested").field(jobs).finish(),
        }
    }
}

/// Outcome of one job.
#[derive(Debug)]
pub enum Settled<T> {
    /// The handler returned a value.
    Fulfilled(T),
    /// The handler (or a before-phase hook of its wave) failed.
    Rejected(Error),
    /// Outcomes of a nested job set, in their original order.
    Nested(Vec<Settled<T>>),
}

impl<T> Settled<T> {
    /// Whether this outcome (recursively) contains no rejection.
    pub fn is_fulfilled(&self) -> bool {
        match self {
            Self::Fulfilled(_) => true,
            Self::Rejected(_) => false,
            Self::Nested(children) => children.iter().all(Settled::is_fulfilled),
        }
    }
}

/// Options shared by a scheduler run and all of its nested runs.
#[derive(Clone, Default)]
pub struct SettleOptions {
    /// Hooks run in order at every barrier.
    pub before_phase: Vec<BeforePhaseFn>,
}

impl std::fmt::Debug for SettleOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettleOptions")
            .field("before_phase", &self.before_phase.len())
            .finish()
    }
}

/// Run `jobs` concurrently, phase-aligned, and collect every outcome.
///
/// Outcomes come back in the order of `jobs`, whatever the completion order.
/// A rejected job never aborts its siblings.
pub fn phase_synced_settle<T: Send + 'static>(
    jobs: Vec<Job<T>>,
    options: SettleOptions,
) -> BoxFuture<'static, Vec<Settled<T>>> {
    Box::pin(async move {
        let total = jobs.len();
        let barrier = Barrier::new();
        let mut running: FuturesUnordered<BoxFuture<'static, (usize, Settled<T>)>> =
            FuturesUnordered::new();

        for (idx, job) in jobs.into_iter().enumerate() {
            match job {
                Job::Task { request, run } => {
                    let handler = run(PhaseSyncer::new(idx, barrier.clone(), request));
                    running.push(Box::pin(async move {
                        let settled = match handler.await {
                            Ok(value) => Settled::Fulfilled(value),
                            Err(err) => Settled::Rejected(err),
                        };
                        (idx, settled)
                    }));
                }
                Job::Nested(children) => {
                    let nested = phase_synced_settle(children, options.clone());
                    running.push(Box::pin(async move { (idx, Settled::Nested(nested.await)) }));
                }
            }
        }

        let mut results: Vec<Option<Settled<T>>> =
            std::iter::repeat_with(|| None).take(total).collect();
        let mut unsettled = total;

        while unsettled > 0 {
            tokio::select! {
                Some((idx, settled)) = running.next() => {
                    debug!(job = idx, fulfilled = settled.is_fulfilled(), "Job settled");
                    results[idx] = Some(settled);
                    unsettled -= 1;
                }
                _ = barrier.arrivals() => {}
            }

            if let Some((phase, wave)) = barrier.ready_wave(unsettled) {
                let mut failure = None;
                for hook in &options.before_phase {
                    if let Err(err) = hook(phase, wave.clone()).await {
                        warn!(phase, status = err.status, "Before-phase hook rejected the wave");
                        failure = Some(err);
                        break;
                    }
                }
                debug!(phase, jobs = wave.len(), "Releasing barrier");
                barrier.release(failure);
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    Settled::Rejected(Error::Internal("job never settled".to_string()))
                })
            })
            .collect()
    })
}
