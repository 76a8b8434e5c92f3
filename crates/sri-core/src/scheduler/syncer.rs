// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Barrier primitive and the per-job [`PhaseSyncer`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::{Notify, watch};
use tracing::trace;

use crate::error::{Error, Result, SriError};
use crate::request::SriRequest;

/// Shared barrier for one set of jobs.
///
/// `released` is the number of barriers passed so far. A job parked at
/// barrier `released + 1` resumes once the controller bumps `released`.
pub(crate) struct Barrier {
    state: Mutex<WaveState>,
    arrivals: Notify,
    release: watch::Sender<usize>,
}

#[derive(Default)]
struct WaveState {
    released: usize,
    parked: BTreeMap<usize, Arc<SriRequest>>,
    failures: HashMap<usize, SriError>,
}

impl Barrier {
    pub(crate) fn new() -> Arc<Self> {
        let (release, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(WaveState::default()),
            arrivals: Notify::new(),
            release,
        })
    }

    fn lock(&self) -> MutexGuard<'_, WaveState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Park `job` at the next barrier and wake the controller.
    fn park(&self, job: usize, request: Arc<SriRequest>) -> usize {
        let target = {
            let mut state = self.lock();
            state.parked.insert(job, request);
            state.released + 1
        };
        self.arrivals.notify_one();
        target
    }

    fn failure(&self, phase: usize) -> Option<SriError> {
        self.lock().failures.get(&phase).cloned()
    }

    fn subscribe(&self) -> watch::Receiver<usize> {
        self.release.subscribe()
    }

    /// Resolves after at least one job parked since the last call.
    pub(crate) async fn arrivals(&self) {
        self.arrivals.notified().await
    }

    /// The wave is complete when every unsettled job is parked.
    ///
    /// Returns the barrier number and the parked requests in job order.
    pub(crate) fn ready_wave(&self, unsettled: usize) -> Option<(usize, Vec<Arc<SriRequest>>)> {
        let state = self.lock();
        if state.parked.is_empty() || state.parked.len() != unsettled {
            return None;
        }
        Some((state.released + 1, state.parked.values().cloned().collect()))
    }

    /// Release every parked job; with `failure`, each of them sees that error.
    pub(crate) fn release(&self, failure: Option<SriError>) {
        let released = {
            let mut state = self.lock();
            state.released += 1;
            state.parked.clear();
            if let Some(err) = failure {
                let phase = state.released;
                state.failures.insert(phase, err);
            }
            state.released
        };
        self.release.send_replace(released);
    }

    #[cfg(test)]
    pub(crate) fn released(&self) -> usize {
        self.lock().released
    }
}

/// Cooperative coordinator handed to one job.
///
/// Calling [`phase`](Self::phase) signals that the job finished its current
/// phase; it returns once every other unsettled job in the wave got there too
/// and the before-phase hooks ran.
pub struct PhaseSyncer {
    job: usize,
    phase: usize,
    barrier: Arc<Barrier>,
    token: watch::Receiver<usize>,
    request: Arc<SriRequest>,
    since: Instant,
}

impl PhaseSyncer {
    pub(crate) fn new(job: usize, barrier: Arc<Barrier>, request: Arc<SriRequest>) -> Self {
        let token = barrier.subscribe();
        Self {
            job,
            phase: 0,
            barrier,
            token,
            request,
            since: Instant::now(),
        }
    }

    /// Wait at the barrier for the rest of the wave.
    ///
    /// Fails with the hook's [`SriError`] when a before-phase hook rejected
    /// the wave this job was parked in, and with [`SriError::cancelled`] once
    /// the client went away.
    pub async fn phase(&mut self) -> Result<()> {
        self.request
            .timings()
            .record_since(format!("phase-{}", self.phase + 1), self.since);

        let target = self.barrier.park(self.job, self.request.clone());
        // Never more than one barrier ahead of the wave.
        debug_assert_eq!(target, self.phase + 1);
        trace!(job = self.job, phase = target, request = %self.request.id, "Parked at barrier");

        self.token
            .wait_for(|released| *released >= target)
            .await
            .map_err(|_| Error::Internal("phase barrier closed".to_string()))?;

        self.phase = target;
        self.since = Instant::now();

        if let Some(err) = self.barrier.failure(target) {
            return Err(err.into());
        }
        if self.request.is_cancelled() {
            trace!(job = self.job, phase = target, "Request cancelled, stopping");
            return Err(SriError::cancelled().into());
        }
        Ok(())
    }

    /// Number of barriers this job passed.
    pub fn current_phase(&self) -> usize {
        self.phase
    }

    /// Request of the job this syncer belongs to.
    pub fn request(&self) -> &Arc<SriRequest> {
        &self.request
    }
}

impl std::fmt::Debug for PhaseSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseSyncer")
            .field("job", &self.job)
            .field("phase", &self.phase)
            .field("request", &self.request.id)
            .finish()
    }
}
