// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Phase-synchronized job scheduler.
//!
//! Every handler in the engine is a sequence of phases separated by
//! [`PhaseSyncer::phase`] calls. [`phase_synced_settle`] runs a set of jobs
//! concurrently (cooperatively, inside one task) and guarantees that phase
//! *k* of every unsettled job completes before any job starts phase *k+1*:
//!
//! ```text
//!   job A ──phase1──┐            ┌──phase2──┐            ┌──done
//!   job B ──phase1──┤  barrier   ├──phase2──┤  barrier   ├──phase3──done
//!   job C ──phase1──┤  (hooks)   ├──✗ rejected           │
//!                   └────────────┘          └────────────┘
//! ```
//!
//! A job that fails leaves the wave without stopping its siblings. A job may
//! also be a nested set of jobs, which runs its own barrier sequence while the
//! parent wave waits for it to settle completely.

mod settle;
mod syncer;

pub use settle::{BeforePhaseFn, Job, JobFuture, SettleOptions, Settled, phase_synced_settle};
pub use syncer::PhaseSyncer;
