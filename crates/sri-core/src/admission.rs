// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission control: refuse work before touching the database.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Decides whether a new request may start.
///
/// Returning `true` from [`can_accept`](Self::can_accept) reserves a slot,
/// which is handed back through [`release`](Self::release) when the request
/// ends.
pub trait AdmissionGate: Send + Sync {
    /// Try to reserve a slot.
    fn can_accept(&self) -> bool;

    /// Return a slot reserved by `can_accept`.
    fn release(&self) {}
}

/// Gate that admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenGate;

impl AdmissionGate for OpenGate {
    fn can_accept(&self) -> bool {
        true
    }
}

/// Caps the number of requests in flight.
#[derive(Debug)]
pub struct ConcurrencyGate {
    limit: usize,
    in_flight: AtomicUsize,
}

impl ConcurrencyGate {
    /// Gate admitting at most `limit` concurrent requests.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Requests currently admitted.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl AdmissionGate for ConcurrencyGate {
    fn can_accept(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// Releases an admitted slot on drop.
pub struct AdmissionPermit {
    gate: Arc<dyn AdmissionGate>,
}

impl AdmissionPermit {
    /// Ask `gate` for a slot.
    pub fn try_acquire(gate: &Arc<dyn AdmissionGate>) -> Option<Self> {
        gate.can_accept().then(|| Self { gate: gate.clone() })
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_gate_limits_and_releases() {
        let gate: Arc<dyn AdmissionGate> = Arc::new(ConcurrencyGate::new(2));

        let first = AdmissionPermit::try_acquire(&gate).unwrap();
        let _second = AdmissionPermit::try_acquire(&gate).unwrap();
        assert!(AdmissionPermit::try_acquire(&gate).is_none());

        drop(first);
        assert!(AdmissionPermit::try_acquire(&gate).is_some());
    }

    #[test]
    fn test_release_never_underflows() {
        let gate = ConcurrencyGate::new(1);
        gate.release();
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.can_accept());
        assert_eq!(gate.in_flight(), 1);
    }

    #[test]
    fn test_open_gate() {
        assert!(OpenGate.can_accept());
    }
}
