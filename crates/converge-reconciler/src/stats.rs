//! Reconciler counters

use std::fmt;

/// Running totals kept by a reconciler
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    /// `request_state` calls
    pub requests: u64,
    /// Requests whose merged target already equalled the current state
    pub noop_requests: u64,
    /// Requests that arrived while a run was in flight
    pub deferred_requests: u64,
    /// Reconcile calls started
    pub dispatches: u64,
    /// Reconcile calls that resolved with a state
    pub completions: u64,
    /// Reconcile calls that failed
    pub failures: u64,
    pub settles: u64,
}

impl ReconcilerStats {
    /// Dispatched calls that have not finished yet (0 or 1)
    pub fn in_flight(&self) -> u64 {
        self.dispatches - self.completions - self.failures
    }
}

/// Reconciler phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Reconciling,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Reconciling => write!(f, "reconciling"),
        }
    }
}
