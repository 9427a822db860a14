//! Lifecycle log events
//!
//! Every decision the reconciler takes is reported as a [`LogEvent`], both
//! to `tracing` and to the optional `on_log` hook. Events borrow snapshots
//! taken outside the reconciler's lock.

use std::fmt;

/// What the reconciler decided, with the states it decided on
#[derive(Debug)]
pub enum LogContext<'a, S> {
    /// Current and target are equal, nothing to do
    NotRequired { current: &'a S, target: &'a S },
    /// A request moved the target away from the current state
    TargetAdded {
        previous_target: &'a S,
        target: &'a S,
        current: &'a S,
    },
    /// A run is in flight, the new target waits for it
    Busy { current: &'a S, target: &'a S },
    /// A run is being dispatched
    Reconciling { current: &'a S, target: &'a S },
    /// A run resolved
    Reconciled {
        current: &'a S,
        target: &'a S,
        result: &'a S,
    },
}

impl<S> LogContext<'_, S> {
    /// Untagged human-readable message
    pub fn text(&self) -> &'static str {
        match self {
            LogContext::NotRequired { .. } => "Reconcile not required - states are equal",
            LogContext::TargetAdded { .. } => "Target state added",
            LogContext::Busy { .. } => "Busy - skipping reconciliation",
            LogContext::Reconciling { .. } => "Reconciling",
            LogContext::Reconciled { .. } => "Reconciled",
        }
    }
}

/// A tagged lifecycle event
#[derive(Debug)]
pub struct LogEvent<'a, S> {
    pub label: &'a str,
    pub context: LogContext<'a, S>,
}

impl<S> LogEvent<'_, S> {
    /// Message tagged with the reconciler label, e.g. `AsyncReconciler: Reconciling`
    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl<S> fmt::Display for LogEvent<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.context.text())
    }
}
