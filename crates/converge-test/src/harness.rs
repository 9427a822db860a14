//! Test doubles for driving a reconciler
//!
//! - `GatedReconcile`: a reconcile function whose calls are recorded and
//!   held until the test releases them
//! - `Probe`: records every hook invocation and lets tests wait on them

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use converge_reconciler::{BoxError, ConfigError, Mergeable, ReconcileFuture, ReconcilerConfig};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::time::timeout;

/// Default wait limit for harness helpers
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Harness failures
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Reconciler setup failed: {0}")]
    Config(#[from] ConfigError),
}

/// Decides how a gated call resolves given (current, next)
type Outcome<S> = Arc<dyn Fn(&S, &S) -> Result<S, String> + Send + Sync>;

/// One recorded reconcile invocation
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileCall<S> {
    pub current: S,
    pub next: S,
}

struct GateShared<S> {
    calls: Mutex<Vec<ReconcileCall<S>>>,
    gate: Semaphore,
    open: AtomicBool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    called: Notify,
}

/// Reconcile double that holds every call until released
pub struct GatedReconcile<S> {
    shared: Arc<GateShared<S>>,
    outcome: Outcome<S>,
}

impl<S: Mergeable> GatedReconcile<S> {
    /// Closed gate: every call waits for `release`
    pub fn new() -> Self {
        GatedReconcile {
            shared: Arc::new(GateShared {
                calls: Mutex::new(Vec::new()),
                gate: Semaphore::new(0),
                open: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                called: Notify::new(),
            }),
            outcome: Arc::new(|_: &S, next: &S| Ok(next.clone())),
        }
    }

    /// Open gate: calls resolve as soon as they are polled
    pub fn open() -> Self {
        let gated = Self::new();
        gated.shared.open.store(true, Ordering::SeqCst);
        gated
    }

    /// Replace the default outcome (resolve with `next`)
    pub fn with_outcome(
        mut self,
        outcome: impl Fn(&S, &S) -> Result<S, String> + Send + Sync + 'static,
    ) -> Self {
        self.outcome = Arc::new(outcome);
        self
    }

    /// The reconcile function to hand to `ReconcilerConfig::new`
    pub fn reconcile_fn(&self) -> impl Fn(S, S) -> ReconcileFuture<S> + Send + Sync + 'static {
        let shared = Arc::clone(&self.shared);
        let outcome = Arc::clone(&self.outcome);
        move |current: S, next: S| -> ReconcileFuture<S> {
            let shared = Arc::clone(&shared);
            let outcome = Arc::clone(&outcome);
            Box::pin(async move {
                let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                shared.peak_in_flight.fetch_max(now, Ordering::SeqCst);
                shared.calls.lock().push(ReconcileCall {
                    current: current.clone(),
                    next: next.clone(),
                });
                shared.called.notify_waiters();

                if !shared.open.load(Ordering::SeqCst) {
                    shared.gate.acquire().await?.forget();
                }

                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                outcome(&current, &next).map_err(BoxError::from)
            })
        }
    }

    /// Let `count` held calls resolve
    pub fn release(&self, count: usize) {
        self.shared.gate.add_permits(count);
    }

    /// Stop holding calls from now on
    pub fn open_gate(&self) {
        self.shared.open.store(true, Ordering::SeqCst);
        // Every call still parked at the gate has already been recorded
        self.shared.gate.add_permits(self.call_count());
    }

    pub fn calls(&self) -> Vec<ReconcileCall<S>> {
        self.shared.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.shared.calls.lock().len()
    }

    /// Most calls observed running at once
    pub fn peak_in_flight(&self) -> usize {
        self.shared.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` calls have started
    pub async fn wait_for_calls(&self, count: usize) -> Result<(), HarnessError> {
        timeout(DEFAULT_WAIT, async {
            loop {
                let called = self.shared.called.notified();
                if self.call_count() >= count {
                    return;
                }
                called.await;
            }
        })
        .await
        .map_err(|_| HarnessError::Timeout(DEFAULT_WAIT))
    }
}

impl<S: Mergeable> Default for GatedReconcile<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a probe has seen so far
#[derive(Clone, Debug)]
pub struct ProbeRecord<S> {
    pub state_updates: Vec<S>,
    pub settles: Vec<S>,
    pub errors: Vec<String>,
    pub log_messages: Vec<String>,
}

impl<S> Default for ProbeRecord<S> {
    fn default() -> Self {
        ProbeRecord {
            state_updates: Vec::new(),
            settles: Vec::new(),
            errors: Vec::new(),
            log_messages: Vec::new(),
        }
    }
}

/// Hook recorder
pub struct Probe<S> {
    record: Arc<Mutex<ProbeRecord<S>>>,
    changed: Arc<Notify>,
}

impl<S: Mergeable> Probe<S> {
    pub fn new() -> Self {
        Probe {
            record: Arc::new(Mutex::new(ProbeRecord::default())),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Install recording hooks on a configuration
    pub fn attach(&self, config: ReconcilerConfig<S>) -> ReconcilerConfig<S> {
        let (settle_record, settle_changed) = (Arc::clone(&self.record), Arc::clone(&self.changed));
        let (update_record, update_changed) = (Arc::clone(&self.record), Arc::clone(&self.changed));
        let (error_record, error_changed) = (Arc::clone(&self.record), Arc::clone(&self.changed));
        let log_record = Arc::clone(&self.record);

        config
            .on_settle(move |state| {
                settle_record.lock().settles.push(state.clone());
                settle_changed.notify_waiters();
            })
            .on_state_update(move |state| {
                update_record.lock().state_updates.push(state.clone());
                update_changed.notify_waiters();
            })
            .on_error(move |err| {
                error_record.lock().errors.push(err.to_string());
                error_changed.notify_waiters();
            })
            .on_log(move |event| log_record.lock().log_messages.push(event.message()))
    }

    pub fn snapshot(&self) -> ProbeRecord<S> {
        self.record.lock().clone()
    }

    pub fn settles(&self) -> Vec<S> {
        self.record.lock().settles.clone()
    }

    pub fn state_updates(&self) -> Vec<S> {
        self.record.lock().state_updates.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.record.lock().errors.clone()
    }

    /// Wait until `done` holds for the record
    pub async fn wait_until(
        &self,
        done: impl Fn(&ProbeRecord<S>) -> bool,
    ) -> Result<(), HarnessError> {
        timeout(DEFAULT_WAIT, async {
            loop {
                let changed = self.changed.notified();
                if done(&*self.record.lock()) {
                    return;
                }
                changed.await;
            }
        })
        .await
        .map_err(|_| HarnessError::Timeout(DEFAULT_WAIT))
    }

    /// Wait for the `count`-th settle and return it
    pub async fn wait_for_settle(&self, count: usize) -> Result<S, HarnessError> {
        self.wait_until(|record| record.settles.len() >= count)
            .await?;
        Ok(self.record.lock().settles[count - 1].clone())
    }

    /// Wait for the `count`-th error and return its message
    pub async fn wait_for_error(&self, count: usize) -> Result<String, HarnessError> {
        self.wait_until(|record| record.errors.len() >= count)
            .await?;
        Ok(self.record.lock().errors[count - 1].clone())
    }
}

impl<S: Mergeable> Default for Probe<S> {
    fn default() -> Self {
        Self::new()
    }
}
