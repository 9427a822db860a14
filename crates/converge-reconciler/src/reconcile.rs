//! Single-flight reconciliation loop
//!
//! A [`Reconciler`] owns two states: `current`, the last state a reconcile
//! call produced, and `target`, every requested partial update merged
//! together. Requests only ever touch `target`. At most one reconcile call
//! runs at a time; when it resolves the result becomes `current` and, if the
//! target has moved on in the meantime, the next call starts straight away
//! with the newest target. Intermediate targets are never reconciled.

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use converge_core::{ConfigError, Mergeable, ReconcileError, ReconcileResult};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::Level;

use crate::config::{EqualityFn, ErrorHook, LogHook, ReconcileFn, StateHook};
use crate::{LogContext, LogEvent, Phase, ReconcilerConfig, ReconcilerStats};

/// tracing target for lifecycle events
pub const LOG_TARGET: &str = "converge::reconciler";

/// Bookkeeping guarded by the reconciler lock
struct Shared<S> {
    current: S,
    target: S,
    busy: bool,
    stats: ReconcilerStats,
}

impl<S: Clone> Shared<S> {
    fn snapshot(&self) -> (S, S) {
        (self.current.clone(), self.target.clone())
    }
}

struct Inner<S: Mergeable> {
    label: String,
    runtime: Handle,
    states_are_equal: EqualityFn<S>,
    reconcile: ReconcileFn<S>,
    on_error: Option<ErrorHook>,
    on_state_update: Option<StateHook<S>>,
    on_settle: Option<StateHook<S>>,
    on_log: Option<LogHook<S>>,
    /// Never held across an await or while a hook runs
    shared: Mutex<Shared<S>>,
}

/// Handle to a coalescing reconciler
///
/// Cloning is cheap; all clones drive the same reconciler. Dropping every
/// handle does not cancel a reconcile call already in flight.
pub struct Reconciler<S: Mergeable> {
    inner: Arc<Inner<S>>,
}

impl<S: Mergeable> Reconciler<S> {
    /// Build a reconciler.
    ///
    /// Fails only when no runtime handle was configured and the caller is
    /// not inside a tokio runtime.
    pub fn new(config: ReconcilerConfig<S>) -> Result<Self, ConfigError> {
        let runtime = match config.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| ConfigError::NoRuntime)?,
        };

        let shared = Shared {
            current: config.initial_state.clone(),
            target: config.initial_state,
            busy: false,
            stats: ReconcilerStats::default(),
        };

        Ok(Reconciler {
            inner: Arc::new(Inner {
                label: config.label,
                runtime,
                states_are_equal: config.states_are_equal,
                reconcile: config.reconcile,
                on_error: config.on_error,
                on_state_update: config.on_state_update,
                on_settle: config.on_settle,
                on_log: config.on_log,
                shared: Mutex::new(shared),
            }),
        })
    }

    /// Ask the reconciler to move toward `partial` merged over the target.
    ///
    /// Starting at A and quickly requesting B, C, D and E before `A -> B`
    /// resolves runs `A -> B` then `B -> E`. C and D are never reconciled.
    ///
    /// Fire-and-forget: outcomes are reported through the configured hooks.
    /// The equality predicate and `Mergeable::merge` run under the
    /// reconciler lock and must not call back into it.
    pub fn request_state(&self, partial: S::Partial) {
        let inner = &self.inner;
        let logging = inner.logging();

        let mut shared = inner.shared.lock();
        shared.stats.requests += 1;
        let merged = shared.target.merge(partial);
        let previous_target = mem::replace(&mut shared.target, merged);

        if inner.is_settled(&shared) {
            shared.stats.noop_requests += 1;
            let snapshot = logging.then(|| shared.snapshot());
            drop(shared);
            if let Some((current, target)) = snapshot {
                inner.emit(LogContext::NotRequired {
                    current: &current,
                    target: &target,
                });
            }
            return;
        }

        let dispatch = !shared.busy;
        if dispatch {
            shared.busy = true;
            shared.stats.dispatches += 1;
        } else {
            shared.stats.deferred_requests += 1;
        }
        let snapshot = (dispatch || logging).then(|| shared.snapshot());
        drop(shared);

        let Some((current, target)) = snapshot else {
            return;
        };

        if !dispatch {
            inner.emit(LogContext::TargetAdded {
                previous_target: &previous_target,
                target: &target,
                current: &current,
            });
            // Picked up when the in-flight call resolves
            inner.emit(LogContext::Busy {
                current: &current,
                target: &target,
            });
            return;
        }

        // The run owns the busy flag now, so it starts even if a log hook panics
        let logged = panic::catch_unwind(AssertUnwindSafe(|| {
            inner.emit(LogContext::TargetAdded {
                previous_target: &previous_target,
                target: &target,
                current: &current,
            });
            inner.emit(LogContext::Reconciling {
                current: &current,
                target: &target,
            });
        }));
        inner.spawn_run(current, target);
        if let Err(payload) = logged {
            panic::resume_unwind(payload);
        }
    }

    /// Last state produced by a reconcile call, or the initial state
    pub fn current_state(&self) -> S {
        self.inner.shared.lock().current.clone()
    }

    /// Accumulated requested state
    pub fn target_state(&self) -> S {
        self.inner.shared.lock().target.clone()
    }

    pub fn phase(&self) -> Phase {
        if self.is_busy() {
            Phase::Reconciling
        } else {
            Phase::Idle
        }
    }

    /// True while a reconcile call is in flight
    pub fn is_busy(&self) -> bool {
        self.inner.shared.lock().busy
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.inner.shared.lock().stats.clone()
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

impl<S: Mergeable> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Reconciler {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Mergeable> fmt::Debug for Reconciler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("label", &self.inner.label)
            .field("phase", &self.phase())
            .finish()
    }
}

impl<S: Mergeable> Inner<S> {
    /// Whether anyone will look at log snapshots
    fn logging(&self) -> bool {
        self.on_log.is_some() || tracing::enabled!(target: LOG_TARGET, Level::DEBUG)
    }

    fn emit(&self, context: LogContext<'_, S>) {
        let event = LogEvent {
            label: &self.label,
            context,
        };
        tracing::debug!(
            target: LOG_TARGET,
            label = %self.label,
            context = ?event.context,
            "{}",
            event.context.text()
        );
        if let Some(hook) = &self.on_log {
            hook(&event);
        }
    }

    fn is_settled(&self, shared: &Shared<S>) -> bool {
        (self.states_are_equal)(&shared.current, &shared.target)
    }

    fn spawn_run(self: &Arc<Self>, current: S, target: S) {
        let inner = Arc::clone(self);
        self.runtime.spawn(inner.run(current, target));
    }

    /// Drive reconcile calls until settled or failed
    async fn run(self: Arc<Self>, mut current: S, mut target: S) {
        loop {
            let next = match self.call(current.clone(), target.clone()).await {
                Ok(result) => self.complete_guarded(&current, &target, result),
                Err(err) => {
                    self.fail(err, true);
                    None
                }
            };

            let Some((next_current, next_target)) = next else {
                return;
            };
            current = next_current;
            target = next_target;
        }
    }

    /// Run the caller's reconcile function in its own task so a panic
    /// surfaces as a failure instead of wedging the reconciler busy.
    async fn call(&self, current: S, target: S) -> ReconcileResult<S> {
        let reconcile = Arc::clone(&self.reconcile);
        let task = self
            .runtime
            .spawn(async move { reconcile(current, target).await });

        match task.await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(err)) => Err(ReconcileError::rejected(err)),
            Err(_) => Err(ReconcileError::abnormal(&self.label)),
        }
    }

    /// `complete` runs caller hooks and the equality predicate. A panic in
    /// any of them is reported like a failed call and never leaves the
    /// reconciler busy.
    fn complete_guarded(&self, current: &S, target: &S, result: S) -> Option<(S, S)> {
        let mut holds_busy = true;
        let completed = panic::catch_unwind(AssertUnwindSafe(|| {
            self.complete(current, target, result, &mut holds_busy)
        }));

        completed.unwrap_or_else(|_| {
            self.fail(ReconcileError::abnormal(&self.label), holds_busy);
            None
        })
    }

    /// Apply a resolved call. Returns the arguments of the next call when the
    /// target moved while this one was in flight.
    ///
    /// `holds_busy` tracks whether this run still owns the busy flag, since a
    /// request made from `on_settle` may already have started another run.
    fn complete(&self, current: &S, target: &S, result: S, holds_busy: &mut bool) -> Option<(S, S)> {
        self.emit(LogContext::Reconciled {
            current,
            target,
            result: &result,
        });

        {
            let mut shared = self.shared.lock();
            shared.current = result.clone();
            shared.stats.completions += 1;
        }

        // Still busy here, so requests made from the hook are deferred and
        // picked up by the check below.
        if let Some(hook) = &self.on_state_update {
            hook(&result);
        }

        let mut shared = self.shared.lock();
        shared.busy = false;
        *holds_busy = false;

        if self.is_settled(&shared) {
            shared.stats.settles += 1;
            let (settled, target) = shared.snapshot();
            drop(shared);

            self.emit(LogContext::NotRequired {
                current: &settled,
                target: &target,
            });
            if let Some(hook) = &self.on_settle {
                hook(&settled);
            }
            return None;
        }

        shared.busy = true;
        *holds_busy = true;
        shared.stats.dispatches += 1;
        let (current, target) = shared.snapshot();
        drop(shared);

        self.emit(LogContext::Reconciling {
            current: &current,
            target: &target,
        });
        Some((current, target))
    }

    /// A failed call leaves `current` untouched and does not re-dispatch
    fn fail(&self, err: ReconcileError, release_busy: bool) {
        {
            let mut shared = self.shared.lock();
            if release_busy {
                shared.busy = false;
            }
            shared.stats.failures += 1;
        }

        tracing::debug!(target: LOG_TARGET, label = %self.label, error = %err, "Reconcile failed");
        if let Some(hook) = &self.on_error {
            hook(&err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::future::{ready, Ready};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;
    use std::time::Duration;

    use converge_core::{BoxError, FieldMap};
    use proptest::prelude::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    use crate::ReconcileFuture;

    #[derive(Clone, Debug, PartialEq)]
    struct Gauge {
        value: i32,
    }

    #[derive(Debug, Default)]
    struct GaugePatch {
        value: Option<i32>,
    }

    impl Mergeable for Gauge {
        type Partial = GaugePatch;

        fn merge(&self, partial: GaugePatch) -> Self {
            Gauge {
                value: partial.value.unwrap_or(self.value),
            }
        }
    }

    fn gauge(value: i32) -> Gauge {
        Gauge { value }
    }

    fn set(value: i32) -> GaugePatch {
        GaugePatch { value: Some(value) }
    }

    fn same(a: &Gauge, b: &Gauge) -> bool {
        a.value == b.value
    }

    type Calls<S> = Arc<Mutex<Vec<(S, S)>>>;

    fn calls<S>() -> Calls<S> {
        Arc::new(Mutex::new(Vec::new()))
    }

    /// Records its arguments and resolves immediately with the target
    fn passthrough<S: Mergeable>(
        calls: &Calls<S>,
    ) -> impl Fn(S, S) -> Ready<Result<S, BoxError>> + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move |current, next| {
            calls.lock().push((current, next.clone()));
            ready(Ok(next))
        }
    }

    /// Records its arguments and resolves with the target once a permit is released
    fn gated<S: Mergeable>(
        calls: &Calls<S>,
        gate: &Arc<Semaphore>,
    ) -> impl Fn(S, S) -> ReconcileFuture<S> + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        let gate = Arc::clone(gate);
        move |current: S, next: S| -> ReconcileFuture<S> {
            calls.lock().push((current, next.clone()));
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                gate.acquire().await?.forget();
                Ok::<_, BoxError>(next)
            })
        }
    }

    fn channel_hook<T: Clone + Send + 'static>(
    ) -> (impl Fn(&T) + Send + Sync + 'static, UnboundedReceiver<T>) {
        let (tx, rx) = unbounded_channel();
        (
            move |value: &T| {
                let _ = tx.send(value.clone());
            },
            rx,
        )
    }

    async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for hook")
            .expect("hook channel closed")
    }

    async fn wait_for_calls<S>(calls: &Calls<S>, count: usize) {
        timeout(Duration::from_secs(5), async {
            while calls.lock().len() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("timed out waiting for reconcile calls");
    }

    async fn let_tasks_run() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    fn values(calls: &Calls<Gauge>) -> Vec<(i32, i32)> {
        calls
            .lock()
            .iter()
            .map(|(current, next)| (current.value, next.value))
            .collect()
    }

    #[tokio::test]
    async fn test_coalesces_rapid_requests() {
        let calls = calls();
        let (on_settle, mut settled) = channel_hook();
        let (on_update, mut updates) = channel_hook();
        let config = ReconcilerConfig::new(gauge(1), same, passthrough(&calls))
            .on_settle(on_settle)
            .on_state_update(on_update);
        let reconciler = Reconciler::new(config).unwrap();

        for value in 2..=7 {
            reconciler.request_state(set(value));
        }

        assert_eq!(recv(&mut settled).await, gauge(7));
        // 1 -> 2 was dispatched before the rest arrived, 2 -> 7 picks up the latest
        assert_eq!(values(&calls), vec![(1, 2), (2, 7)]);
        assert_eq!(recv(&mut updates).await, gauge(2));
        assert_eq!(recv(&mut updates).await, gauge(7));

        let_tasks_run().await;
        assert!(settled.try_recv().is_err());
        assert!(updates.try_recv().is_err());

        let stats = reconciler.stats();
        assert_eq!(stats.requests, 6);
        assert_eq!(stats.deferred_requests, 5);
        assert_eq!(stats.dispatches, 2);
        assert_eq!(stats.completions, 2);
        assert_eq!(stats.settles, 1);
        assert_eq!(stats.in_flight(), 0);
        assert_eq!(reconciler.current_state(), gauge(7));
        assert_eq!(reconciler.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_noop_request_while_idle_does_nothing() {
        let calls = calls();
        let (on_settle, mut settled) = channel_hook();
        let (on_update, mut updates) = channel_hook();
        let config = ReconcilerConfig::new(gauge(1), same, passthrough(&calls))
            .on_settle(on_settle)
            .on_state_update(on_update);
        let reconciler = Reconciler::new(config).unwrap();

        reconciler.request_state(set(1));
        reconciler.request_state(GaugePatch::default());
        let_tasks_run().await;

        assert!(calls.lock().is_empty());
        assert!(settled.try_recv().is_err());
        assert!(updates.try_recv().is_err());
        assert_eq!(reconciler.phase(), Phase::Idle);
        assert_eq!(reconciler.stats().noop_requests, 2);
        assert_eq!(reconciler.stats().dispatches, 0);
    }

    #[tokio::test]
    async fn test_settled_reconciler_ignores_repeated_noops() {
        let calls = calls();
        let (on_settle, mut settled) = channel_hook();
        let (on_update, mut updates) = channel_hook();
        let config = ReconcilerConfig::new(gauge(0), same, passthrough(&calls))
            .on_settle(on_settle)
            .on_state_update(on_update);
        let reconciler = Reconciler::new(config).unwrap();

        reconciler.request_state(set(3));
        assert_eq!(recv(&mut settled).await, gauge(3));
        assert_eq!(recv(&mut updates).await, gauge(3));

        for _ in 0..3 {
            reconciler.request_state(set(3));
        }
        let_tasks_run().await;

        assert_eq!(calls.lock().len(), 1);
        assert!(settled.try_recv().is_err());
        assert!(updates.try_recv().is_err());
        assert_eq!(reconciler.stats().noop_requests, 3);
    }

    #[tokio::test]
    async fn test_requests_while_busy_merge_into_one_call() {
        type Record = FieldMap<&'static str, i32>;

        let calls = calls();
        let gate = Arc::new(Semaphore::new(0));
        let (on_settle, mut settled) = channel_hook();
        let config = ReconcilerConfig::new(
            Record::new().with("a", 0),
            |a: &Record, b: &Record| a == b,
            gated(&calls, &gate),
        )
        .on_settle(on_settle);
        let reconciler = Reconciler::new(config).unwrap();

        reconciler.request_state(Record::new().with("z", 1));
        wait_for_calls(&calls, 1).await;
        assert_eq!(reconciler.phase(), Phase::Reconciling);

        reconciler.request_state(Record::new().with("x", 1));
        reconciler.request_state(Record::new().with("y", 2));

        let expected = Record::new()
            .with("a", 0)
            .with("z", 1)
            .with("x", 1)
            .with("y", 2);
        assert_eq!(reconciler.target_state(), expected);
        assert_eq!(reconciler.stats().deferred_requests, 2);

        gate.add_permits(2);
        assert_eq!(recv(&mut settled).await, expected);

        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, Record::new().with("a", 0).with("z", 1));
        assert_eq!(calls[1].0, Record::new().with("a", 0).with("z", 1));
        assert_eq!(calls[1].1, expected);
    }

    #[tokio::test]
    async fn test_partial_progress_redispatches_until_converged() {
        let calls = calls();
        let (on_settle, mut settled) = channel_hook();
        let (on_update, mut updates) = channel_hook();
        let step = {
            let calls = Arc::clone(&calls);
            move |current: Gauge, next: Gauge| {
                calls.lock().push((current.clone(), next.clone()));
                let reached = current.value + (next.value - current.value).clamp(-2, 2);
                ready(Ok::<_, BoxError>(gauge(reached)))
            }
        };
        let config = ReconcilerConfig::new(gauge(1), same, step)
            .on_settle(on_settle)
            .on_state_update(on_update);
        let reconciler = Reconciler::new(config).unwrap();

        reconciler.request_state(set(7));

        assert_eq!(recv(&mut settled).await, gauge(7));
        assert_eq!(values(&calls), vec![(1, 7), (3, 7), (5, 7)]);
        for expected in [3, 5, 7] {
            assert_eq!(recv(&mut updates).await, gauge(expected));
        }
    }

    #[tokio::test]
    async fn test_failure_keeps_current_and_returns_to_idle() {
        let calls = calls();
        let (on_settle, mut settled) = channel_hook();
        let (on_update, mut updates) = channel_hook();
        let (on_error, mut errors) = channel_hook::<String>();
        let reconcile = {
            let calls = Arc::clone(&calls);
            move |current: Gauge, next: Gauge| {
                calls.lock().push((current, next.clone()));
                if next.value < 0 {
                    ready(Err("negative gauge"))
                } else {
                    ready(Ok(next))
                }
            }
        };
        let config = ReconcilerConfig::new(gauge(1), same, reconcile)
            .on_settle(on_settle)
            .on_state_update(on_update)
            .on_error(move |err| on_error(&err.to_string()));
        let reconciler = Reconciler::new(config).unwrap();

        reconciler.request_state(set(-5));
        assert_eq!(recv(&mut errors).await, "Reconcile rejected: negative gauge");
        let_tasks_run().await;

        assert_eq!(reconciler.current_state(), gauge(1));
        assert_eq!(reconciler.phase(), Phase::Idle);
        assert!(settled.try_recv().is_err());
        assert!(updates.try_recv().is_err());
        assert_eq!(reconciler.stats().failures, 1);

        // A later request dispatches again
        reconciler.request_state(set(4));
        assert_eq!(recv(&mut settled).await, gauge(4));
        assert_eq!(values(&calls), vec![(1, -5), (1, 4)]);
    }

    #[tokio::test]
    async fn test_failure_does_not_resume_convergence() {
        let calls = calls();
        let gate = Arc::new(Semaphore::new(0));
        let (on_settle, mut settled) = channel_hook();
        let (on_error, mut errors) = channel_hook::<String>();
        let reconcile = {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            move |current: Gauge, next: Gauge| -> ReconcileFuture<Gauge> {
                calls.lock().push((current, next.clone()));
                let gate = Arc::clone(&gate);
                Box::pin(async move {
                    gate.acquire().await?.forget();
                    if next.value == 2 {
                        return Err("two is unreachable".into());
                    }
                    Ok::<_, BoxError>(next)
                })
            }
        };
        let config = ReconcilerConfig::new(gauge(1), same, reconcile)
            .on_settle(on_settle)
            .on_error(move |err| on_error(&err.to_string()));
        let reconciler = Reconciler::new(config).unwrap();

        reconciler.request_state(set(2));
        wait_for_calls(&calls, 1).await;
        reconciler.request_state(set(3));

        gate.add_permits(1);
        recv(&mut errors).await;
        let_tasks_run().await;

        // Target still differs, but nothing is dispatched until asked
        assert_eq!(values(&calls), vec![(1, 2)]);
        assert_eq!(reconciler.current_state(), gauge(1));
        assert_eq!(reconciler.target_state(), gauge(3));
        assert_eq!(reconciler.phase(), Phase::Idle);
        assert!(settled.try_recv().is_err());

        gate.add_permits(1);
        reconciler.request_state(set(3));
        assert_eq!(recv(&mut settled).await, gauge(3));
        assert_eq!(values(&calls), vec![(1, 2), (1, 3)]);
    }

    #[tokio::test]
    async fn test_panicking_reconcile_reports_abnormal_failure() {
        let (on_error, mut errors) = channel_hook::<bool>();
        let reconcile = |_: Gauge, next: Gauge| async move {
            if next.value > 0 {
                panic!("reconcile exploded");
            }
            Ok::<_, BoxError>(next)
        };
        let config = ReconcilerConfig::new(gauge(0), same, reconcile)
            .on_error(move |err| on_error(&err.is_abnormal()));
        let reconciler = Reconciler::new(config).unwrap();

        reconciler.request_state(set(1));

        assert!(recv(&mut errors).await);
        assert_eq!(reconciler.current_state(), gauge(0));
        assert_eq!(reconciler.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_panicking_update_hook_fails_the_run_and_releases_busy() {
        let calls = calls();
        let (on_settle, mut settled) = channel_hook();
        let (on_error, mut errors) = channel_hook::<String>();
        let config = ReconcilerConfig::new(gauge(0), same, passthrough(&calls))
            .on_state_update(|state: &Gauge| {
                if state.value == 1 {
                    panic!("update hook exploded");
                }
            })
            .on_settle(on_settle)
            .on_error(move |err| on_error(&err.to_string()));
        let reconciler = Reconciler::new(config).unwrap();

        reconciler.request_state(set(1));

        assert_eq!(
            recv(&mut errors).await,
            "AsyncReconciler: Reconcile function caused an error"
        );
        assert!(!reconciler.is_busy());
        // The call itself resolved, so its result stands
        assert_eq!(reconciler.current_state(), gauge(1));
        assert_eq!(reconciler.stats().failures, 1);
        assert!(settled.try_recv().is_err());

        reconciler.request_state(set(5));
        assert_eq!(recv(&mut settled).await, gauge(5));
        assert_eq!(values(&calls), vec![(0, 1), (1, 5)]);
        assert_eq!(reconciler.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_panicking_settle_hook_is_reported() {
        let calls = calls();
        let (on_error, mut errors) = channel_hook::<bool>();
        let config = ReconcilerConfig::new(gauge(0), same, passthrough(&calls))
            .label("Gauge")
            .on_settle(|state: &Gauge| {
                if state.value == 2 {
                    panic!("settle hook exploded");
                }
            })
            .on_error(move |err| on_error(&err.is_abnormal()));
        let reconciler = Reconciler::new(config).unwrap();

        reconciler.request_state(set(2));
        assert!(recv(&mut errors).await);
        assert!(!reconciler.is_busy());

        reconciler.request_state(set(3));
        wait_for_calls(&calls, 2).await;
        let_tasks_run().await;
        assert_eq!(reconciler.current_state(), gauge(3));
        assert!(!reconciler.is_busy());
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_error_hook_swallows_failures() {
        let reconcile = |_: Gauge, _: Gauge| ready(Err::<Gauge, _>("always fails"));
        let reconciler = Reconciler::new(ReconcilerConfig::new(gauge(0), same, reconcile)).unwrap();

        reconciler.request_state(set(1));
        let_tasks_run().await;

        assert_eq!(reconciler.stats().failures, 1);
        assert_eq!(reconciler.current_state(), gauge(0));
        assert!(!reconciler.is_busy());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_across_threads() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (on_settle, mut settled) = channel_hook();
        let reconcile = {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            move |_: Gauge, next: Gauge| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(next)
                }
            }
        };
        let config = ReconcilerConfig::new(gauge(0), same, reconcile).on_settle(on_settle);
        let reconciler = Reconciler::new(config).unwrap();

        let mut workers = Vec::new();
        for worker in 0..4 {
            let reconciler = reconciler.clone();
            workers.push(tokio::spawn(async move {
                for i in 1..=25 {
                    reconciler.request_state(set(worker * 100 + i));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        let last = reconciler.target_state();
        while recv(&mut settled).await != last {}

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(reconciler.current_state(), last);
        let stats = reconciler.stats();
        assert_eq!(stats.requests, 100);
        assert_eq!(stats.in_flight(), 0);
        assert!(stats.dispatches < 100);
    }

    #[tokio::test]
    async fn test_hooks_may_request_state() {
        let calls = calls();
        let handle: Arc<OnceLock<Reconciler<Gauge>>> = Arc::new(OnceLock::new());
        let (on_settle, mut settled) = channel_hook();
        let on_update = {
            let handle = Arc::clone(&handle);
            move |state: &Gauge| {
                if state.value == 1 {
                    if let Some(reconciler) = handle.get() {
                        reconciler.request_state(set(10));
                    }
                }
            }
        };
        let config = ReconcilerConfig::new(gauge(0), same, passthrough(&calls))
            .on_state_update(on_update)
            .on_settle(on_settle);
        let reconciler = Reconciler::new(config).unwrap();
        let _ = handle.set(reconciler.clone());

        reconciler.request_state(set(1));

        assert_eq!(recv(&mut settled).await, gauge(10));
        assert_eq!(values(&calls), vec![(0, 1), (1, 10)]);
        let_tasks_run().await;
        assert!(settled.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_log_hook_reports_each_decision() {
        let calls = calls();
        let gate = Arc::new(Semaphore::new(0));
        let messages = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&messages);
        let (on_settle, mut settled) = channel_hook();
        let config = ReconcilerConfig::new(gauge(1), same, gated(&calls, &gate))
            .label("Gauge")
            .on_settle(on_settle)
            .on_log(move |event| sink.lock().push(event.message()));
        let reconciler = Reconciler::new(config).unwrap();
        assert_eq!(reconciler.label(), "Gauge");

        reconciler.request_state(set(1));
        reconciler.request_state(set(2));
        wait_for_calls(&calls, 1).await;
        reconciler.request_state(set(3));
        gate.add_permits(2);
        recv(&mut settled).await;

        let expected = [
            "Reconcile not required - states are equal",
            "Target state added",
            "Reconciling",
            "Target state added",
            "Busy - skipping reconciliation",
            "Reconciled",
            "Reconciling",
            "Reconciled",
            "Reconcile not required - states are equal",
        ]
        .map(|text| format!("Gauge: {}", text));
        assert_eq!(*messages.lock(), expected);
    }

    #[tokio::test]
    async fn test_dispatch_logs_reconciling_before_later_requests() {
        let calls = calls();
        let messages = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&messages);
        let (on_settle, mut settled) = channel_hook();
        let config = ReconcilerConfig::new(gauge(1), same, passthrough(&calls))
            .on_settle(on_settle)
            .on_log(move |event| sink.lock().push(event.context.text().to_string()));
        let reconciler = Reconciler::new(config).unwrap();

        // No await between the two requests
        reconciler.request_state(set(2));
        reconciler.request_state(set(3));
        assert_eq!(recv(&mut settled).await, gauge(3));

        let expected = [
            "Target state added",
            "Reconciling",
            "Target state added",
            "Busy - skipping reconciliation",
            "Reconciled",
            "Reconciling",
            "Reconciled",
            "Reconcile not required - states are equal",
        ];
        assert_eq!(*messages.lock(), expected);
        assert_eq!(values(&calls), vec![(1, 2), (2, 3)]);
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let calls = calls();
        let config = ReconcilerConfig::new(gauge(0), same, passthrough(&calls));
        assert!(matches!(
            Reconciler::new(config),
            Err(ConfigError::NoRuntime)
        ));
    }

    #[test]
    fn test_explicit_runtime_handle() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let calls = calls();
        let (on_settle, mut settled) = channel_hook();
        let config = ReconcilerConfig::new(gauge(0), same, passthrough(&calls))
            .runtime(runtime.handle().clone())
            .on_settle(on_settle);
        let reconciler = Reconciler::new(config).unwrap();

        reconciler.request_state(set(4));
        assert_eq!(reconciler.phase(), Phase::Reconciling);

        let state = runtime.block_on(recv(&mut settled));
        assert_eq!(state, gauge(4));
        assert_eq!(values(&calls), vec![(0, 4)]);
    }

    proptest! {
        #[test]
        fn prop_synchronous_bursts_converge_in_at_most_two_calls(
            requests in proptest::collection::vec(-3i32..=3, 0..12)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let calls = calls();
            let (on_settle, mut settled) = channel_hook();
            let config = ReconcilerConfig::new(gauge(0), same, passthrough(&calls))
                .on_settle(on_settle);
            let reconciler = runtime.block_on(async { Reconciler::new(config) }).unwrap();

            for value in &requests {
                reconciler.request_state(set(*value));
            }

            let first = requests.iter().copied().find(|v| *v != 0);
            let last = requests.last().copied().unwrap_or(0);

            match first {
                None => {
                    runtime.block_on(let_tasks_run());
                    prop_assert!(calls.lock().is_empty());
                    prop_assert!(settled.try_recv().is_err());
                }
                Some(first) => {
                    let state = runtime.block_on(recv(&mut settled));
                    prop_assert_eq!(state, gauge(last));
                    runtime.block_on(let_tasks_run());
                    prop_assert!(settled.try_recv().is_err());

                    // Only the first dispatched target and the final one are ever seen
                    let allowed: HashSet<i32> = [0, first, last].into_iter().collect();
                    let seen = values(&calls);
                    prop_assert!(seen.len() <= 2);
                    prop_assert_eq!(seen[0], (0, first));
                    for (current, next) in seen {
                        prop_assert!(allowed.contains(&current));
                        prop_assert!(allowed.contains(&next));
                    }
                }
            }
            prop_assert_eq!(reconciler.current_state(), gauge(last));
        }
    }
}
