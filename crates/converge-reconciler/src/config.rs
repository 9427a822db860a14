//! Reconciler configuration

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use converge_core::{BoxError, Mergeable, ReconcileError};
use tokio::runtime::Handle;

use crate::LogEvent;

/// Default tag prefixed to every log message
pub const DEFAULT_LABEL: &str = "AsyncReconciler";

/// Boxed future returned by a reconcile call
pub type ReconcileFuture<S> = Pin<Box<dyn Future<Output = Result<S, BoxError>> + Send>>;

pub(crate) type EqualityFn<S> = Arc<dyn Fn(&S, &S) -> bool + Send + Sync>;
pub(crate) type ReconcileFn<S> = Arc<dyn Fn(S, S) -> ReconcileFuture<S> + Send + Sync>;
pub(crate) type ErrorHook = Arc<dyn Fn(&ReconcileError) + Send + Sync>;
pub(crate) type StateHook<S> = Arc<dyn Fn(&S) + Send + Sync>;
pub(crate) type LogHook<S> = Arc<dyn for<'a> Fn(&LogEvent<'a, S>) + Send + Sync>;

/// Reconciler configuration
///
/// The initial state, the equality predicate and the reconcile function are
/// required and passed to [`ReconcilerConfig::new`]. Hooks are optional and
/// default to no-ops.
///
/// Without an `on_error` hook failed runs are dropped silently. Install one
/// if failures need to be visible.
pub struct ReconcilerConfig<S: Mergeable> {
    pub(crate) initial_state: S,
    pub(crate) states_are_equal: EqualityFn<S>,
    pub(crate) reconcile: ReconcileFn<S>,
    pub(crate) on_error: Option<ErrorHook>,
    pub(crate) on_state_update: Option<StateHook<S>>,
    pub(crate) on_settle: Option<StateHook<S>>,
    pub(crate) on_log: Option<LogHook<S>>,
    pub(crate) label: String,
    pub(crate) runtime: Option<Handle>,
}

impl<S: Mergeable> ReconcilerConfig<S> {
    /// Create a configuration from the required parts.
    ///
    /// `states_are_equal` must be an equivalence relation over full states.
    /// Do not compare by identity (`Arc::ptr_eq` and friends): merged targets
    /// are always freshly built values, so identity never matches and the
    /// reconciler never settles.
    ///
    /// `reconcile` moves from `current` toward `next` and resolves with the
    /// state actually reached, which may differ from `next`.
    pub fn new<Eq, R, Fut, E>(initial_state: S, states_are_equal: Eq, reconcile: R) -> Self
    where
        Eq: Fn(&S, &S) -> bool + Send + Sync + 'static,
        R: Fn(S, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let reconcile: ReconcileFn<S> = Arc::new(move |current, next| -> ReconcileFuture<S> {
            let run = reconcile(current, next);
            Box::pin(async move { run.await.map_err(Into::<BoxError>::into) })
        });

        ReconcilerConfig {
            initial_state,
            states_are_equal: Arc::new(states_are_equal),
            reconcile,
            on_error: None,
            on_state_update: None,
            on_settle: None,
            on_log: None,
            label: DEFAULT_LABEL.to_string(),
            runtime: None,
        }
    }

    /// Called when a reconcile call fails
    pub fn on_error(mut self, hook: impl Fn(&ReconcileError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Called after every completed reconcile call with the new current state
    pub fn on_state_update(mut self, hook: impl Fn(&S) + Send + Sync + 'static) -> Self {
        self.on_state_update = Some(Arc::new(hook));
        self
    }

    /// Called when a run completes and no further run is needed
    pub fn on_settle(mut self, hook: impl Fn(&S) + Send + Sync + 'static) -> Self {
        self.on_settle = Some(Arc::new(hook));
        self
    }

    /// Receives every lifecycle decision with state snapshots
    pub fn on_log(mut self, hook: impl for<'a> Fn(&LogEvent<'a, S>) + Send + Sync + 'static) -> Self {
        self.on_log = Some(Arc::new(hook));
        self
    }

    /// Tag used as the log message prefix and tracing field
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Runtime that reconcile calls are spawned on.
    ///
    /// Defaults to the runtime the reconciler is built in.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }
}

impl<S: Mergeable> fmt::Debug for ReconcilerConfig<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcilerConfig")
            .field("initial_state", &self.initial_state)
            .field("label", &self.label)
            .field("on_error", &self.on_error.is_some())
            .field("on_state_update", &self.on_state_update.is_some())
            .field("on_settle", &self.on_settle.is_some())
            .field("on_log", &self.on_log.is_some())
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}
