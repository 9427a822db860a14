//! Error types for reconciliation

use thiserror::Error;

/// Boxed error returned by caller-supplied reconcile functions
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Diagnostic carried by failures that did not produce an error value
pub const ABNORMAL_FAILURE_MESSAGE: &str = "Reconcile function caused an error";

/// A failed reconciliation run.
///
/// There is only one failure kind, a reconcile call that did not resolve
/// with a state. The variants record how it failed.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The reconcile future resolved with `Err`
    #[error("Reconcile rejected: {0}")]
    Rejected(#[source] BoxError),

    /// The reconcile function or a completion hook panicked, or the call's
    /// task was torn down. Tagged with the reconciler label.
    #[error("{label}: Reconcile function caused an error")]
    Abnormal { label: String },
}

impl ReconcileError {
    /// Wrap any error value returned by a reconcile function
    pub fn rejected<E: Into<BoxError>>(err: E) -> Self {
        ReconcileError::Rejected(err.into())
    }

    pub fn abnormal(label: impl Into<String>) -> Self {
        ReconcileError::Abnormal {
            label: label.into(),
        }
    }

    /// True if the failure was normalized from a non-error value
    pub fn is_abnormal(&self) -> bool {
        matches!(self, ReconcileError::Abnormal { .. })
    }
}

/// Result type for reconcile operations
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors raised while building a reconciler
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No tokio runtime: build the reconciler inside a runtime or pass a runtime handle")]
    NoRuntime,
}
