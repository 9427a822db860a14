//! converge reconciler - Single-flight asynchronous state reconciliation
//!
//! This crate implements the coalescing reconciler:
//! - Partial requests merged into an accumulated target
//! - At most one reconcile call in flight
//! - Superseded intermediate targets dropped
//! - Settle, state update, error and log hooks

pub mod config;
pub mod event;
pub mod reconcile;
pub mod stats;

pub use config::{ReconcileFuture, ReconcilerConfig, DEFAULT_LABEL};
pub use event::*;
pub use reconcile::*;
pub use stats::*;

pub use converge_core::{
    BoxError, ConfigError, FieldMap, Mergeable, ReconcileError, ReconcileResult,
    ABNORMAL_FAILURE_MESSAGE,
};
