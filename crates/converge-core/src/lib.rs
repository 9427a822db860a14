//! converge core - State primitives shared by the reconciler
//!
//! This crate defines:
//! - The `Mergeable` state abstraction (explicit partial updates)
//! - `FieldMap`, a ready-made shallow-merge record
//! - Reconciliation error types

pub mod error;
pub mod state;

pub use error::*;
pub use state::*;
