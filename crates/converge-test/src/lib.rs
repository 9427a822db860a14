//! converge Test Harness - Reconciler doubles, scenarios and fuzzing
//!
//! This crate provides:
//! - A gated, call-recording reconcile function
//! - A hook probe that records settles, updates, errors and logs
//! - End-to-end scenarios over a typed record state
//! - Seeded request fuzzing

pub mod harness;
pub mod integration;
pub mod request_fuzzer;

pub use harness::*;
pub use integration::*;
pub use request_fuzzer::*;
