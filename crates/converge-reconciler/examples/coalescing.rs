//! Coalescing Example
//!
//! A slow reconcile function fed seven rapid requests. Only the first and
//! the last requested values are ever reconciled.
//!
//! Run with `RUST_LOG=converge=debug` to see every lifecycle decision.

use std::time::Duration;

use converge_reconciler::{BoxError, FieldMap, Reconciler, ReconcilerConfig};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

type Volume = FieldMap<&'static str, u32>;

async fn apply_volume(current: Volume, next: Volume) -> Result<Volume, BoxError> {
    println!(
        "   applying {:?} -> {:?}",
        current.get(&"level"),
        next.get(&"level")
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(next)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== converge Coalescing Example ===\n");

    let (settled_tx, settled_rx) = oneshot::channel();
    let settled_tx = parking_lot::Mutex::new(Some(settled_tx));

    let config = ReconcilerConfig::new(
        Volume::new().with("level", 1).with("muted", 0),
        |a, b| a == b,
        apply_volume,
    )
    .label("Volume")
    .on_state_update(|state| println!("   state update: {:?}", state))
    .on_error(|err| eprintln!("   reconcile failed: {}", err))
    .on_settle(move |state| {
        if let Some(tx) = settled_tx.lock().take() {
            let _ = tx.send(state.clone());
        }
    });
    let reconciler = Reconciler::new(config)?;

    println!("1. Requesting levels 2..=7 in a burst");
    for level in 2..=7 {
        reconciler.request_state(Volume::new().with("level", level));
    }
    println!("   phase: {}", reconciler.phase());

    let settled = settled_rx.await?;
    println!("\n2. Settled at {:?}", settled);

    let stats = reconciler.stats();
    println!(
        "   {} requests, {} reconcile calls, {} deferred",
        stats.requests, stats.dispatches, stats.deferred_requests
    );

    Ok(())
}
