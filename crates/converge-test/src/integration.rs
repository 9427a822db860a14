//! End-to-end Integration Scenarios
//!
//! Scenarios that drive a reconciler with a typed record state:
//! - Burst coalescing while a slow call is in flight
//! - Failure followed by caller-driven resumption
//! - Partial progress converging over several calls

use converge_reconciler::{Mergeable, Reconciler, ReconcilerConfig};

use crate::harness::{GatedReconcile, HarnessError, Probe, ReconcileCall};

// ============================================================================
// SCENARIO STATE
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Off,
    Heat,
    Cool,
}

/// Device setting reconciled against slow hardware
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Thermostat {
    pub setpoint: i32,
    pub mode: Mode,
}

/// Fields to overwrite on a thermostat
#[derive(Clone, Debug, Default)]
pub struct ThermostatPatch {
    pub setpoint: Option<i32>,
    pub mode: Option<Mode>,
}

impl ThermostatPatch {
    pub fn setpoint(setpoint: i32) -> Self {
        ThermostatPatch {
            setpoint: Some(setpoint),
            mode: None,
        }
    }

    pub fn mode(mode: Mode) -> Self {
        ThermostatPatch {
            setpoint: None,
            mode: Some(mode),
        }
    }
}

impl Mergeable for Thermostat {
    type Partial = ThermostatPatch;

    fn merge(&self, partial: ThermostatPatch) -> Self {
        Thermostat {
            setpoint: partial.setpoint.unwrap_or(self.setpoint),
            mode: partial.mode.unwrap_or(self.mode),
        }
    }
}

impl Thermostat {
    pub fn new(setpoint: i32, mode: Mode) -> Self {
        Thermostat { setpoint, mode }
    }
}

fn same_setting(a: &Thermostat, b: &Thermostat) -> bool {
    a == b
}

// ============================================================================
// SCENARIO RESULTS
// ============================================================================

/// What a scenario observed
#[derive(Clone, Debug)]
pub struct ScenarioResult {
    pub calls: Vec<ReconcileCall<Thermostat>>,
    pub state_updates: Vec<Thermostat>,
    pub settles: Vec<Thermostat>,
    pub errors: Vec<String>,
    pub final_state: Thermostat,
    pub peak_in_flight: usize,
}

impl ScenarioResult {
    fn collect(
        gated: &GatedReconcile<Thermostat>,
        probe: &Probe<Thermostat>,
        reconciler: &Reconciler<Thermostat>,
    ) -> Self {
        let seen = probe.snapshot();
        ScenarioResult {
            calls: gated.calls(),
            state_updates: seen.state_updates,
            settles: seen.settles,
            errors: seen.errors,
            final_state: reconciler.current_state(),
            peak_in_flight: gated.peak_in_flight(),
        }
    }

    /// Setpoints passed as `next` to each call
    pub fn requested_setpoints(&self) -> Vec<i32> {
        self.calls.iter().map(|call| call.next.setpoint).collect()
    }
}

fn build(
    initial: Thermostat,
    gated: &GatedReconcile<Thermostat>,
    probe: &Probe<Thermostat>,
) -> Result<Reconciler<Thermostat>, HarnessError> {
    let config = ReconcilerConfig::new(initial, same_setting, gated.reconcile_fn()).label("Thermostat");
    Ok(Reconciler::new(probe.attach(config))?)
}

// ============================================================================
// SCENARIOS
// ============================================================================

/// Setpoints 2..=7 requested while the first call is held
pub async fn scenario_burst_coalescing() -> Result<ScenarioResult, HarnessError> {
    let gated = GatedReconcile::new();
    let probe = Probe::new();
    let reconciler = build(Thermostat::new(1, Mode::Heat), &gated, &probe)?;

    reconciler.request_state(ThermostatPatch::setpoint(2));
    gated.wait_for_calls(1).await?;
    for setpoint in 3..=7 {
        reconciler.request_state(ThermostatPatch::setpoint(setpoint));
    }

    gated.open_gate();
    probe.wait_for_settle(1).await?;

    Ok(ScenarioResult::collect(&gated, &probe, &reconciler))
}

/// Cooling is rejected by the device; the caller backs off to heating
pub async fn scenario_failure_then_resume() -> Result<ScenarioResult, HarnessError> {
    let gated = GatedReconcile::open().with_outcome(|_, next: &Thermostat| {
        if next.mode == Mode::Cool {
            Err("compressor fault".to_string())
        } else {
            Ok(next.clone())
        }
    });
    let probe = Probe::new();
    let reconciler = build(Thermostat::new(20, Mode::Off), &gated, &probe)?;

    reconciler.request_state(ThermostatPatch {
        setpoint: Some(18),
        mode: Some(Mode::Cool),
    });
    probe.wait_for_error(1).await?;

    reconciler.request_state(ThermostatPatch::mode(Mode::Heat));
    probe.wait_for_settle(1).await?;

    Ok(ScenarioResult::collect(&gated, &probe, &reconciler))
}

/// Hardware moves at most 2 degrees per call
pub async fn scenario_partial_progress() -> Result<ScenarioResult, HarnessError> {
    let gated = GatedReconcile::open().with_outcome(|current: &Thermostat, next: &Thermostat| {
        let step = (next.setpoint - current.setpoint).clamp(-2, 2);
        Ok(Thermostat::new(current.setpoint + step, next.mode))
    });
    let probe = Probe::new();
    let reconciler = build(Thermostat::new(15, Mode::Heat), &gated, &probe)?;

    reconciler.request_state(ThermostatPatch::setpoint(21));
    probe.wait_for_settle(1).await?;

    Ok(ScenarioResult::collect(&gated, &probe, &reconciler))
}
