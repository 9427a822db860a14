//! Request Fuzzer - Randomized request bursts against a live reconciler
//!
//! Checks:
//! - Convergence after every burst
//! - Single-flight (never two reconcile calls at once)
//! - Failure isolation with caller-driven resumption
//! - Hook and counter bookkeeping agree

use std::sync::Arc;

use converge_reconciler::{FieldMap, Reconciler, ReconcilerConfig};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::timeout;

use crate::harness::{GatedReconcile, HarnessError, Probe, DEFAULT_WAIT};

/// State shape used by the fuzzer
pub type FuzzState = FieldMap<u8, i32>;

/// Upper bound on resume attempts after failures within one burst
const MAX_RESUMES_PER_BURST: usize = 64;

/// Fuzzer configuration
#[derive(Clone, Debug)]
pub struct FuzzerConfig {
    /// Number of request bursts
    pub bursts: usize,
    /// Requests per burst
    pub burst_len: usize,
    /// Distinct fields requests may touch
    pub field_count: u8,
    /// Field values are drawn from `0..value_range`
    pub value_range: i32,
    /// Probability of yielding to the runtime between requests
    pub yield_prob: f64,
    /// Probability a reconcile call rejects
    pub failure_prob: f64,
    /// Random seed
    pub seed: u64,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        FuzzerConfig {
            bursts: 20,
            burst_len: 8,
            field_count: 4,
            value_range: 5,
            yield_prob: 0.2,
            failure_prob: 0.1,
            seed: 42,
        }
    }
}

impl FuzzerConfig {
    /// Light fuzzing for quick tests
    pub fn light() -> Self {
        FuzzerConfig {
            bursts: 5,
            burst_len: 4,
            field_count: 2,
            value_range: 3,
            yield_prob: 0.1,
            failure_prob: 0.0,
            seed: 42,
        }
    }

    /// Heavy fuzzing for thorough testing
    pub fn heavy() -> Self {
        FuzzerConfig {
            bursts: 200,
            burst_len: 32,
            field_count: 8,
            value_range: 10,
            yield_prob: 0.3,
            failure_prob: 0.2,
            seed: 42,
        }
    }
}

/// Fuzzing outcome
#[derive(Clone, Debug, Default)]
pub struct FuzzResult {
    pub requests: u64,
    pub reconcile_calls: usize,
    pub settles: usize,
    pub failures: usize,
    /// Empty requests issued to resume after a failure
    pub resumes: usize,
    pub peak_in_flight: usize,
    /// Bursts that ended with current != target
    pub unconverged_bursts: usize,
    /// Stats counters agree with what the hooks saw
    pub bookkeeping_consistent: bool,
}

impl FuzzResult {
    pub fn is_sound(&self) -> bool {
        self.peak_in_flight <= 1
            && self.unconverged_bursts == 0
            && self.bookkeeping_consistent
            && self.reconcile_calls as u64 <= self.requests + self.resumes as u64
    }
}

/// Randomized request driver
pub struct RequestFuzzer {
    config: FuzzerConfig,
    rng: StdRng,
}

impl RequestFuzzer {
    pub fn new(config: FuzzerConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        RequestFuzzer { config, rng }
    }

    /// Run every burst against a fresh reconciler. Must be called inside a
    /// tokio runtime.
    pub async fn run(&mut self) -> Result<FuzzResult, HarnessError> {
        let failure_prob = self.config.failure_prob;
        let failure_rng = Arc::new(Mutex::new(StdRng::seed_from_u64(self.config.seed.rotate_left(17))));
        let gated = GatedReconcile::<FuzzState>::open().with_outcome(move |_, next: &FuzzState| {
            if failure_rng.lock().gen_bool(failure_prob) {
                Err("injected failure".to_string())
            } else {
                Ok(next.clone())
            }
        });
        let probe = Probe::new();
        let config = ReconcilerConfig::new(FuzzState::new(), |a, b| a == b, gated.reconcile_fn())
            .label("RequestFuzzer");
        let reconciler = Reconciler::new(probe.attach(config))?;

        let mut result = FuzzResult::default();

        for _ in 0..self.config.bursts {
            for _ in 0..self.config.burst_len {
                reconciler.request_state(self.random_partial());
                result.requests += 1;
                if self.rng.gen_bool(self.config.yield_prob) {
                    tokio::task::yield_now().await;
                }
            }

            result.resumes += self.drain(&reconciler).await?;

            if reconciler.current_state() != reconciler.target_state() {
                result.unconverged_bursts += 1;
            }
        }

        // Hooks run just after the busy flag drops, give them a moment
        let stats = reconciler.stats();
        let hooks_caught_up = probe
            .wait_until(|seen| {
                seen.state_updates.len() as u64 == stats.completions
                    && seen.errors.len() as u64 == stats.failures
                    && seen.settles.len() as u64 == stats.settles
            })
            .await
            .is_ok();

        let seen = probe.snapshot();
        result.reconcile_calls = gated.call_count();
        result.settles = seen.settles.len();
        result.failures = seen.errors.len();
        result.peak_in_flight = gated.peak_in_flight();
        result.bookkeeping_consistent = hooks_caught_up
            && stats.dispatches as usize == result.reconcile_calls
            && stats.requests == result.requests + result.resumes as u64;

        Ok(result)
    }

    /// Wait for the reconciler to go idle, resuming after failures the way a
    /// caller watching `on_error` would. Returns the number of resumes.
    async fn drain(&self, reconciler: &Reconciler<FuzzState>) -> Result<usize, HarnessError> {
        let mut resumes = 0;
        loop {
            wait_idle(reconciler).await?;
            if reconciler.current_state() == reconciler.target_state()
                || resumes == MAX_RESUMES_PER_BURST
            {
                return Ok(resumes);
            }
            reconciler.request_state(FuzzState::new());
            resumes += 1;
        }
    }

    fn random_partial(&mut self) -> FuzzState {
        let touched = self.rng.gen_range(1..=3);
        let mut partial = FuzzState::new();
        for _ in 0..touched {
            let field = self.rng.gen_range(0..self.config.field_count);
            partial.insert(field, self.rng.gen_range(0..self.config.value_range));
        }
        partial
    }
}

async fn wait_idle(reconciler: &Reconciler<FuzzState>) -> Result<(), HarnessError> {
    timeout(DEFAULT_WAIT, async {
        while reconciler.is_busy() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .map_err(|_| HarnessError::Timeout(DEFAULT_WAIT))
}
