use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::config::{RetryStrategy, ShareId};

/// Stop auto-retrying after this many consecutive failures...
const CIRCUIT_THRESHOLD: u32 = 5;
/// ...until this much time has passed since the last one.
const CIRCUIT_RESET_WINDOW: Duration = Duration::from_secs(300);

const DEFAULT_DELAY_CAP: Duration = Duration::from_secs(600);
const CUSTOM_DELAY_CAP: Duration = Duration::from_secs(120);

/// Exponent is clamped so one flaky evening cannot push delays into hours.
const MAX_BACKOFF_EXPONENT: u32 = 4;
/// Custom intervals scale linearly, and only this far.
const MAX_LINEAR_FACTOR: u32 = 3;

#[derive(Debug, Default, Clone)]
struct Counters {
    failures: u32,
    last_failure_at: Option<Instant>,
    attempts: u32,
    last_success_at: Option<Instant>,
}

/// Per-share failure bookkeeping: backoff delays and the circuit breaker.
/// Optimistic after topology changes; the coordinator calls `clear_all`
/// on every network change.
pub struct RetryGovernor {
    counters: Mutex<HashMap<ShareId, Counters>>,
}

impl RetryGovernor {
    pub fn new() -> Self {
        Self { counters: Mutex::new(HashMap::new()) }
    }

    /// False only while the circuit is open: 5 consecutive failures and
    /// the cool-down has not elapsed. An elapsed cool-down reopens the
    /// circuit and zeroes the counter as a side effect.
    pub fn should_retry(&self, id: ShareId) -> bool {
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(id).or_default();
        if entry.failures < CIRCUIT_THRESHOLD {
            return true;
        }
        match entry.last_failure_at {
            Some(at) if at.elapsed() > CIRCUIT_RESET_WINDOW => {
                debug!(share = %id, "circuit breaker cool-down elapsed, reopening");
                entry.failures = 0;
                true
            }
            _ => false,
        }
    }

    pub fn record_failure(&self, id: ShareId) {
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(id).or_default();
        entry.failures += 1;
        entry.attempts += 1;
        entry.last_failure_at = Some(Instant::now());
    }

    pub fn record_success(&self, id: ShareId) {
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(id).or_default();
        entry.failures = 0;
        entry.attempts = 0;
        entry.last_success_at = Some(Instant::now());
    }

    pub fn failures(&self, id: ShareId) -> u32 {
        self.counters.lock().unwrap().get(&id).map(|c| c.failures).unwrap_or(0)
    }

    pub fn was_recently_successful(&self, id: ShareId, within: Duration) -> bool {
        self.counters
            .lock()
            .unwrap()
            .get(&id)
            .and_then(|c| c.last_success_at)
            .is_some_and(|at| at.elapsed() < within)
    }

    /// The wait before the next attempt, or None for Manual (no
    /// auto-retry).
    pub fn next_delay(
        &self,
        id: ShareId,
        strategy: RetryStrategy,
        custom_interval: Option<Duration>,
    ) -> Option<Duration> {
        let failures = self.failures(id);
        let unit = rand::thread_rng().gen_range(0.0..1.0);
        compute_delay(failures, strategy, custom_interval, unit)
    }

    /// Forget one share's counters entirely; called when the share is
    /// deleted.
    pub fn reset(&self, id: ShareId) {
        self.counters.lock().unwrap().remove(&id);
    }

    /// Topology changed; everything old is forgiven.
    pub fn clear_all(&self) {
        self.counters.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn backdate_last_failure(&self, id: ShareId, age: Duration) {
        let mut counters = self.counters.lock().unwrap();
        if let Some(entry) = counters.get_mut(&id) {
            entry.last_failure_at = Instant::now().checked_sub(age);
        }
    }
}

impl Default for RetryGovernor {
    fn default() -> Self {
        Self::new()
    }
}

/// Pure delay formula. `jitter_unit` is uniform in [0, 1).
fn compute_delay(
    failures: u32,
    strategy: RetryStrategy,
    custom_interval: Option<Duration>,
    jitter_unit: f64,
) -> Option<Duration> {
    if let Some(base) = custom_interval {
        // user-chosen interval: scale linearly and jitter ±10%
        let factor = (failures + 1).min(MAX_LINEAR_FACTOR);
        let raw = base.as_secs_f64() * f64::from(factor);
        let jittered = raw * (0.9 + 0.2 * jitter_unit);
        return Some(Duration::from_secs_f64(jittered).min(CUSTOM_DELAY_CAP));
    }

    let params = strategy.params();
    let base = params.base?;
    let exponent = failures.min(MAX_BACKOFF_EXPONENT);
    let raw = base.as_secs_f64() * params.multiplier.powi(exponent as i32);
    let jittered = raw * (0.8 + 0.4 * jitter_unit);
    Some(Duration::from_secs_f64(jittered).min(DEFAULT_DELAY_CAP))
}
