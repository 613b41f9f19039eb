//! Cost and call accounting for model usage.
//!
//! Every model keeps its own [`ModelCounters`] and also reports into one
//! [`GlobalModelStats`] shared by the whole process. The global object is
//! passed explicitly (as [`SharedModelStats`]) into every model instance, so
//! concurrent batch workers all add to the same totals.

use std::env;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Environment variable holding an optional process-wide cost limit in dollars.
pub const GLOBAL_COST_LIMIT_ENV: &str = "SWE_HARNESS_GLOBAL_COST_LIMIT";

/// Environment variable holding an optional process-wide call limit.
pub const GLOBAL_CALL_LIMIT_ENV: &str = "SWE_HARNESS_GLOBAL_CALL_LIMIT";

/// Point-in-time view of accumulated cost and calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Accumulated cost in dollars.
    pub cost: f64,
    /// Number of successful model calls.
    pub n_calls: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-model call and cost counters.
#[derive(Debug, Default)]
pub struct ModelCounters {
    inner: Mutex<UsageSnapshot>,
}

impl ModelCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed call with its cost.
    pub fn record(&self, cost: f64) {
        let mut usage = lock(&self.inner);
        usage.n_calls += 1;
        usage.cost += cost;
    }

    /// Current totals.
    pub fn snapshot(&self) -> UsageSnapshot {
        *lock(&self.inner)
    }

    pub fn cost(&self) -> f64 {
        self.snapshot().cost
    }

    pub fn n_calls(&self) -> u64 {
        self.snapshot().n_calls
    }
}

/// Process-wide usage totals with optional limits.
///
/// Updates are serialized through a mutex so concurrent workers never lose
/// an increment; the totals can only grow.
#[derive(Debug, Default)]
pub struct GlobalModelStats {
    usage: Mutex<UsageSnapshot>,
    /// Cost limit in dollars; `0.0` disables it.
    cost_limit: f64,
    /// Call limit; `0` disables it.
    call_limit: u64,
}

/// Shared handle to the process-wide stats.
pub type SharedModelStats = Arc<GlobalModelStats>;

impl GlobalModelStats {
    /// Create stats without limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create stats enforcing the given limits (`0` disables a limit).
    pub fn with_limits(cost_limit: f64, call_limit: u64) -> Self {
        Self {
            usage: Mutex::new(UsageSnapshot::default()),
            cost_limit: cost_limit.max(0.0),
            call_limit,
        }
    }

    /// Create stats with limits read from the environment.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let cost_limit = read_limit::<f64>(GLOBAL_COST_LIMIT_ENV).unwrap_or(0.0);
        let call_limit = read_limit::<u64>(GLOBAL_CALL_LIMIT_ENV).unwrap_or(0);
        if cost_limit > 0.0 || call_limit > 0 {
            tracing::info!(cost_limit, call_limit, "Global model limits enabled");
        }
        Self::with_limits(cost_limit, call_limit)
    }

    /// Wrap into a shareable handle.
    pub fn shared(self) -> SharedModelStats {
        Arc::new(self)
    }

    /// Add one call with its cost to the totals.
    pub fn add(&self, cost: f64) {
        let mut usage = lock(&self.usage);
        usage.cost += cost;
        usage.n_calls += 1;
        tracing::debug!(
            cost = cost,
            total_cost = usage.cost,
            total_calls = usage.n_calls,
            "Recorded global model usage"
        );
    }

    /// Fail if a configured limit has been reached.
    pub fn check_limits(&self) -> Result<(), LlmError> {
        let usage = self.snapshot();
        let cost_hit = self.cost_limit > 0.0 && usage.cost >= self.cost_limit;
        let calls_hit = self.call_limit > 0 && usage.n_calls >= self.call_limit;
        if cost_hit || calls_hit {
            return Err(LlmError::Runtime(format!(
                "Global cost/call limit exceeded: ${:.4} / {} calls (limits: ${:.4} / {} calls)",
                usage.cost, usage.n_calls, self.cost_limit, self.call_limit
            )));
        }
        Ok(())
    }

    /// Current totals.
    pub fn snapshot(&self) -> UsageSnapshot {
        *lock(&self.usage)
    }

    pub fn cost(&self) -> f64 {
        self.snapshot().cost
    }

    pub fn n_calls(&self) -> u64 {
        self.snapshot().n_calls
    }
}

fn read_limit<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparseable limit");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_counters_record() {
        let counters = ModelCounters::new();
        counters.record(0.5);
        counters.record(0.25);
        assert_eq!(counters.n_calls(), 2);
        assert!((counters.cost() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_global_stats_without_limits() {
        let stats = GlobalModelStats::new();
        for _ in 0..100 {
            stats.add(1.0);
        }
        assert!(stats.check_limits().is_ok());
        assert_eq!(stats.n_calls(), 100);
    }

    #[test]
    fn test_global_call_limit() {
        let stats = GlobalModelStats::with_limits(0.0, 2);
        stats.add(0.1);
        assert!(stats.check_limits().is_ok());
        stats.add(0.1);
        let err = stats.check_limits().unwrap_err();
        assert_eq!(err.status_name(), "RuntimeError");
    }

    #[test]
    fn test_global_cost_limit() {
        let stats = GlobalModelStats::with_limits(1.0, 0);
        stats.add(0.6);
        assert!(stats.check_limits().is_ok());
        stats.add(0.6);
        assert!(stats.check_limits().is_err());
    }

    #[test]
    fn test_concurrent_adds_are_not_lost() {
        let stats = GlobalModelStats::new().shared();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.add(0.001);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.n_calls(), 8000);
        assert!((stats.cost() - 8.0).abs() < 1e-6);
    }
}
