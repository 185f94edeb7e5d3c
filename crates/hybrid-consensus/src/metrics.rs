// Metrics for the hybrid consensus engine.
//
// The engine pushes individual samples to a `MetricsSink` synchronously and
// can assemble a `ConsensusMetrics` snapshot on demand. Snapshots are derived
// data; nothing here is a source of truth.

use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::circuit_breaker::CircuitBreakerState;
use crate::services::MetricsSink;

pub const METRIC_VALIDATION_MS: &str = "consensus.validation.duration_ms";
pub const METRIC_BLOCK_ACCEPTED: &str = "consensus.block.accepted";
pub const METRIC_BLOCK_REJECTED: &str = "consensus.block.rejected";
pub const METRIC_VALIDATION_TIMEOUT: &str = "consensus.validation.timeout";
pub const METRIC_FORK_RESOLVED: &str = "consensus.fork.resolved";
pub const METRIC_FORK_TIMEOUT: &str = "consensus.fork.timeout";
pub const METRIC_MINING_ATTEMPT: &str = "consensus.mining.attempt";
pub const METRIC_CACHE_WARMED: &str = "consensus.cache.warmed";
pub const METRIC_REWARD: &str = "consensus.reward";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VotingMetrics {
    pub total_periods: u64,
    pub active_periods: u64,
    pub completed_periods: u64,
    pub votes_received: u64,
    pub votes_rejected: u64,
    /// Participation rate of the most recent tally, in [0, 1].
    pub last_participation_rate: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheMetrics {
    pub hit_rate: f64,
    pub size: usize,
    pub max_size: usize,
    pub eviction_count: u64,
    pub memory_usage: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RetryStats {
    pub mining_attempts: u64,
    pub mining_successes: u64,
    pub mining_failures: u64,
    pub warmup_retries: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ValidationStats {
    pub validations: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub cache_hits: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub forks_resolved: u64,
    pub fork_timeouts: u64,
}

/// Point-in-time snapshot of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusMetrics {
    pub pow: serde_json::Value,
    pub voting: VotingMetrics,
    pub cache: CacheMetrics,
    pub retry: RetryStats,
    pub validation: ValidationStats,
    pub circuit_breaker: CircuitBreakerState,
    pub timestamp: u64,
}

/// Lock-free counters updated on the hot path.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub validations: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub cache_hits: AtomicU64,
    pub timeouts: AtomicU64,
    pub errors: AtomicU64,
    pub forks_resolved: AtomicU64,
    pub fork_timeouts: AtomicU64,
    pub mining_attempts: AtomicU64,
    pub mining_successes: AtomicU64,
    pub mining_failures: AtomicU64,
    pub warmup_retries: AtomicU64,
}

impl EngineCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn validation_stats(&self) -> ValidationStats {
        ValidationStats {
            validations: self.validations.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            forks_resolved: self.forks_resolved.load(Ordering::Relaxed),
            fork_timeouts: self.fork_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn retry_stats(&self) -> RetryStats {
        RetryStats {
            mining_attempts: self.mining_attempts.load(Ordering::Relaxed),
            mining_successes: self.mining_successes.load(Ordering::Relaxed),
            mining_failures: self.mining_failures.load(Ordering::Relaxed),
            warmup_retries: self.warmup_retries.load(Ordering::Relaxed),
        }
    }
}

/// Sink that forwards samples to the `log` facade at debug level.
#[derive(Debug, Default)]
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn record(&self, name: &str, value: f64, timestamp: u64) {
        debug!("metric {}={} @{}", name, value, timestamp);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub timestamp: u64,
}

/// Sink that keeps every sample in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    samples: Mutex<Vec<MetricSample>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<MetricSample> {
        self.samples.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.samples.lock().iter().filter(|s| s.name == name).count()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record(&self, name: &str, value: f64, timestamp: u64) {
        self.samples.lock().push(MetricSample {
            name: name.to_string(),
            value,
            timestamp,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = EngineCounters::default();
        EngineCounters::bump(&counters.validations);
        EngineCounters::bump(&counters.validations);
        EngineCounters::bump(&counters.rejected);
        EngineCounters::bump(&counters.mining_attempts);

        let validation = counters.validation_stats();
        assert_eq!(validation.validations, 2);
        assert_eq!(validation.rejected, 1);
        assert_eq!(counters.retry_stats().mining_attempts, 1);
    }

    #[test]
    fn test_in_memory_sink_counts_by_name() {
        let sink = InMemoryMetricsSink::new();
        sink.record(METRIC_BLOCK_ACCEPTED, 1.0, 10);
        sink.record(METRIC_BLOCK_REJECTED, 1.0, 11);
        sink.record(METRIC_BLOCK_ACCEPTED, 1.0, 12);
        assert_eq!(sink.count(METRIC_BLOCK_ACCEPTED), 2);
        assert_eq!(sink.samples().len(), 3);
    }
}
