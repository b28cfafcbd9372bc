//! Lightweight performance monitor for sync traffic.
//!
//! `record` is the hot path: it bumps exact aggregate counters and, for a
//! biased sample of operations, writes a detail row into a fixed-capacity
//! ring buffer. Errored and slow operations are always retained; routine
//! ones only with a small probability, so the detail buffer favors signal
//! while the aggregates stay exact. Everything derived (averages, health)
//! is computed on demand, never while recording.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngExt;
use serde::Serialize;

use crate::clock::Clock;
use crate::config::TelemetryConfig;
use crate::protocol::Direction;

/// One sampled sync operation.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSample {
    pub message_kind: String,
    pub direction: Direction,
    pub duration_ms: u64,
    pub timestamp: u64,
    pub error: bool,
}

/// Exact aggregate counters, computed on demand.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub total_syncs: u64,
    pub error_count: u64,
    pub average_duration_ms: f64,
    pub max_duration_ms: u64,
    pub message_kind_counts: HashMap<String, u64>,
}

/// Health verdict with a human-readable reason when unhealthy.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// JSON-serializable snapshot for the diagnostics panel.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: String,
    pub stats: SyncStats,
    pub health: Health,
    pub recent_samples: Vec<PerformanceSample>,
}

struct MonitorState {
    samples: Vec<PerformanceSample>,
    write_index: usize,
    total_syncs: u64,
    error_count: u64,
    sum_duration_ms: u64,
    max_duration_ms: u64,
    kind_counts: HashMap<String, u64>,
}

/// Observes completed sync operations without perturbing them.
pub struct PerformanceMonitor {
    capacity: usize,
    sample_probability: f64,
    always_sample_over_ms: u64,
    max_error_rate: f64,
    unhealthy_max_ms: u64,
    unhealthy_average_ms: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
}

impl PerformanceMonitor {
    pub fn new(config: &TelemetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: config.capacity.max(1),
            sample_probability: config.sample_probability,
            always_sample_over_ms: config.always_sample_over_ms,
            max_error_rate: config.max_error_rate,
            unhealthy_max_ms: config.unhealthy_max_ms,
            unhealthy_average_ms: config.unhealthy_average_ms,
            clock,
            state: Mutex::new(MonitorState {
                samples: Vec::new(),
                write_index: 0,
                total_syncs: 0,
                error_count: 0,
                sum_duration_ms: 0,
                max_duration_ms: 0,
                kind_counts: HashMap::new(),
            }),
        }
    }

    /// Record one completed operation. Aggregates are updated
    /// unconditionally; the detail row is subject to biased sampling.
    pub fn record(&self, message_kind: &str, direction: Direction, duration_ms: u64, error: bool) {
        let retain_detail = error
            || duration_ms > self.always_sample_over_ms
            || rand::rng().random::<f64>() < self.sample_probability;

        let mut state = self.state.lock();
        state.total_syncs += 1;
        if error {
            state.error_count += 1;
        }
        state.sum_duration_ms += duration_ms;
        state.max_duration_ms = state.max_duration_ms.max(duration_ms);
        *state
            .kind_counts
            .entry(message_kind.to_string())
            .or_insert(0) += 1;

        if retain_detail {
            let sample = PerformanceSample {
                message_kind: message_kind.to_string(),
                direction,
                duration_ms,
                timestamp: self.clock.now_ms(),
                error,
            };
            if state.samples.len() < self.capacity {
                state.samples.push(sample);
            } else {
                let index = state.write_index;
                state.samples[index] = sample;
            }
            state.write_index = (state.write_index + 1) % self.capacity;
        }
    }

    /// Exact aggregates.
    pub fn stats(&self) -> SyncStats {
        let state = self.state.lock();
        let average = if state.total_syncs == 0 {
            0.0
        } else {
            state.sum_duration_ms as f64 / state.total_syncs as f64
        };
        SyncStats {
            total_syncs: state.total_syncs,
            error_count: state.error_count,
            average_duration_ms: average,
            max_duration_ms: state.max_duration_ms,
            message_kind_counts: state.kind_counts.clone(),
        }
    }

    /// Up to `limit` sampled operations, most recent first.
    pub fn detailed_metrics(&self, limit: usize) -> Vec<PerformanceSample> {
        let state = self.state.lock();
        let len = state.samples.len();
        let take = limit.min(len);
        let mut out = Vec::with_capacity(take);
        // write_index points at the oldest slot once the ring is full;
        // walk backwards from the newest.
        for step in 1..=take {
            let index = (state.write_index + self.capacity - step) % self.capacity;
            if index < len {
                out.push(state.samples[index].clone());
            }
        }
        out
    }

    /// Health verdict against the configured thresholds.
    pub fn health(&self) -> Health {
        let stats = self.stats();
        if stats.total_syncs == 0 {
            return Health {
                healthy: true,
                reason: None,
            };
        }

        let error_rate = stats.error_count as f64 / stats.total_syncs as f64;
        if error_rate > self.max_error_rate {
            return Health {
                healthy: false,
                reason: Some(format!(
                    "error rate {:.2}% exceeds {:.2}%",
                    error_rate * 100.0,
                    self.max_error_rate * 100.0
                )),
            };
        }
        if stats.max_duration_ms > self.unhealthy_max_ms {
            return Health {
                healthy: false,
                reason: Some(format!(
                    "max sync duration {} ms exceeds {} ms",
                    stats.max_duration_ms, self.unhealthy_max_ms
                )),
            };
        }
        if stats.average_duration_ms > self.unhealthy_average_ms {
            return Health {
                healthy: false,
                reason: Some(format!(
                    "average sync duration {:.2} ms exceeds {:.2} ms",
                    stats.average_duration_ms, self.unhealthy_average_ms
                )),
            };
        }

        Health {
            healthy: true,
            reason: None,
        }
    }

    /// Full snapshot for the diagnostics panel.
    pub fn export_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            generated_at: chrono::Utc::now().to_rfc3339(),
            stats: self.stats(),
            health: self.health(),
            recent_samples: self.detailed_metrics(50),
        }
    }

    /// Drop all samples and counters.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.samples.clear();
        state.write_index = 0;
        state.total_syncs = 0;
        state.error_count = 0;
        state.sum_duration_ms = 0;
        state.max_duration_ms = 0;
        state.kind_counts.clear();
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn make_monitor() -> PerformanceMonitor {
        PerformanceMonitor::new(&TelemetryConfig::default(), Arc::new(ManualClock::new(1_000)))
    }

    /// Config that samples nothing routine, so only errored/slow
    /// operations land in the detail buffer.
    fn signal_only_config() -> TelemetryConfig {
        TelemetryConfig {
            sample_probability: 0.0,
            ..TelemetryConfig::default()
        }
    }

    #[test]
    fn aggregates_are_exact_regardless_of_sampling() {
        let monitor = PerformanceMonitor::new(
            &signal_only_config(),
            Arc::new(ManualClock::new(1_000)),
        );

        for i in 0..100 {
            monitor.record("assistant_delta", Direction::ToView, i % 3, false);
        }
        monitor.record("settings_changed", Direction::ToCore, 50, true);

        let stats = monitor.stats();
        assert_eq!(stats.total_syncs, 101);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.max_duration_ms, 50);
        assert_eq!(stats.message_kind_counts["assistant_delta"], 100);
        assert_eq!(stats.message_kind_counts["settings_changed"], 1);
    }

    #[test]
    fn errors_and_slow_operations_are_always_sampled() {
        let monitor = PerformanceMonitor::new(
            &signal_only_config(),
            Arc::new(ManualClock::new(1_000)),
        );

        monitor.record("fast", Direction::ToView, 1, false);
        monitor.record("slow", Direction::ToView, 25, false);
        monitor.record("bad", Direction::ToCore, 2, true);

        let samples = monitor.detailed_metrics(10);
        assert_eq!(samples.len(), 2);
        // Most recent first.
        assert_eq!(samples[0].message_kind, "bad");
        assert!(samples[0].error);
        assert_eq!(samples[1].message_kind, "slow");
        assert_eq!(samples[1].duration_ms, 25);
    }

    #[test]
    fn ring_buffer_overwrites_oldest() {
        let config = TelemetryConfig {
            capacity: 3,
            sample_probability: 1.0,
            ..TelemetryConfig::default()
        };
        let monitor = PerformanceMonitor::new(&config, Arc::new(ManualClock::new(0)));

        for i in 0..5 {
            monitor.record(&format!("k{i}"), Direction::ToView, 0, false);
        }

        let samples = monitor.detailed_metrics(10);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].message_kind, "k4");
        assert_eq!(samples[1].message_kind, "k3");
        assert_eq!(samples[2].message_kind, "k2");

        // Aggregates still count everything.
        assert_eq!(monitor.stats().total_syncs, 5);
    }

    #[test]
    fn detailed_metrics_respects_limit() {
        let config = TelemetryConfig {
            sample_probability: 1.0,
            ..TelemetryConfig::default()
        };
        let monitor = PerformanceMonitor::new(&config, Arc::new(ManualClock::new(0)));
        for _ in 0..10 {
            monitor.record("k", Direction::ToView, 0, false);
        }
        assert_eq!(monitor.detailed_metrics(4).len(), 4);
    }

    #[test]
    fn healthy_when_idle() {
        let monitor = make_monitor();
        let health = monitor.health();
        assert!(health.healthy);
        assert!(health.reason.is_none());
    }

    #[test]
    fn error_rate_flips_health() {
        let monitor = make_monitor();
        for _ in 0..50 {
            monitor.record("k", Direction::ToView, 1, false);
        }
        monitor.record("k", Direction::ToView, 1, true);

        let health = monitor.health();
        assert!(!health.healthy);
        assert!(health.reason.unwrap().contains("error rate"));
    }

    #[test]
    fn max_duration_flips_health() {
        let monitor = make_monitor();
        monitor.record("k", Direction::ToView, 150, false);

        let health = monitor.health();
        assert!(!health.healthy);
        assert!(health.reason.unwrap().contains("max sync duration"));
    }

    #[test]
    fn average_duration_flips_health() {
        let monitor = make_monitor();
        // Max stays under the 100 ms threshold; the average (8 ms) exceeds
        // the 5 ms one.
        for _ in 0..10 {
            monitor.record("k", Direction::ToView, 8, false);
        }

        let health = monitor.health();
        assert!(!health.healthy);
        assert!(health.reason.unwrap().contains("average sync duration"));
    }

    #[test]
    fn reset_clears_everything() {
        let monitor = make_monitor();
        monitor.record("k", Direction::ToView, 200, true);
        assert!(!monitor.health().healthy);

        monitor.reset();
        let stats = monitor.stats();
        assert_eq!(stats.total_syncs, 0);
        assert_eq!(stats.max_duration_ms, 0);
        assert!(monitor.detailed_metrics(10).is_empty());
        assert!(monitor.health().healthy);
    }

    #[test]
    fn export_snapshot_serializes() {
        let monitor = make_monitor();
        monitor.record("k", Direction::ToCore, 12, false);

        let snapshot = monitor.export_metrics();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["stats"]["total_syncs"], 1);
        assert!(json["health"]["healthy"].is_boolean());
    }
}
