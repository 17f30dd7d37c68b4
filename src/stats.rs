//! Run statistics: per-worker outcome counters and the pooled latency
//! sampler they all record into.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Outcome counters for one worker.
///
/// Each worker mutates only its own `Stats`; the orchestrator merges them
/// once after all workers have finished. The merge is element-wise addition,
/// so totals are independent of merge order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub delete_hits: i64,
    pub delete_misses: i64,
    pub get_hits: i64,
    pub get_misses: i64,
    /// Gets whose value did not match the expected bytes. Reported as -1
    /// when validation was disabled for the run.
    pub key_collisions: i64,
    pub sets_total: i64,
}

impl Stats {
    pub fn add(&mut self, other: &Stats) {
        self.delete_hits += other.delete_hits;
        self.delete_misses += other.delete_misses;
        self.get_hits += other.get_hits;
        self.get_misses += other.get_misses;
        self.key_collisions += other.key_collisions;
        self.sets_total += other.sets_total;
    }
}

/// Fixed-capacity pool of operation latencies, shared by all workers.
///
/// Once full, new samples overwrite the oldest so the pool always reflects
/// the most recent window. Capacity should be at least
/// `max(1000, rps * conn_count)` for adequate percentile resolution.
pub struct LatencySampler {
    inner: Mutex<SampleRing>,
}

struct SampleRing {
    samples: Vec<Duration>,
    capacity: usize,
    next: usize,
    total: u64,
}

impl LatencySampler {
    pub fn with_capacity(capacity: usize) -> LatencySampler {
        let capacity = capacity.max(1);
        LatencySampler {
            inner: Mutex::new(SampleRing {
                samples: Vec::with_capacity(capacity),
                capacity,
                next: 0,
                total: 0,
            }),
        }
    }

    pub fn record(&self, sample: Duration) {
        let mut ring = self.inner.lock();
        if ring.samples.len() < ring.capacity {
            ring.samples.push(sample);
        } else {
            let at = ring.next;
            ring.samples[at] = sample;
        }
        ring.next = (ring.next + 1) % ring.capacity;
        ring.total += 1;
    }

    /// Summarize the pooled samples. `wall` is the measured run duration.
    pub fn metrics(&self, wall: Duration) -> Metrics {
        let ring = self.inner.lock();
        let mut sorted: Vec<f64> = ring
            .samples
            .iter()
            .map(|d| d.as_secs_f64() * 1_000_000.0)
            .collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let avg_us = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };
        let wall_secs = wall.as_secs_f64();
        Metrics {
            wall_time_secs: wall_secs,
            samples: sorted.len(),
            total_ops: ring.total,
            throughput_ops_sec: if wall_secs > 0.0 {
                ring.total as f64 / wall_secs
            } else {
                0.0
            },
            min_us: sorted.first().copied().unwrap_or(0.0),
            avg_us,
            max_us: sorted.last().copied().unwrap_or(0.0),
            p50_us: percentile(&sorted, 0.50),
            p95_us: percentile(&sorted, 0.95),
            p99_us: percentile(&sorted, 0.99),
        }
    }
}

/// Latency summary for a finished run, in microseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub wall_time_secs: f64,
    pub samples: usize,
    pub total_ops: u64,
    pub throughput_ops_sec: f64,
    pub min_us: f64,
    pub avg_us: f64,
    pub max_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
}

/// Interpolated percentile over an ascending-sorted slice; `p` in [0, 1].
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let k = p * (sorted.len() - 1) as f64;
    let floor_idx = k.floor() as usize;
    let ceil_idx = (floor_idx + 1).min(sorted.len() - 1);
    if floor_idx == ceil_idx {
        return sorted[floor_idx];
    }
    let frac = k - floor_idx as f64;
    sorted[floor_idx] * (1.0 - frac) + sorted[ceil_idx] * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stats(seed: i64) -> Stats {
        Stats {
            delete_hits: seed,
            delete_misses: seed * 2,
            get_hits: seed * 3,
            get_misses: seed * 5,
            key_collisions: seed * 7,
            sets_total: seed * 11,
        }
    }

    #[test]
    fn merge_is_commutative() {
        let parts = vec![sample_stats(1), sample_stats(10), sample_stats(100)];

        let mut forward = Stats::default();
        for s in &parts {
            forward.add(s);
        }
        let mut backward = Stats::default();
        for s in parts.iter().rev() {
            backward.add(s);
        }
        assert_eq!(forward, backward);
        assert_eq!(forward.get_hits, 333);
        assert_eq!(forward.sets_total, 11 * 111);
    }

    #[test]
    fn ring_overwrites_oldest_when_full() {
        let sampler = LatencySampler::with_capacity(4);
        for ms in 1..=10u64 {
            sampler.record(Duration::from_millis(ms));
        }
        let metrics = sampler.metrics(Duration::from_secs(1));
        assert_eq!(metrics.samples, 4);
        assert_eq!(metrics.total_ops, 10);
        // Only the last four samples (7..=10ms) survive.
        assert!(metrics.min_us >= 7_000.0);
        assert!(metrics.max_us <= 10_000.0);
    }

    #[test]
    fn percentiles_interpolate() {
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
        assert!((percentile(&sorted, 0.50) - 50.5).abs() < 1e-9);
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 1.0), 100.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn empty_sampler_reports_zeroes() {
        let sampler = LatencySampler::with_capacity(16);
        let metrics = sampler.metrics(Duration::from_secs(1));
        assert_eq!(metrics.samples, 0);
        assert_eq!(metrics.min_us, 0.0);
        assert_eq!(metrics.p99_us, 0.0);
    }
}
