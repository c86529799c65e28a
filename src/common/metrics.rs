//! Replication metrics
//!
//! Prometheus-compatible counters for the write pipeline:
//! - write latency histogram
//! - committed / rejected writes by failure kind
//! - follower-side replicate and commit traffic
//! - membership and role gauges

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // stored as microseconds
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(le, count)` pairs, ending with `+Inf`
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    pub writes_committed: Counter,
    pub quorum_failures: Counter,
    pub version_conflicts: Counter,
    pub role_violations: Counter,
    pub peer_failures: Counter,
    pub replicates_received: Counter,
    pub commits_applied: Counter,
    pub membership_refreshes: Counter,
    pub elections: Counter,

    pub cluster_size: Gauge,
    pub leaders: Gauge,

    pub write_latency: Histogram,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            writes_committed: Counter::new(),
            quorum_failures: Counter::new(),
            version_conflicts: Counter::new(),
            role_violations: Counter::new(),
            peer_failures: Counter::new(),
            replicates_received: Counter::new(),
            commits_applied: Counter::new(),
            membership_refreshes: Counter::new(),
            elections: Counter::new(),
            cluster_size: Gauge::new(),
            leaders: Gauge::new(),
            write_latency: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    /// Record the outcome of a leader write
    pub fn record_write(&self, duration: Duration, result: &crate::Result<u64>) {
        self.write_latency.observe(duration.as_secs_f64() * 1000.0);
        match result {
            Ok(_) => self.writes_committed.inc(),
            Err(crate::Error::QuorumNotReached { .. }) => self.quorum_failures.inc(),
            Err(crate::Error::VersionConflict { .. }) => self.version_conflicts.inc(),
            Err(crate::Error::RoleViolation(_)) => self.role_violations.inc(),
            Err(_) => {}
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("quorumkv_writes_committed_total", "Writes committed by this process", &self.writes_committed),
            ("quorumkv_quorum_failures_total", "Writes rejected for lack of quorum", &self.quorum_failures),
            ("quorumkv_version_conflicts_total", "Writes rejected by conflict detection", &self.version_conflicts),
            ("quorumkv_role_violations_total", "Requests rejected for the wrong role", &self.role_violations),
            ("quorumkv_peer_failures_total", "Replicate or commit calls that failed", &self.peer_failures),
            ("quorumkv_replicates_received_total", "Replicate calls accepted as follower", &self.replicates_received),
            ("quorumkv_commits_applied_total", "Commits applied as follower", &self.commits_applied),
            ("quorumkv_membership_refreshes_total", "Worker set refreshes", &self.membership_refreshes),
            ("quorumkv_elections_total", "Election rounds evaluated", &self.elections),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        let gauges = [
            ("quorumkv_cluster_size", "Registered followers", &self.cluster_size),
            ("quorumkv_leaders", "Local nodes currently holding the leader role", &self.leaders),
        ];
        for (name, help, gauge) in gauges {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, gauge.get());
        }

        out.push_str("# HELP quorumkv_uptime_seconds Process uptime in seconds\n");
        out.push_str("# TYPE quorumkv_uptime_seconds gauge\n");
        let _ = writeln!(out, "quorumkv_uptime_seconds {}", self.uptime_seconds());

        out.push_str("# HELP quorumkv_write_duration_ms Leader write duration in milliseconds\n");
        out.push_str("# TYPE quorumkv_write_duration_ms histogram\n");
        for (le, count) in self.write_latency.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "quorumkv_write_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "quorumkv_write_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "quorumkv_write_duration_ms_sum {}", self.write_latency.sum());
        let _ = writeln!(out, "quorumkv_write_duration_ms_count {}", self.write_latency.count());

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
