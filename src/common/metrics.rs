//! Migration metrics
//!
//! Prometheus-compatible counters, gauges and histograms for the coordinator
//! and the shards it drives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for durations (in milliseconds)
const DURATION_BUCKETS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// A simple histogram implementation for duration tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&DURATION_BUCKETS)
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
        // Stored as microseconds for precision
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, d: Duration) {
        self.observe(d.as_secs_f64() * 1000.0);
    }

    /// Cumulative buckets, `+Inf` last
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
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
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
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // Saturating: a restart may resume operations this process never counted.
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    /// Rejected writes per namespace
    rejected_writes: Mutex<HashMap<String, u64>>,

    pub operations_started: Counter,
    pub operations_committed: Counter,
    pub operations_aborted: Counter,
    pub operations_in_flight: Gauge,

    pub critical_section_duration: Histogram,
    pub critical_section_overruns: Counter,
    pub critical_section_acquire_failures: Counter,

    pub invariant_violations: Counter,
    pub participant_rpc_errors: Counter,

    pub documents_cloned: Counter,
    pub mutations_applied: Counter,
    pub mutations_skipped: Counter,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            rejected_writes: Mutex::new(HashMap::new()),
            operations_started: Counter::new(),
            operations_committed: Counter::new(),
            operations_aborted: Counter::new(),
            operations_in_flight: Gauge::new(),
            critical_section_duration: Histogram::new(),
            critical_section_overruns: Counter::new(),
            critical_section_acquire_failures: Counter::new(),
            invariant_violations: Counter::new(),
            participant_rpc_errors: Counter::new(),
            documents_cloned: Counter::new(),
            mutations_applied: Counter::new(),
            mutations_skipped: Counter::new(),
            start_time: Instant::now(),
        }
    }

    /// Record a write rejected by a critical section
    pub fn record_rejected_write(&self, namespace: &str) {
        let mut rejected = self
            .rejected_writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *rejected.entry(namespace.to_string()).or_insert(0) += 1;
    }

    pub fn rejected_writes(&self, namespace: &str) -> u64 {
        self.rejected_writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(namespace)
            .copied()
            .unwrap_or(0)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        let counters: [(&str, &str, u64); 10] = [
            (
                "rangeshift_operations_started_total",
                "Operations started",
                self.operations_started.get(),
            ),
            (
                "rangeshift_operations_committed_total",
                "Operations committed",
                self.operations_committed.get(),
            ),
            (
                "rangeshift_operations_aborted_total",
                "Operations aborted",
                self.operations_aborted.get(),
            ),
            (
                "rangeshift_critical_section_overruns_total",
                "Critical sections held past their bound",
                self.critical_section_overruns.get(),
            ),
            (
                "rangeshift_critical_section_acquire_failures_total",
                "All-donor critical section acquisitions rolled back",
                self.critical_section_acquire_failures.get(),
            ),
            (
                "rangeshift_invariant_violations_total",
                "Coordination invariant violations",
                self.invariant_violations.get(),
            ),
            (
                "rangeshift_participant_rpc_errors_total",
                "Failed participant RPCs",
                self.participant_rpc_errors.get(),
            ),
            (
                "rangeshift_documents_cloned_total",
                "Documents copied during initial clone",
                self.documents_cloned.get(),
            ),
            (
                "rangeshift_mutations_applied_total",
                "Change stream mutations applied",
                self.mutations_applied.get(),
            ),
            (
                "rangeshift_mutations_skipped_total",
                "Replayed mutations skipped by sequence gating",
                self.mutations_skipped.get(),
            ),
        ];

        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        out.push_str("# HELP rangeshift_operations_in_flight Operations not yet done\n");
        out.push_str("# TYPE rangeshift_operations_in_flight gauge\n");
        let _ = writeln!(
            out,
            "rangeshift_operations_in_flight {}",
            self.operations_in_flight.get()
        );

        out.push_str("# HELP rangeshift_uptime_seconds Process uptime in seconds\n");
        out.push_str("# TYPE rangeshift_uptime_seconds gauge\n");
        let _ = writeln!(out, "rangeshift_uptime_seconds {}", self.uptime_seconds());

        out.push_str("# HELP rangeshift_rejected_writes_total Writes rejected by critical sections\n");
        out.push_str("# TYPE rangeshift_rejected_writes_total counter\n");
        {
            let rejected = self
                .rejected_writes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (ns, count) in rejected.iter() {
                let _ = writeln!(
                    out,
                    "rangeshift_rejected_writes_total{{namespace=\"{}\"}} {}",
                    ns, count
                );
            }
        }

        out.push_str(
            "# HELP rangeshift_critical_section_duration_ms Time writes were blocked per operation\n",
        );
        out.push_str("# TYPE rangeshift_critical_section_duration_ms histogram\n");
        for (le, count) in self.critical_section_duration.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(
                    out,
                    "rangeshift_critical_section_duration_ms_bucket{{le=\"+Inf\"}} {}",
                    count
                );
            } else {
                let _ = writeln!(
                    out,
                    "rangeshift_critical_section_duration_ms_bucket{{le=\"{}\"}} {}",
                    le, count
                );
            }
        }
        let _ = writeln!(
            out,
            "rangeshift_critical_section_duration_ms_sum {}",
            self.critical_section_duration.sum()
        );
        let _ = writeln!(
            out,
            "rangeshift_critical_section_duration_ms_count {}",
            self.critical_section_duration.count()
        );

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(50_000.0);

        assert_eq!(hist.count(), 3);

        let buckets = hist.get_buckets();
        assert_eq!(buckets.last().unwrap().1, 3);
        // 5ms and 50ms land at or below the 50ms boundary
        let at_50 = buckets.iter().find(|(le, _)| *le == 50.0).unwrap();
        assert_eq!(at_50.1, 2);
    }

    #[test]
    fn test_gauge_saturates() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_rejected_writes_per_namespace() {
        let registry = MetricsRegistry::new();
        registry.record_rejected_write("app.users");
        registry.record_rejected_write("app.users");
        registry.record_rejected_write("app.orders");

        assert_eq!(registry.rejected_writes("app.users"), 2);
        assert_eq!(registry.rejected_writes("app.orders"), 1);
        assert_eq!(registry.rejected_writes("app.other"), 0);

        let text = registry.to_prometheus();
        assert!(text.contains("rangeshift_rejected_writes_total{namespace=\"app.users\"} 2"));
    }
}
