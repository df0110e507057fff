//! Metrics collection and reporting
//! Only responsible for metrics collection and export

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use shrinkwatch_system::{EntryOutcome, PassReport};

/// Which daemon produced a pass report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Compaction,
    Maintenance,
}

impl PassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassKind::Compaction => "compaction",
            PassKind::Maintenance => "maintenance",
        }
    }
}

/// Metrics collector for daemon statistics
pub struct MetricsCollector {
    start_time: Instant,
    passes: AtomicU64,
    compactions: AtomicU64,
    compaction_failures: AtomicU64,
    evictions: AtomicU64,
    total_compaction_time_ns: AtomicU64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            passes: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            compaction_failures: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            total_compaction_time_ns: AtomicU64::new(0),
        }
    }

    /// Record every entry outcome of a finished pass
    pub fn record_pass(&self, kind: PassKind, report: &PassReport, elapsed: Duration) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        histogram!("shrinkwatch_pass_duration_seconds", "kind" => kind.as_str())
            .record(elapsed.as_secs_f64());

        for entry in &report.entries {
            match &entry.outcome {
                EntryOutcome::Compacted(duration) => self.record_compaction(*duration),
                EntryOutcome::Failed(_) => self.record_failure(),
                EntryOutcome::Evicted(reason) => {
                    counter!("shrinkwatch_evictions_total", "reason" => reason.as_str())
                        .increment(1);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }
    }

    /// Record one successful compaction
    pub fn record_compaction(&self, duration: Duration) {
        counter!("shrinkwatch_compactions_total").increment(1);
        histogram!("shrinkwatch_compaction_duration_seconds").record(duration.as_secs_f64());
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.total_compaction_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record a failed compaction
    pub fn record_failure(&self) {
        counter!("shrinkwatch_compaction_failures_total").increment(1);
        self.compaction_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Update the registry size gauge
    pub fn update_registry_size(&self, entries: usize) {
        gauge!("shrinkwatch_registry_entries").set(entries as f64);
    }

    /// Get current statistics
    pub fn get_stats(&self) -> MetricsStats {
        MetricsStats {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            passes: self.passes.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            compaction_failures: self.compaction_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            total_compaction_time_ns: self.total_compaction_time_ns.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics statistics snapshot
#[derive(Debug, Clone)]
pub struct MetricsStats {
    pub uptime_seconds: u64,
    pub passes: u64,
    pub compactions: u64,
    pub compaction_failures: u64,
    pub evictions: u64,
    pub total_compaction_time_ns: u64,
}
