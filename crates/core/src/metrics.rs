use crate::models::{FailureKind, SkipReason};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

pub const LATENCY_BUCKETS: [f64; 8] = [0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [f64],
    /// One slot per bound plus the +Inf overflow slot. Not cumulative.
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let secs = value.as_secs_f64();
        let slot = self
            .bounds
            .iter()
            .position(|b| secs <= *b)
            .unwrap_or(self.bounds.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String, name: &str, help: &str) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        let mut cumulative = 0u64;
        for (i, bound) in self.bounds.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
        }
        cumulative += self.buckets[self.bounds.len()].load(Ordering::Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(out, "{name}_sum {sum}");
        let _ = writeln!(out, "{name}_count {}", self.count());
    }
}

#[derive(Debug)]
pub struct MetricsRegistry {
    files_discovered: AtomicU64,
    files_processed: AtomicU64,
    failures: [AtomicU64; FailureKind::ALL.len()],
    skipped: [AtomicU64; SkipReason::ALL.len()],
    discovery_errors: AtomicU64,
    sink_failures: AtomicU64,
    worker_restarts: AtomicU64,
    batch_reductions: AtomicU64,
    inference_latency: Histogram,
    queue_depth: AtomicUsize,
    queue_high_water: AtomicUsize,
    batch_size: AtomicUsize,
    active_workers: AtomicUsize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            files_discovered: AtomicU64::new(0),
            files_processed: AtomicU64::new(0),
            failures: Default::default(),
            skipped: Default::default(),
            discovery_errors: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
            batch_reductions: AtomicU64::new(0),
            inference_latency: Histogram::new(&LATENCY_BUCKETS),
            queue_depth: AtomicUsize::new(0),
            queue_high_water: AtomicUsize::new(0),
            batch_size: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
        }
    }

    pub fn file_discovered(&self) {
        self.files_discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_processed(&self) {
        self.files_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_failed(&self, kind: FailureKind) {
        self.failures[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_skipped(&self, reason: SkipReason) {
        self.skipped[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn discovery_error(&self) {
        self.discovery_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_restarted(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_reduced(&self) {
        self.batch_reductions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_latency(&self, per_item: Duration) {
        self.inference_latency.observe(per_item);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
        self.queue_high_water.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn set_batch_size(&self, size: usize) {
        self.batch_size.store(size, Ordering::Relaxed);
    }

    pub fn set_active_workers(&self, count: usize) {
        self.active_workers.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            files_discovered: self.files_discovered.load(Ordering::Relaxed),
            files_processed: self.files_processed.load(Ordering::Relaxed),
            failures: FailureKind::ALL
                .iter()
                .map(|k| (k.as_str(), self.failures[*k as usize].load(Ordering::Relaxed)))
                .collect(),
            skipped: SkipReason::ALL
                .iter()
                .map(|r| (r.as_str(), self.skipped[*r as usize].load(Ordering::Relaxed)))
                .collect(),
            discovery_errors: self.discovery_errors.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            batch_reductions: self.batch_reductions.load(Ordering::Relaxed),
            latency_observations: self.inference_latency.count(),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            queue_high_water: self.queue_high_water.load(Ordering::Relaxed),
            batch_size: self.batch_size.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
        }
    }

    /// Full snapshot in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::with_capacity(2048);

        counter(
            &mut out,
            "helios_files_discovered_total",
            "Files discovered by the scanner",
            snap.files_discovered,
        );
        counter(
            &mut out,
            "helios_files_processed_total",
            "Files that produced a categorization suggestion",
            snap.files_processed,
        );
        labelled_counter(
            &mut out,
            "helios_failures_total",
            "Files that reached a terminal failure, by kind",
            "kind",
            &snap.failures,
        );
        labelled_counter(
            &mut out,
            "helios_files_skipped_total",
            "Discovered files discarded before inference, by reason",
            "reason",
            &snap.skipped,
        );
        counter(
            &mut out,
            "helios_discovery_errors_total",
            "Directory or entry reads that failed during discovery",
            snap.discovery_errors,
        );
        counter(
            &mut out,
            "helios_sink_failures_total",
            "Results dropped because the sink rejected them",
            snap.sink_failures,
        );
        counter(
            &mut out,
            "helios_worker_restarts_total",
            "Worker restarts performed by the supervisor",
            snap.worker_restarts,
        );
        counter(
            &mut out,
            "helios_batch_size_reductions_total",
            "Pool-wide batch size reductions",
            snap.batch_reductions,
        );
        self.inference_latency.render(
            &mut out,
            "helios_inference_latency_seconds",
            "Per-item inference latency",
        );
        gauge(&mut out, "helios_queue_depth", "Tasks waiting in the work queue", snap.queue_depth);
        gauge(
            &mut out,
            "helios_queue_high_water",
            "Highest observed queue depth",
            snap.queue_high_water,
        );
        gauge(&mut out, "helios_batch_size", "Current pool-wide target batch size", snap.batch_size);
        gauge(&mut out, "helios_active_workers", "Workers idle or processing", snap.active_workers);
        out
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn labelled_counter(
    out: &mut String,
    name: &str,
    help: &str,
    label: &str,
    values: &BTreeMap<&'static str, u64>,
) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    for (key, value) in values {
        let _ = writeln!(out, "{name}{{{label}=\"{key}\"}} {value}");
    }
}

fn gauge(out: &mut String, name: &str, help: &str, value: usize) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub files_discovered: u64,
    pub files_processed: u64,
    pub failures: BTreeMap<&'static str, u64>,
    pub skipped: BTreeMap<&'static str, u64>,
    pub discovery_errors: u64,
    pub sink_failures: u64,
    pub worker_restarts: u64,
    pub batch_reductions: u64,
    pub latency_observations: u64,
    pub queue_depth: usize,
    pub queue_high_water: usize,
    pub batch_size: usize,
    pub active_workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn concurrent_updates_are_not_lost() {
        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        r.file_processed();
                        r.file_failed(FailureKind::InvalidInput);
                        r.observe_latency(Duration::from_millis(3));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = registry.snapshot();
        assert_eq!(snap.files_processed, 8000);
        assert_eq!(snap.failures["invalid_input"], 8000);
        assert_eq!(snap.latency_observations, 8000);
    }

    #[test]
    fn render_emits_cumulative_buckets_and_labels() {
        let registry = MetricsRegistry::new();
        registry.observe_latency(Duration::from_micros(500));
        registry.observe_latency(Duration::from_millis(300));
        registry.observe_latency(Duration::from_secs(30));
        registry.file_skipped(SkipReason::QueueShutdown);
        registry.set_queue_depth(4);
        registry.set_queue_depth(1);

        let text = registry.render();
        assert!(text.contains("helios_inference_latency_seconds_bucket{le=\"0.001\"} 1"));
        assert!(text.contains("helios_inference_latency_seconds_bucket{le=\"0.5\"} 2"));
        assert!(text.contains("helios_inference_latency_seconds_bucket{le=\"+Inf\"} 3"));
        assert!(text.contains("helios_inference_latency_seconds_count 3"));
        assert!(text.contains("helios_files_skipped_total{reason=\"queue_shutdown\"} 1"));
        assert!(text.contains("helios_queue_depth 1"));
        assert!(text.contains("helios_queue_high_water 4"));
        assert!(text.contains("# TYPE helios_active_workers gauge"));
    }
}
