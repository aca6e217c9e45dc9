use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub performance: PerformanceConfig,
    pub inference: InferenceConfig,
    pub supervisor: SupervisorConfig,
    pub batching: BatchingConfig,
    pub metrics: MetricsConfig,
    pub scan: ScanConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discovery suspends until the queue has room.
    #[default]
    Block,
    /// Discovery discards the task and records a skip.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub io_workers: usize,
    #[serde(alias = "gpu_workers")]
    pub worker_count: usize,
    pub batch_size: usize,
    pub queue_max_size: usize,
    pub overflow: OverflowPolicy,
    /// How long an idle worker waits for a batch to fill.
    pub pop_timeout_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            io_workers: 4,
            worker_count: 2,
            batch_size: 128,
            queue_max_size: 10_000,
            overflow: OverflowPolicy::Block,
            pop_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub runtime: String,
    pub model_path: Option<PathBuf>,
    pub use_acceleration: bool,
    pub fallback_to_cpu: bool,
    pub confidence_threshold: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            runtime: "heuristic".to_string(),
            model_path: None,
            use_acceleration: true,
            fallback_to_cpu: true,
            confidence_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub interval_ms: u64,
    pub heartbeat_stale_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_restart_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            heartbeat_stale_ms: 30_000,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            max_restart_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub interval_ms: u64,
    pub reduction_factor: usize,
    pub cooldown_ms: u64,
    /// Clean pool-wide batches needed before the target is raised one step.
    pub recovery_batches: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            reduction_factor: 2,
            cooldown_ms: 5_000,
            recovery_batches: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// No port, no endpoint.
    pub port: Option<u16>,
    pub bind_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: None,
            bind_address: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub exclude: Vec<String>,
    pub include_hidden: bool,
    pub follow_links: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<String>,
}

impl PerformanceConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }
}

impl SupervisorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.heartbeat_stale_ms)
    }
}

impl BatchingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl AppConfig {
    /// Clamp values that would stall the pipeline.
    pub fn validate(mut self) -> Self {
        let perf = &mut self.performance;
        clamp_min("performance.io_workers", &mut perf.io_workers, 1);
        clamp_min("performance.worker_count", &mut perf.worker_count, 1);
        clamp_min("performance.batch_size", &mut perf.batch_size, 1);
        clamp_min("performance.queue_max_size", &mut perf.queue_max_size, 1);
        clamp_min("batching.reduction_factor", &mut self.batching.reduction_factor, 2);
        if !(0.0..=1.0).contains(&self.inference.confidence_threshold) {
            warn!(
                value = self.inference.confidence_threshold,
                "inference.confidence_threshold outside [0, 1], clamping"
            );
            self.inference.confidence_threshold = self.inference.confidence_threshold.clamp(0.0, 1.0);
        }
        self
    }
}

fn clamp_min(name: &str, value: &mut usize, min: usize) {
    if *value < min {
        warn!(setting = name, value = *value, min, "setting below minimum, raising");
        *value = min;
    }
}

/// Load from an optional file, then `HELIOS_*` environment overrides
/// (`HELIOS_PERFORMANCE__BATCH_SIZE=32`).
pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        settings = settings.add_source(config::File::with_name("config/helios").required(false));
    }
    settings = settings.add_source(
        config::Environment::with_prefix("HELIOS")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );
    let cfg = settings.build()?;
    let app: AppConfig = cfg.try_deserialize()?;
    Ok(app.validate())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.performance.worker_count, 2);
        assert_eq!(cfg.performance.batch_size, 128);
        assert_eq!(cfg.performance.queue_max_size, 10_000);
        assert_eq!(cfg.batching.reduction_factor, 2);
        assert_eq!(cfg.supervisor.max_restart_attempts, 5);
        assert!(cfg.metrics.port.is_none());
    }

    #[test]
    fn loads_toml_with_gpu_workers_alias() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("helios.toml");
        fs::write(
            &file,
            r#"
            [performance]
            gpu_workers = 6
            batch_size = 0

            [inference]
            runtime = "noop"
            fallback_to_cpu = false

            [metrics]
            port = 9100
            "#,
        )
        .unwrap();

        let cfg = load(Some(file.to_str().unwrap())).unwrap();
        assert_eq!(cfg.performance.worker_count, 6);
        assert_eq!(cfg.performance.batch_size, 1, "zero batch size is clamped");
        assert_eq!(cfg.inference.runtime, "noop");
        assert!(!cfg.inference.fallback_to_cpu);
        assert_eq!(cfg.metrics.port, Some(9100));
        assert_eq!(cfg.performance.io_workers, 4, "unset values keep defaults");
    }
}
