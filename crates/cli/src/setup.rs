//! Turning config and flags into pipeline collaborators.

use helios_core::config::AppConfig;
use helios_core::sink::{LogSink, ResultSink, SqliteSink};
use providers::RuntimeRegistry;
use std::sync::Arc;
use tracing::info;

/// Command-line values that take precedence over the loaded config.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub exclude: Vec<String>,
    pub include_hidden: bool,
    pub metrics_port: Option<u16>,
    pub database: Option<String>,
}

pub fn apply_overrides(cfg: &mut AppConfig, overrides: &Overrides) {
    cfg.scan.exclude.extend(overrides.exclude.iter().cloned());
    if overrides.include_hidden {
        cfg.scan.include_hidden = true;
    }
    if overrides.metrics_port.is_some() {
        cfg.metrics.port = overrides.metrics_port;
    }
    if overrides.database.is_some() {
        cfg.database.path = overrides.database.clone();
    }
}

/// SQLite when a database is configured, otherwise one log line per result.
pub async fn build_sink(cfg: &AppConfig) -> anyhow::Result<Arc<dyn ResultSink>> {
    match &cfg.database.path {
        Some(path) => {
            let sink = SqliteSink::open(path).await?;
            info!(database = %path, "writing suggestions to sqlite");
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(LogSink)),
    }
}

pub fn runtime_registry(cfg: &AppConfig) -> RuntimeRegistry {
    RuntimeRegistry::with_builtin().set_preferred(&cfg.inference.runtime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_extend_config() {
        let mut cfg = AppConfig::default();
        cfg.scan.exclude = vec!["**/target".into()];
        apply_overrides(
            &mut cfg,
            &Overrides {
                exclude: vec!["**/*.tmp".into()],
                include_hidden: true,
                metrics_port: Some(9898),
                database: None,
            },
        );
        assert_eq!(cfg.scan.exclude, vec!["**/target", "**/*.tmp"]);
        assert!(cfg.scan.include_hidden);
        assert_eq!(cfg.metrics.port, Some(9898));
        assert!(cfg.database.path.is_none());
    }

    #[test]
    fn builtin_runtimes_are_registered() {
        let names = runtime_registry(&AppConfig::default()).names();
        assert!(names.contains(&"heuristic".to_string()));
        assert!(names.contains(&"noop".to_string()));
    }
}
