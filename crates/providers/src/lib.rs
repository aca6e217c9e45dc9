use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub mod heuristic;
pub mod noop;
pub mod openai;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown inference runtime: {0}")]
    UnknownRuntime(String),
}

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("model not found at {0}")]
    NotFound(PathBuf),
    #[error("model at {path} could not be parsed: {reason}")]
    Invalid { path: PathBuf, reason: String },
    #[error("{0} acceleration is not available for this runtime")]
    AccelerationUnavailable(Acceleration),
    #[error("runtime misconfigured: {0}")]
    Misconfigured(String),
}

/// Per-call failure reported by an engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    /// The batch did not fit; the caller should retry with fewer items.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acceleration {
    Gpu,
    Cpu,
}

impl std::fmt::Display for Acceleration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acceleration::Gpu => f.write_str("gpu"),
            Acceleration::Cpu => f.write_str("cpu"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub model_path: Option<PathBuf>,
    pub acceleration: Acceleration,
    /// Passed through untouched; engines decide what it means.
    pub confidence_threshold: f32,
}

/// Borrowed view of one file handed to an engine.
#[derive(Debug, Clone, Copy)]
pub struct InferenceInput<'a> {
    pub path: &'a Path,
    pub relative_path: &'a Path,
    pub extension: &'a str,
    pub size_bytes: u64,
}

impl InferenceInput<'_> {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub suggested_path: PathBuf,
    pub confidence: f32,
    pub tags: Vec<String>,
}

/// Outcome of one `infer` call: either the whole call failed, or every input
/// got its own result (same order, same length).
pub type BatchOutcome = Result<Vec<Result<Suggestion, InferenceError>>, InferenceError>;

#[async_trait::async_trait]
pub trait InferenceEngine: Send {
    async fn infer(&mut self, batch: &[InferenceInput<'_>]) -> BatchOutcome;

    /// Engines that only take one item per call return false.
    fn supports_batching(&self) -> bool {
        true
    }
}

#[async_trait::async_trait]
pub trait InferenceRuntime: Send + Sync {
    async fn initialize(
        &self,
        options: &EngineOptions,
    ) -> Result<Box<dyn InferenceEngine>, ModelLoadError>;
}

#[derive(Default, Clone)]
pub struct RuntimeRegistry {
    runtimes: HashMap<String, Arc<dyn InferenceRuntime>>,
    pub preferred: Option<String>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in runtime. `openai` is only present when
    /// `OPENAI_API_KEY` and `OPENAI_BASE_URL` are set.
    pub fn with_builtin() -> Self {
        let mut reg = Self::new()
            .with_runtime("heuristic", Arc::new(heuristic::HeuristicRuntime))
            .with_runtime("noop", Arc::new(noop::NoopRuntime));

        if let (Some(key), Some(base)) = (
            std::env::var_os("OPENAI_API_KEY"),
            std::env::var_os("OPENAI_BASE_URL"),
        ) {
            let runtime = openai::OpenAiRuntime::new(openai::OpenAiConfig {
                api_key: key.to_string_lossy().into_owned(),
                base_url: base.to_string_lossy().into_owned(),
                default_model: "gpt-4o-mini".to_string(),
            });
            reg = reg.with_runtime("openai", Arc::new(runtime));
        }
        reg
    }

    pub fn with_runtime(mut self, name: &str, runtime: Arc<dyn InferenceRuntime>) -> Self {
        self.runtimes.insert(name.to_string(), runtime);
        self
    }

    pub fn set_preferred(mut self, name: &str) -> Self {
        self.preferred = Some(name.to_string());
        self
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runtimes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn runtime(&self, name: Option<&str>) -> Result<Arc<dyn InferenceRuntime>, ProviderError> {
        let key = name
            .map(str::to_string)
            .or_else(|| self.preferred.clone())
            .ok_or_else(|| ProviderError::UnknownRuntime("no runtime configured".into()))?;
        self.runtimes
            .get(&key)
            .cloned()
            .ok_or(ProviderError::UnknownRuntime(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_preferred_runtime() {
        let reg = RuntimeRegistry::with_builtin().set_preferred("noop");
        assert!(reg.runtime(None).is_ok());
        assert!(reg.runtime(Some("heuristic")).is_ok());
        assert!(matches!(
            reg.runtime(Some("onnx")),
            Err(ProviderError::UnknownRuntime(name)) if name == "onnx"
        ));
    }

    #[test]
    fn registry_without_preference_fails() {
        let reg = RuntimeRegistry::new();
        assert!(reg.runtime(None).is_err());
    }
}
