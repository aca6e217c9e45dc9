use crate::{
    BatchOutcome, EngineOptions, InferenceEngine, InferenceInput, InferenceRuntime,
    ModelLoadError, Suggestion,
};

/// Leaves every file where it is. Useful for measuring pipeline overhead.
#[derive(Debug, Default)]
pub struct NoopRuntime;

#[async_trait::async_trait]
impl InferenceRuntime for NoopRuntime {
    async fn initialize(
        &self,
        _options: &EngineOptions,
    ) -> Result<Box<dyn InferenceEngine>, ModelLoadError> {
        Ok(Box::new(NoopEngine))
    }
}

#[derive(Debug, Default)]
pub struct NoopEngine;

#[async_trait::async_trait]
impl InferenceEngine for NoopEngine {
    async fn infer(&mut self, batch: &[InferenceInput<'_>]) -> BatchOutcome {
        Ok(batch
            .iter()
            .map(|input| {
                Ok(Suggestion {
                    suggested_path: input.relative_path.to_path_buf(),
                    confidence: 0.0,
                    tags: vec!["unclassified".to_string()],
                })
            })
            .collect())
    }
}
