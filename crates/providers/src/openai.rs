use crate::{
    BatchOutcome, EngineOptions, InferenceEngine, InferenceError, InferenceInput,
    InferenceRuntime, ModelLoadError, Suggestion,
};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    /// Used when no `model_path` is configured.
    pub default_model: String,
}

/// OpenAI-compatible chat completion backend. `model_path` is read as the
/// model id, acceleration is the server's business.
#[derive(Clone)]
pub struct OpenAiRuntime {
    client: Client,
    cfg: Arc<OpenAiConfig>,
}

impl OpenAiRuntime {
    pub fn new(cfg: OpenAiConfig) -> Self {
        Self {
            client: Client::new(),
            cfg: Arc::new(cfg),
        }
    }
}

#[async_trait::async_trait]
impl InferenceRuntime for OpenAiRuntime {
    async fn initialize(
        &self,
        options: &EngineOptions,
    ) -> Result<Box<dyn InferenceEngine>, ModelLoadError> {
        if self.cfg.base_url.trim().is_empty() {
            return Err(ModelLoadError::Misconfigured("empty base url".into()));
        }
        let model = options
            .model_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.cfg.default_model.clone());
        Ok(Box::new(OpenAiEngine {
            client: self.client.clone(),
            cfg: self.cfg.clone(),
            model,
        }))
    }
}

pub struct OpenAiEngine {
    client: Client,
    cfg: Arc<OpenAiConfig>,
    model: String,
}

#[async_trait::async_trait]
impl InferenceEngine for OpenAiEngine {
    async fn infer(&mut self, batch: &[InferenceInput<'_>]) -> BatchOutcome {
        #[derive(serde::Serialize)]
        struct ChatMessage<'a> {
            role: &'static str,
            content: &'a str,
        }
        #[derive(serde::Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            messages: Vec<ChatMessage<'a>>,
            temperature: f32,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChatMessageResp,
        }
        #[derive(Deserialize)]
        struct ChatMessageResp {
            content: String,
        }
        #[derive(Deserialize)]
        struct ChatApiResponse {
            choices: Vec<Choice>,
        }

        let prompt = build_prompt(batch);
        tracing::debug!(model = %self.model, items = batch.len(), "chat categorization request");
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
            temperature: 0.0,
        };

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.cfg.base_url))
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(%status, "chat completion rejected");
            return Err(classify_http_failure(status, &text));
        }

        let parsed: ChatApiResponse = resp
            .json()
            .await
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        parse_suggestions(&content, batch.len())
    }
}

fn build_prompt(batch: &[InferenceInput<'_>]) -> String {
    let mut files = String::new();
    for (i, input) in batch.iter().enumerate() {
        files.push_str(&format!(
            "{}. name: {} | extension: {} | size_bytes: {} | path: {}\n",
            i + 1,
            input.file_name(),
            input.extension,
            input.size_bytes,
            input.relative_path.display()
        ));
    }
    format!(
        "Categorize each file below. Reply with ONLY a JSON array containing one object per \
         file, in the same order, each shaped as \
         {{\"categorized_path\": \"Category/Subcategory/filename.ext\", \"confidence\": 0.0-1.0, \
         \"tags\": [\"tag\"]}}.\n\n{files}"
    )
}

fn classify_http_failure(status: StatusCode, body: &str) -> InferenceError {
    let lowered = body.to_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::SERVICE_UNAVAILABLE
        || lowered.contains("out of memory")
    {
        InferenceError::ResourceExhausted(format!("{status}: {body}"))
    } else if status == StatusCode::BAD_REQUEST {
        InferenceError::InvalidInput(format!("{status}: {body}"))
    } else {
        InferenceError::InferenceFailed(format!("{status}: {body}"))
    }
}

/// Parse the model reply. Items that do not match the expected shape fail
/// individually; a reply that is not an array of the right length fails the call.
pub(crate) fn parse_suggestions(content: &str, expected: usize) -> BatchOutcome {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let values: Vec<serde_json::Value> = serde_json::from_str(trimmed)
        .map_err(|e| InferenceError::InferenceFailed(format!("reply is not a JSON array: {e}")))?;
    if values.len() != expected {
        return Err(InferenceError::InferenceFailed(format!(
            "expected {expected} suggestions, got {}",
            values.len()
        )));
    }
    Ok(values.iter().map(validate_item).collect())
}

fn validate_item(value: &serde_json::Value) -> Result<Suggestion, InferenceError> {
    let path = value
        .get("categorized_path")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| InferenceError::InvalidInput("missing categorized_path".into()))?;
    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| InferenceError::InvalidInput("missing confidence".into()))?;
    let tags = value
        .get("tags")
        .and_then(|v| v.as_array())
        .ok_or_else(|| InferenceError::InvalidInput("missing tags".into()))?
        .iter()
        .filter_map(|t| t.as_str().map(str::to_string))
        .collect();
    Ok(Suggestion {
        suggested_path: PathBuf::from(path),
        confidence: confidence.clamp(0.0, 1.0) as f32,
        tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_reply_and_clamps_confidence() {
        let reply = "```json\n[{\"categorized_path\": \"Docs/a.txt\", \"confidence\": 1.4, \"tags\": [\"doc\"]}]\n```";
        let out = parse_suggestions(reply, 1).unwrap();
        let first = out[0].as_ref().unwrap();
        assert_eq!(first.suggested_path, PathBuf::from("Docs/a.txt"));
        assert_eq!(first.confidence, 1.0);
        assert_eq!(first.tags, vec!["doc".to_string()]);
    }

    #[test]
    fn malformed_item_fails_alone() {
        let reply = r#"[{"categorized_path": "A/b.png", "confidence": 0.5, "tags": []}, {"confidence": 0.2}]"#;
        let out = parse_suggestions(reply, 2).unwrap();
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(InferenceError::InvalidInput(_))));
    }

    #[test]
    fn wrong_length_fails_the_call() {
        assert!(parse_suggestions("[]", 2).is_err());
    }

    #[test]
    fn overload_statuses_map_to_exhaustion() {
        assert!(matches!(
            classify_http_failure(StatusCode::TOO_MANY_REQUESTS, ""),
            InferenceError::ResourceExhausted(_)
        ));
        assert!(matches!(
            classify_http_failure(StatusCode::INTERNAL_SERVER_ERROR, "CUDA out of memory"),
            InferenceError::ResourceExhausted(_)
        ));
        assert!(matches!(
            classify_http_failure(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            InferenceError::InferenceFailed(_)
        ));
    }
}
