//! Destinations for finished analysis results.

use crate::models::AnalysisResult;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Receives every successful result. An `Err` drops that one result; the
/// pipeline keeps going.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn persist(&self, result: &AnalysisResult) -> anyhow::Result<()>;
}

/// Writes suggestions into the `suggestions` table.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn open(database_url: &str) -> anyhow::Result<Self> {
        let pool = storage::connect(database_url).await?;
        storage::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ResultSink for SqliteSink {
    async fn persist(&self, result: &AnalysisResult) -> anyhow::Result<()> {
        let row = storage::SuggestionRow {
            original_path: result.original_path.to_string_lossy().to_string(),
            suggested_path: result.suggested_path.to_string_lossy().to_string(),
            confidence: f64::from(result.confidence),
            tags_json: serde_json::to_string(&result.tags)?,
            processing_ms: result.processing_time.as_millis() as i64,
            worker_id: result.worker_id as i64,
            completed_at: result.completed_at.to_rfc3339(),
        };
        storage::insert_suggestion(&self.pool, &row).await
    }
}

/// Keeps results in memory, in completion order.
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Mutex<Vec<AnalysisResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<AnalysisResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.results.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn persist(&self, result: &AnalysisResult) -> anyhow::Result<()> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn persist(&self, result: &AnalysisResult) -> anyhow::Result<()> {
        info!(
            original = %result.original_path.display(),
            suggested = %result.suggested_path.display(),
            confidence = result.confidence,
            tags = ?result.tags,
            worker_id = result.worker_id,
            "suggestion"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::time::Duration;

    fn result() -> AnalysisResult {
        AnalysisResult {
            original_path: PathBuf::from("/in/song.mp3"),
            suggested_path: PathBuf::from("Media/Audio/Music/song.mp3"),
            confidence: 0.9,
            tags: vec!["audio".into(), "high_confidence".into()],
            processing_time: Duration::from_millis(12),
            worker_id: 3,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sqlite_sink_writes_rows() {
        let sink = SqliteSink::open("sqlite://file:sink_unit?mode=memory&cache=shared")
            .await
            .unwrap();
        sink.persist(&result()).await.unwrap();

        let rows = storage::list_suggestions(sink.pool()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].suggested_path, "Media/Audio/Music/song.mp3");
        assert_eq!(rows[0].worker_id, 3);
        let tags: Vec<String> = serde_json::from_str(&rows[0].tags_json).unwrap();
        assert_eq!(tags, vec!["audio", "high_confidence"]);
    }

    #[tokio::test]
    async fn memory_sink_collects() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.persist(&result()).await.unwrap();
        LogSink.persist(&result()).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.results()[0].worker_id, 3);
    }
}
