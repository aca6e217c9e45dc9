//! Storage layer: SQLite pool setup, migrations and suggestion rows.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let mut url = database_url.to_string();
    if !database_url.starts_with("sqlite:") {
        let path = std::path::PathBuf::from(database_url);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let norm = path.to_string_lossy().replace('\\', "/");
        if path.is_absolute() {
            url = format!("sqlite:///{}?mode=rwc", norm.trim_start_matches('/'));
        } else {
            url = format!("sqlite://{}?mode=rwc", norm);
        }
    }
    let mut opts = SqlitePoolOptions::new();
    if url.contains("memory") {
        opts = opts.max_connections(1);
    } else {
        opts = opts.max_connections(5);
    }
    tracing::debug!(%url, "connecting to result store");
    let pool = opts.connect(&url).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    // Idempotent; migrations are embedded from crates/storage/migrations.
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// One persisted categorization suggestion.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SuggestionRow {
    pub original_path: String,
    pub suggested_path: String,
    pub confidence: f64,
    pub tags_json: String,
    pub processing_ms: i64,
    pub worker_id: i64,
    pub completed_at: String,
}

pub async fn insert_suggestion(pool: &SqlitePool, row: &SuggestionRow) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO suggestions
            (original_path, suggested_path, confidence, tags_json, processing_ms, worker_id, completed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&row.original_path)
    .bind(&row.suggested_path)
    .bind(row.confidence)
    .bind(&row.tags_json)
    .bind(row.processing_ms)
    .bind(row.worker_id)
    .bind(&row.completed_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_suggestions(pool: &SqlitePool) -> anyhow::Result<Vec<SuggestionRow>> {
    let rows = sqlx::query_as::<_, SuggestionRow>(
        "SELECT original_path, suggested_path, confidence, tags_json, processing_ms, worker_id, completed_at \
         FROM suggestions ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
