use chrono::{DateTime, Utc};
use providers::InferenceInput;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Sequence number assigned at discovery; unique within one run.
pub type TaskId = u64;
pub type WorkerId = usize;

/// One file waiting for analysis. Moves discovery → queue → worker; never cloned
/// across stages.
#[derive(Debug, PartialEq, Serialize)]
pub struct FileTask {
    pub id: TaskId,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub extension: String,
    pub relative_path: PathBuf,
    pub discovered_at: DateTime<Utc>,
}

impl FileTask {
    pub fn new(id: TaskId, root: &Path, path: PathBuf, size_bytes: u64) -> Self {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        let relative_path = path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.clone());
        Self {
            id,
            path,
            size_bytes,
            extension,
            relative_path,
            discovered_at: Utc::now(),
        }
    }

    pub fn as_input(&self) -> InferenceInput<'_> {
        InferenceInput {
            path: &self.path,
            relative_path: &self.relative_path,
            extension: &self.extension,
            size_bytes: self.size_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub original_path: PathBuf,
    pub suggested_path: PathBuf,
    pub confidence: f32,
    pub tags: Vec<String>,
    #[serde(with = "duration_ms")]
    pub processing_time: Duration,
    pub worker_id: WorkerId,
    pub completed_at: DateTime<Utc>,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Terminal per-file failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InferenceFailed,
    ResourceExhausted,
    InvalidInput,
    WorkerCrash,
    /// Held by a worker that was force-stopped at shutdown.
    Aborted,
}

impl FailureKind {
    pub const ALL: [FailureKind; 5] = [
        FailureKind::InferenceFailed,
        FailureKind::ResourceExhausted,
        FailureKind::InvalidInput,
        FailureKind::WorkerCrash,
        FailureKind::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InferenceFailed => "inference_failed",
            FailureKind::ResourceExhausted => "resource_exhausted",
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::WorkerCrash => "worker_crash",
            FailureKind::Aborted => "aborted",
        }
    }
}

impl From<&providers::InferenceError> for FailureKind {
    fn from(err: &providers::InferenceError) -> Self {
        match err {
            providers::InferenceError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
            providers::InferenceError::InferenceFailed(_) => FailureKind::InferenceFailed,
            providers::InferenceError::InvalidInput(_) => FailureKind::InvalidInput,
        }
    }
}

/// Why a discovered file never reached a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Unreadable,
    QueueRejected,
    QueueShutdown,
    NoLiveWorkers,
}

impl SkipReason {
    pub const ALL: [SkipReason; 4] = [
        SkipReason::Unreadable,
        SkipReason::QueueRejected,
        SkipReason::QueueShutdown,
        SkipReason::NoLiveWorkers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Unreadable => "unreadable",
            SkipReason::QueueRejected => "queue_rejected",
            SkipReason::QueueShutdown => "queue_shutdown",
            SkipReason::NoLiveWorkers => "no_live_workers",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Idle,
    Processing,
    Failed,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Starting => "starting",
            WorkerState::Idle => "idle",
            WorkerState::Processing => "processing",
            WorkerState::Failed => "failed",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Supervisor bookkeeping for one worker slot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    /// Bumped on every restart; heartbeats from older generations are ignored.
    pub generation: u64,
    pub state: WorkerState,
    #[serde(skip)]
    pub last_heartbeat: Instant,
    pub restart_count: u32,
    /// Restarts since the slot last reached `Idle`.
    pub consecutive_failures: u32,
    pub batch_size: usize,
    pub items_processed: u64,
    pub throughput: f64,
    /// Slot excluded from the pool after too many failed restarts.
    pub permanently_failed: bool,
    pub last_error: Option<String>,
}

impl WorkerRecord {
    pub fn new(worker_id: WorkerId, generation: u64, batch_size: usize) -> Self {
        Self {
            worker_id,
            generation,
            state: WorkerState::Starting,
            last_heartbeat: Instant::now(),
            restart_count: 0,
            consecutive_failures: 0,
            batch_size,
            items_processed: 0,
            throughput: 0.0,
            permanently_failed: false,
            last_error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.permanently_failed && matches!(self.state, WorkerState::Idle | WorkerState::Processing)
    }
}

/// Liveness report sent by a worker to the supervisor.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    pub generation: u64,
    pub state: WorkerState,
    pub batch_size: usize,
    pub items_processed: u64,
    pub throughput: f64,
    pub error: Option<String>,
    pub at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthSnapshot {
    pub active_workers: usize,
    pub queue_depth: usize,
    pub batch_size: usize,
    /// Items per second summed over active workers.
    pub throughput: f64,
    pub workers: Vec<WorkerRecord>,
}

impl SystemHealthSnapshot {
    pub fn from_records(records: Vec<WorkerRecord>, queue_depth: usize, batch_size: usize) -> Self {
        let active: Vec<&WorkerRecord> = records.iter().filter(|r| r.is_active()).collect();
        Self {
            active_workers: active.len(),
            queue_depth,
            batch_size,
            throughput: active.iter().map(|r| r.throughput).sum(),
            workers: records,
        }
    }
}
