//! Exactly-once outcome accounting for discovered files.

use crate::metrics::MetricsRegistry;
use crate::models::{FailureKind, SkipReason, TaskId, WorkerId};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct LedgerState {
    next_id: TaskId,
    outstanding: HashSet<TaskId>,
    discovery_done: bool,
    discovered: u64,
    succeeded: u64,
    failed: BTreeMap<FailureKind, u64>,
    skipped: BTreeMap<SkipReason, u64>,
    discovery_errors: u64,
    results_dropped: u64,
}

#[derive(Debug)]
pub struct ProgressLedger {
    state: Mutex<LedgerState>,
    changed: Notify,
    metrics: Arc<MetricsRegistry>,
}

impl ProgressLedger {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            changed: Notify::new(),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self) -> TaskId {
        let mut st = self.lock();
        st.next_id += 1;
        let id = st.next_id;
        st.outstanding.insert(id);
        st.discovered += 1;
        self.metrics.file_discovered();
        id
    }

    pub fn discovery_error(&self) {
        self.lock().discovery_errors += 1;
        self.metrics.discovery_error();
    }

    pub fn mark_discovery_done(&self) {
        self.lock().discovery_done = true;
        self.changed.notify_waiters();
    }

    fn settle(&self, id: TaskId, apply: impl FnOnce(&mut LedgerState)) -> bool {
        let settled = {
            let mut st = self.lock();
            if st.outstanding.remove(&id) {
                apply(&mut st);
                true
            } else {
                false
            }
        };
        if settled {
            self.changed.notify_waiters();
        } else {
            debug!(task_id = id, "ignoring repeat settlement");
        }
        settled
    }

    pub fn settle_success(&self, id: TaskId) -> bool {
        self.settle(id, |st| {
            st.succeeded += 1;
            self.metrics.file_processed();
        })
    }

    pub fn settle_failure(&self, id: TaskId, kind: FailureKind, reason: &str) -> bool {
        let settled = self.settle(id, |st| {
            *st.failed.entry(kind).or_default() += 1;
            self.metrics.file_failed(kind);
        });
        if settled {
            warn!(task_id = id, kind = kind.as_str(), reason, "file failed");
        }
        settled
    }

    pub fn settle_skip(&self, id: TaskId, reason: SkipReason, detail: &str) -> bool {
        let settled = self.settle(id, |st| {
            *st.skipped.entry(reason).or_default() += 1;
            self.metrics.file_skipped(reason);
        });
        if settled {
            debug!(task_id = id, reason = reason.as_str(), detail, "file skipped");
        }
        settled
    }

    /// A success whose result the sink refused. The file still counts as
    /// processed.
    pub fn record_dropped_result(&self) {
        self.lock().results_dropped += 1;
        self.metrics.sink_failure();
    }

    pub fn is_complete(&self) -> bool {
        let st = self.lock();
        st.discovery_done && st.outstanding.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    pub fn outstanding_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.lock().outstanding.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn wait_until_complete(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    pub fn tally(&self) -> Tally {
        let st = self.lock();
        Tally {
            discovered: st.discovered,
            succeeded: st.succeeded,
            failed: st.failed.clone(),
            skipped: st.skipped.clone(),
            discovery_errors: st.discovery_errors,
            results_dropped: st.results_dropped,
            outstanding: st.outstanding.len() as u64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Tally {
    pub discovered: u64,
    pub succeeded: u64,
    pub failed: BTreeMap<FailureKind, u64>,
    pub skipped: BTreeMap<SkipReason, u64>,
    pub discovery_errors: u64,
    pub results_dropped: u64,
    pub outstanding: u64,
}

impl Tally {
    pub fn total_failed(&self) -> u64 {
        self.failed.values().sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.skipped.values().sum()
    }

    /// Every discovered file has exactly one outcome.
    pub fn is_balanced(&self) -> bool {
        self.outstanding == 0
            && self.succeeded + self.total_failed() + self.total_skipped() == self.discovered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Finished, but some worker slots were permanently lost.
    Degraded,
    /// Every slot failed permanently; queued files were skipped.
    AllWorkersFailed,
    /// Shut down before discovery and the queue were exhausted.
    Interrupted,
}

/// What the caller sees at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    #[serde(flatten)]
    pub tally: Tally,
    pub degraded_slots: Vec<WorkerId>,
    pub force_stopped: Vec<WorkerId>,
    pub worker_restarts: u64,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn new(
        tally: Tally,
        complete: bool,
        fatal: bool,
        degraded_slots: Vec<WorkerId>,
        force_stopped: Vec<WorkerId>,
        worker_restarts: u64,
        elapsed: Duration,
    ) -> Self {
        let status = if fatal {
            RunStatus::AllWorkersFailed
        } else if !complete {
            RunStatus::Interrupted
        } else if !degraded_slots.is_empty() {
            RunStatus::Degraded
        } else {
            RunStatus::Completed
        };
        Self {
            status,
            tally,
            degraded_slots,
            force_stopped,
            worker_restarts,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}
