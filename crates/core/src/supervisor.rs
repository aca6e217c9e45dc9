use crate::config::SupervisorConfig;
use crate::models::{FailureKind, Heartbeat, SkipReason, WorkerId, WorkerRecord, WorkerState};
use crate::worker::{WorkerContext, WorkerHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// `base * 2^(attempt-1)`, capped at `max`, with ±10% jitter. Never below
/// `base` or above `max`.
pub fn restart_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    use rand::Rng;
    let base_ms = (base.as_millis() as u64).max(1);
    let max_ms = (max.as_millis() as u64).max(base_ms);

    let exponent = attempt.saturating_sub(1).min(20);
    let delay = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    let capped = delay.min(max_ms);

    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    let jittered = ((capped as f64) * jitter) as u64;
    Duration::from_millis(jittered.clamp(base_ms, max_ms))
}

#[derive(Debug)]
struct Slot {
    record: WorkerRecord,
    handle: Option<WorkerHandle>,
    restart_at: Option<Instant>,
}

pub struct Supervisor {
    ctx: Arc<WorkerContext>,
    config: SupervisorConfig,
    slots: Mutex<Vec<Slot>>,
    heartbeat_tx: UnboundedSender<Heartbeat>,
    heartbeat_rx: Mutex<UnboundedReceiver<Heartbeat>>,
    shutting_down: AtomicBool,
    fatal: AtomicBool,
    fatal_notify: Notify,
    restarts: AtomicU64,
}

impl Supervisor {
    /// Create `worker_count` slots and start a worker in each.
    pub fn start(ctx: Arc<WorkerContext>, config: SupervisorConfig, worker_count: usize) -> Arc<Self> {
        let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            ctx,
            config,
            slots: Mutex::new(Vec::with_capacity(worker_count)),
            heartbeat_tx,
            heartbeat_rx: Mutex::new(heartbeat_rx),
            shutting_down: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            fatal_notify: Notify::new(),
            restarts: AtomicU64::new(0),
        });
        {
            let now = Instant::now();
            let mut slots = supervisor.lock_slots();
            for worker_id in 0..worker_count {
                let record = WorkerRecord::new(worker_id, 1, supervisor.ctx.controller.target());
                let mut slot = Slot {
                    record,
                    handle: None,
                    restart_at: None,
                };
                supervisor.launch(&mut slot, now);
                slots.push(slot);
            }
        }
        info!(workers = worker_count, "worker pool started");
        supervisor
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn launch(&self, slot: &mut Slot, now: Instant) {
        let id = slot.record.worker_id;
        match WorkerHandle::spawn(
            self.ctx.clone(),
            id,
            slot.record.generation,
            self.heartbeat_tx.clone(),
        ) {
            Ok(handle) => {
                slot.handle = Some(handle);
                slot.record.state = WorkerState::Starting;
                slot.record.last_heartbeat = now;
            }
            Err(err) => {
                // Picked up as a failure on the next tick.
                warn!(worker_id = id, error = %err, "could not spawn worker thread");
                slot.record.state = WorkerState::Failed;
                slot.record.last_error = Some(err.to_string());
            }
        }
    }

    /// One supervision pass.
    pub fn tick(&self, now: Instant) {
        let mut slots = self.lock_slots();

        // Sample thread exits before draining heartbeats so a final report
        // sent just before exit is never missed.
        let finished: Vec<bool> = slots
            .iter()
            .map(|s| s.handle.as_ref().is_some_and(WorkerHandle::is_finished))
            .collect();

        {
            let mut rx = self.heartbeat_rx.lock().unwrap_or_else(PoisonError::into_inner);
            while let Ok(beat) = rx.try_recv() {
                if let Some(slot) = slots.get_mut(beat.worker_id) {
                    apply_heartbeat(&mut slot.record, beat);
                }
            }
        }

        let shutting_down = self.shutting_down.load(Ordering::Acquire);
        for (slot, finished) in slots.iter_mut().zip(finished) {
            if slot.record.permanently_failed {
                continue;
            }
            if slot.handle.is_some() {
                self.check_slot(slot, finished, now, shutting_down);
            }
            if shutting_down || slot.record.permanently_failed {
                slot.restart_at = None;
                continue;
            }
            if slot.handle.is_none() && slot.record.state == WorkerState::Failed && slot.restart_at.is_none() {
                self.retire_or_schedule(slot, "worker failed before start".to_string(), now);
            }
            if let Some(at) = slot.restart_at {
                if now >= at {
                    self.restart(slot, now);
                }
            }
        }

        let active = slots.iter().filter(|s| s.record.is_active()).count();
        self.ctx.metrics.set_active_workers(active);

        let all_retired = !slots.is_empty() && slots.iter().all(|s| s.record.permanently_failed);
        drop(slots);
        if all_retired {
            self.declare_fatal();
        }
    }

    fn check_slot(&self, slot: &mut Slot, finished: bool, now: Instant, shutting_down: bool) {
        let state = slot.record.state;
        let failure = match state {
            WorkerState::Failed => Some(
                slot.record
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "worker reported failure".to_string()),
            ),
            WorkerState::Stopped if finished => {
                if let Some(handle) = slot.handle.take() {
                    handle.reap();
                }
                None
            }
            _ if finished => Some("worker thread exited unexpectedly".to_string()),
            _ if now.saturating_duration_since(slot.record.last_heartbeat) > self.config.stale_after() => {
                Some(format!(
                    "no heartbeat for {:?}",
                    now.saturating_duration_since(slot.record.last_heartbeat)
                ))
            }
            _ => None,
        };
        let Some(reason) = failure else {
            return;
        };

        let worker_id = slot.record.worker_id;
        if let Some(handle) = slot.handle.take() {
            let settled = handle.abandon(&self.ctx.ledger, FailureKind::WorkerCrash, &reason);
            if !settled.is_empty() {
                warn!(worker_id, tasks = settled.len(), "in-flight tasks failed with worker");
            }
        }
        slot.record.state = WorkerState::Failed;
        slot.record.last_error = Some(reason.clone());
        if shutting_down {
            debug!(worker_id, %reason, "worker lost during shutdown, not replacing");
            return;
        }
        self.retire_or_schedule(slot, reason, now);
    }

    fn retire_or_schedule(&self, slot: &mut Slot, reason: String, now: Instant) {
        let worker_id = slot.record.worker_id;
        slot.record.consecutive_failures += 1;
        let attempt = slot.record.consecutive_failures;
        if attempt > self.config.max_restart_attempts {
            slot.record.permanently_failed = true;
            slot.restart_at = None;
            error!(
                worker_id,
                attempts = attempt - 1,
                %reason,
                "worker slot permanently failed, running with reduced capacity"
            );
            return;
        }
        let delay = restart_backoff(
            attempt,
            Duration::from_millis(self.config.backoff_base_ms),
            Duration::from_millis(self.config.backoff_max_ms),
        );
        slot.restart_at = Some(now + delay);
        warn!(worker_id, attempt, ?delay, %reason, "worker failed, scheduling restart");
    }

    fn restart(&self, slot: &mut Slot, now: Instant) {
        let old = &slot.record;
        let mut record = WorkerRecord::new(old.worker_id, old.generation + 1, self.ctx.controller.target());
        record.restart_count = old.restart_count + 1;
        record.consecutive_failures = old.consecutive_failures;
        record.last_error = old.last_error.clone();
        slot.record = record;
        slot.restart_at = None;
        self.launch(slot, now);
        self.restarts.fetch_add(1, Ordering::Relaxed);
        self.ctx.metrics.worker_restarted();
        info!(
            worker_id = slot.record.worker_id,
            generation = slot.record.generation,
            restart_count = slot.record.restart_count,
            "worker restarted"
        );
    }

    fn declare_fatal(&self) {
        if self.fatal.swap(true, Ordering::AcqRel) {
            return;
        }
        error!("all worker slots permanently failed, abandoning queued work");
        self.ctx.queue.close();
        for task in self.ctx.queue.drain_remaining() {
            self.ctx
                .ledger
                .settle_skip(task.id, SkipReason::NoLiveWorkers, "no live workers");
        }
        self.fatal_notify.notify_waiters();
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub async fn wait_fatal(&self) {
        loop {
            let notified = self.fatal_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_fatal() {
                return;
            }
            notified.await;
        }
    }

    /// Tick every `interval` until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = self.config.interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick(Instant::now()),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("supervisor stopped");
        })
    }

    /// Stop spawning replacements and ask every worker to exit.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        for slot in self.lock_slots().iter_mut() {
            slot.restart_at = None;
            if let Some(handle) = &slot.handle {
                handle.request_stop();
            }
        }
    }

    pub fn all_finished(&self) -> bool {
        self.lock_slots()
            .iter()
            .all(|s| s.handle.as_ref().map_or(true, WorkerHandle::is_finished))
    }

    /// Abandon workers that are still running. Their in-flight tasks settle
    /// as aborted. Returns the slots that had to be forced.
    pub fn force_stop(&self) -> Vec<WorkerId> {
        let mut forced = Vec::new();
        for slot in self.lock_slots().iter_mut() {
            let Some(handle) = slot.handle.take() else {
                continue;
            };
            if handle.is_finished() {
                handle.reap();
                slot.record.state = WorkerState::Stopped;
                continue;
            }
            let worker_id = slot.record.worker_id;
            let aborted = handle.abandon(&self.ctx.ledger, FailureKind::Aborted, "force-stopped at shutdown");
            warn!(worker_id, aborted = aborted.len(), "worker force-stopped");
            slot.record.state = WorkerState::Stopped;
            forced.push(worker_id);
        }
        self.ctx.metrics.set_active_workers(0);
        forced
    }

    /// Copies of every slot record, in slot order.
    pub fn records(&self) -> Vec<WorkerRecord> {
        self.lock_slots().iter().map(|s| s.record.clone()).collect()
    }

    pub fn degraded_slots(&self) -> Vec<WorkerId> {
        self.lock_slots()
            .iter()
            .filter(|s| s.record.permanently_failed)
            .map(|s| s.record.worker_id)
            .collect()
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }
}

fn apply_heartbeat(record: &mut WorkerRecord, beat: Heartbeat) {
    if beat.generation != record.generation {
        return;
    }
    record.state = beat.state;
    record.last_heartbeat = beat.at;
    record.batch_size = beat.batch_size;
    record.items_processed = beat.items_processed;
    record.throughput = beat.throughput;
    if beat.error.is_some() {
        record.last_error = beat.error;
    }
    if beat.state == WorkerState::Idle {
        record.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1_000);
        for _ in 0..50 {
            let first = restart_backoff(1, base, max);
            assert!(first >= base && first <= Duration::from_millis(110));
            let third = restart_backoff(3, base, max);
            assert!(third >= Duration::from_millis(360) && third <= Duration::from_millis(440));
            let huge = restart_backoff(40, base, max);
            assert!(huge >= Duration::from_millis(900) && huge <= max);
        }
    }

    #[test]
    fn zero_base_still_waits() {
        let d = restart_backoff(1, Duration::ZERO, Duration::ZERO);
        assert_eq!(d, Duration::from_millis(1));
    }

    #[test]
    fn stale_generation_heartbeats_are_ignored() {
        let mut record = WorkerRecord::new(0, 2, 8);
        record.consecutive_failures = 3;
        let beat = |generation, state| Heartbeat {
            worker_id: 0,
            generation,
            state,
            batch_size: 4,
            items_processed: 10,
            throughput: 1.5,
            error: None,
            at: Instant::now(),
        };
        apply_heartbeat(&mut record, beat(1, WorkerState::Failed));
        assert_eq!(record.state, WorkerState::Starting);

        apply_heartbeat(&mut record, beat(2, WorkerState::Idle));
        assert_eq!(record.state, WorkerState::Idle);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.batch_size, 4);
    }
}
