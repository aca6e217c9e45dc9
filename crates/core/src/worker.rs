//! One OS thread per worker, each driving its own current-thread runtime.

use crate::batch::BatchController;
use crate::config::InferenceConfig;
use crate::metrics::MetricsRegistry;
use crate::models::{AnalysisResult, FailureKind, FileTask, Heartbeat, TaskId, WorkerId, WorkerState};
use crate::progress::ProgressLedger;
use crate::queue::{BoundedQueue, PopOutcome};
use crate::sink::ResultSink;
use chrono::Utc;
use providers::{
    Acceleration, EngineOptions, InferenceEngine, InferenceError, InferenceInput, InferenceRuntime,
    ModelLoadError,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

pub struct WorkerContext {
    pub queue: Arc<BoundedQueue>,
    pub controller: Arc<BatchController>,
    pub ledger: Arc<ProgressLedger>,
    pub metrics: Arc<MetricsRegistry>,
    pub sink: Arc<dyn ResultSink>,
    pub runtime: Arc<dyn InferenceRuntime>,
    pub inference: InferenceConfig,
    pub pop_timeout: Duration,
}

type InFlight = Arc<Mutex<Vec<TaskId>>>;

fn lock_in_flight(in_flight: &InFlight) -> MutexGuard<'_, Vec<TaskId>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Supervisor-side handle to one worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    pub worker_id: WorkerId,
    pub generation: u64,
    stop: Arc<AtomicBool>,
    in_flight: InFlight,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(
        ctx: Arc<WorkerContext>,
        worker_id: WorkerId,
        generation: u64,
        heartbeats: UnboundedSender<Heartbeat>,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let in_flight: InFlight = Arc::new(Mutex::new(Vec::new()));
        let worker = Worker {
            ctx,
            worker_id,
            generation,
            stop: stop.clone(),
            in_flight: in_flight.clone(),
            heartbeats,
            local_cap: None,
            batch_size: 0,
            items_processed: 0,
            throughput: 0.0,
        };
        let thread = std::thread::Builder::new()
            .name(format!("helios-worker-{worker_id}"))
            .spawn(move || worker.run())?;
        Ok(Self {
            worker_id,
            generation,
            stop,
            in_flight,
            thread: Some(thread),
        })
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    pub fn in_flight(&self) -> Vec<TaskId> {
        lock_in_flight(&self.in_flight).clone()
    }

    /// Give up on this worker: stop it, settle whatever it still holds as
    /// `kind`, and detach the thread. Returns the ids settled here.
    pub fn abandon(mut self, ledger: &ProgressLedger, kind: FailureKind, reason: &str) -> Vec<TaskId> {
        self.request_stop();
        let held: Vec<TaskId> = std::mem::take(&mut *lock_in_flight(&self.in_flight));
        let settled: Vec<TaskId> = held
            .into_iter()
            .filter(|id| ledger.settle_failure(*id, kind, reason))
            .collect();
        // A hung thread cannot be killed; it is left to exit on its own.
        drop(self.thread.take());
        settled
    }

    /// Wait for a finished thread. No-op if it is still running.
    pub fn reap(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.is_finished() {
                let _ = thread.join();
            }
        }
    }
}

struct Worker {
    ctx: Arc<WorkerContext>,
    worker_id: WorkerId,
    generation: u64,
    stop: Arc<AtomicBool>,
    in_flight: InFlight,
    heartbeats: UnboundedSender<Heartbeat>,
    /// Size this worker fell back to after exhaustion, until the pool target
    /// catches down to it.
    local_cap: Option<usize>,
    batch_size: usize,
    items_processed: u64,
    throughput: f64,
}

impl Worker {
    fn run(mut self) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_inner()));
        match outcome {
            Ok(Ok(())) => {
                debug!(worker_id = self.worker_id, generation = self.generation, "worker stopped");
                self.beat(WorkerState::Stopped, None);
            }
            Ok(Err(reason)) => {
                error!(worker_id = self.worker_id, %reason, "worker failed");
                self.release_in_flight(FailureKind::WorkerCrash, &reason);
                self.beat(WorkerState::Failed, Some(reason));
            }
            Err(payload) => {
                let reason = panic_to_string(payload);
                error!(worker_id = self.worker_id, %reason, "worker panicked");
                self.release_in_flight(FailureKind::WorkerCrash, &reason);
                self.beat(WorkerState::Failed, Some(reason));
            }
        }
    }

    fn run_inner(&mut self) -> Result<(), String> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| format!("worker runtime: {err}"))?;

        let mut engine = rt
            .block_on(self.load_engine())
            .map_err(|err| format!("model load: {err}"))?;
        info!(worker_id = self.worker_id, generation = self.generation, "worker ready");
        self.batch_size = self.effective_batch_size();
        self.beat(WorkerState::Idle, None);

        loop {
            if self.stop.load(Ordering::Acquire) {
                return Ok(());
            }
            let size = self.effective_batch_size();
            self.batch_size = size;
            let batch = match rt.block_on(self.ctx.queue.pop_batch(size, self.ctx.pop_timeout)) {
                PopOutcome::Batch(batch) => batch,
                PopOutcome::TimedOut => {
                    self.beat(WorkerState::Idle, None);
                    continue;
                }
                PopOutcome::Drained => return Ok(()),
            };

            *lock_in_flight(&self.in_flight) = batch.iter().map(|t| t.id).collect();
            self.beat(WorkerState::Processing, None);
            let started = Instant::now();
            let count = batch.len();
            rt.block_on(self.process_batch(engine.as_mut(), batch));

            let secs = started.elapsed().as_secs_f64();
            if secs > 0.0 {
                self.throughput = count as f64 / secs;
            }
            self.beat(WorkerState::Idle, None);
        }
    }

    async fn load_engine(&self) -> Result<Box<dyn InferenceEngine>, ModelLoadError> {
        let inference = &self.ctx.inference;
        let options = EngineOptions {
            model_path: inference.model_path.clone(),
            acceleration: if inference.use_acceleration {
                Acceleration::Gpu
            } else {
                Acceleration::Cpu
            },
            confidence_threshold: inference.confidence_threshold,
        };
        match self.ctx.runtime.initialize(&options).await {
            Ok(engine) => Ok(engine),
            Err(err) if options.acceleration == Acceleration::Gpu && inference.fallback_to_cpu => {
                warn!(worker_id = self.worker_id, error = %err, "accelerated load failed, falling back to cpu");
                let cpu = EngineOptions {
                    acceleration: Acceleration::Cpu,
                    ..options
                };
                self.ctx.runtime.initialize(&cpu).await
            }
            Err(err) => Err(err),
        }
    }

    fn effective_batch_size(&mut self) -> usize {
        let target = self.ctx.controller.target().max(1);
        match self.local_cap {
            Some(cap) if target <= cap => {
                self.local_cap = None;
                target
            }
            Some(cap) => cap,
            None => target,
        }
    }

    /// Run one popped batch to completion. Every task ends up settled.
    async fn process_batch(&mut self, engine: &mut dyn InferenceEngine, batch: Vec<FileTask>) {
        let mut chunk = if engine.supports_batching() { batch.len() } else { 1 };
        let mut offset = 0;
        let mut exhausted = false;

        while offset < batch.len() {
            let end = (offset + chunk).min(batch.len());
            let slice = &batch[offset..end];
            let inputs: Vec<InferenceInput<'_>> = slice.iter().map(FileTask::as_input).collect();

            let started = Instant::now();
            let outcome = engine.infer(&inputs).await;
            let elapsed = started.elapsed();

            let results = match outcome {
                Err(InferenceError::ResourceExhausted(msg)) if slice.len() > 1 => {
                    exhausted = true;
                    chunk = self.shrink(slice.len(), &msg);
                    continue;
                }
                Err(err) => {
                    if matches!(err, InferenceError::ResourceExhausted(_)) {
                        exhausted = true;
                        self.ctx.controller.report_exhausted();
                    }
                    let kind = FailureKind::from(&err);
                    let reason = err.to_string();
                    for task in slice {
                        self.fail(task.id, kind, &reason);
                    }
                    offset = end;
                    continue;
                }
                Ok(results) => results,
            };

            if results.len() != slice.len() {
                let reason = format!(
                    "engine returned {} results for {} inputs",
                    results.len(),
                    slice.len()
                );
                for task in slice {
                    self.fail(task.id, FailureKind::InferenceFailed, &reason);
                }
                offset = end;
                continue;
            }

            if slice.len() > 1 {
                if let Some(Err(InferenceError::ResourceExhausted(msg))) = results
                    .iter()
                    .find(|r| matches!(r, Err(InferenceError::ResourceExhausted(_))))
                {
                    exhausted = true;
                    chunk = self.shrink(slice.len(), msg);
                    continue;
                }
            }

            let per_item = elapsed / slice.len() as u32;
            for (task, result) in slice.iter().zip(results) {
                self.ctx.metrics.observe_latency(per_item);
                match result {
                    Ok(suggestion) => {
                        let result = AnalysisResult {
                            original_path: task.path.clone(),
                            suggested_path: suggestion.suggested_path,
                            confidence: suggestion.confidence,
                            tags: suggestion.tags,
                            processing_time: per_item,
                            worker_id: self.worker_id,
                            completed_at: Utc::now(),
                        };
                        self.succeed(task.id, &result).await;
                    }
                    Err(err) => {
                        if matches!(err, InferenceError::ResourceExhausted(_)) {
                            exhausted = true;
                            self.ctx.controller.report_exhausted();
                        }
                        self.fail(task.id, FailureKind::from(&err), &err.to_string());
                    }
                }
            }
            offset = end;
        }

        if !exhausted {
            self.ctx.controller.report_clean_batch();
        }
    }

    fn shrink(&mut self, current: usize, msg: &str) -> usize {
        self.ctx.controller.report_exhausted();
        let next = (current / 2).max(1);
        self.local_cap = Some(self.local_cap.map_or(next, |cap| cap.min(next)));
        self.batch_size = next;
        warn!(
            worker_id = self.worker_id,
            from = current,
            to = next,
            reason = msg,
            "resource exhausted, retrying with smaller batch"
        );
        next
    }

    /// Drop `id` from the in-flight set. False if the supervisor already
    /// settled it on our behalf.
    fn release(&self, id: TaskId) -> bool {
        let mut held = lock_in_flight(&self.in_flight);
        match held.iter().position(|held_id| *held_id == id) {
            Some(idx) => {
                held.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    async fn succeed(&mut self, id: TaskId, result: &AnalysisResult) {
        // Claim first: once released, an abandon can no longer settle it.
        if !self.release(id) {
            return;
        }
        if let Err(err) = self.ctx.sink.persist(result).await {
            warn!(
                worker_id = self.worker_id,
                path = %result.original_path.display(),
                error = %err,
                "result sink rejected suggestion, dropping it"
            );
            self.ctx.ledger.record_dropped_result();
        }
        self.ctx.ledger.settle_success(id);
        self.items_processed += 1;
    }

    fn fail(&mut self, id: TaskId, kind: FailureKind, reason: &str) {
        if self.release(id) {
            self.ctx.ledger.settle_failure(id, kind, reason);
            self.items_processed += 1;
        }
    }

    fn release_in_flight(&self, kind: FailureKind, reason: &str) {
        let held: Vec<TaskId> = std::mem::take(&mut *lock_in_flight(&self.in_flight));
        for id in held {
            self.ctx.ledger.settle_failure(id, kind, reason);
        }
    }

    fn beat(&self, state: WorkerState, error: Option<String>) {
        let _ = self.heartbeats.send(Heartbeat {
            worker_id: self.worker_id,
            generation: self.generation,
            state,
            batch_size: self.batch_size,
            items_processed: self.items_processed,
            throughput: self.throughput,
            error,
            at: Instant::now(),
        });
    }
}

pub(crate) fn panic_to_string(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}
