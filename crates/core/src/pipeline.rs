//! Starts every stage in order and tears them down in reverse.

use crate::batch::{BatchController, BatchPolicy};
use crate::config::AppConfig;
use crate::discovery::{Discovery, DiscoveryOptions};
use crate::error::PipelineError;
use crate::metrics::MetricsRegistry;
use crate::metrics_server::{self, MetricsServer};
use crate::models::{FailureKind, SkipReason, SystemHealthSnapshot, WorkerId};
use crate::progress::{ProgressLedger, RunReport, Tally};
use crate::queue::BoundedQueue;
use crate::sink::ResultSink;
use crate::skip::{GlobSkipPredicate, SkipPredicate};
use crate::supervisor::Supervisor;
use crate::worker::WorkerContext;
use providers::{InferenceRuntime, RuntimeRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// External pieces the pipeline calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub runtime: Arc<dyn InferenceRuntime>,
    pub sink: Arc<dyn ResultSink>,
    pub skip: Arc<dyn SkipPredicate>,
    pub metrics: Arc<MetricsRegistry>,
}

impl Collaborators {
    /// Resolve the configured runtime and build the scan filter from config.
    pub fn from_config(
        config: &AppConfig,
        runtimes: &RuntimeRegistry,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, PipelineError> {
        let runtime = runtimes.runtime(Some(&config.inference.runtime))?;
        let skip = GlobSkipPredicate::new(&config.scan.exclude, config.scan.include_hidden)?;
        Ok(Self {
            runtime,
            sink,
            skip: Arc::new(skip),
            metrics: Arc::new(MetricsRegistry::new()),
        })
    }
}

pub struct Pipeline {
    root: PathBuf,
    metrics: Arc<MetricsRegistry>,
    queue: Arc<BoundedQueue>,
    ledger: Arc<ProgressLedger>,
    controller: Arc<BatchController>,
    supervisor: Arc<Supervisor>,
    discovery_cancel: Arc<AtomicBool>,
    discovery_task: Option<JoinHandle<()>>,
    loops: Vec<JoinHandle<()>>,
    stop_loops: watch::Sender<bool>,
    metrics_server: Option<MetricsServer>,
    started: Instant,
}

impl Pipeline {
    pub async fn start(
        root: impl Into<PathBuf>,
        config: AppConfig,
        collaborators: Collaborators,
    ) -> Result<Self, PipelineError> {
        let root = root.into();
        let config = config.validate();
        let root = match tokio::fs::canonicalize(&root).await {
            Ok(absolute) => absolute,
            Err(_) => return Err(PipelineError::RootNotFound(root)),
        };
        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(PipelineError::RootNotDirectory(root)),
            Err(_) => return Err(PipelineError::RootNotFound(root)),
        }
        let Collaborators {
            runtime,
            sink,
            skip,
            metrics,
        } = collaborators;
        let started = Instant::now();
        let perf = &config.performance;

        let metrics_server =
            metrics_server::spawn(&config.metrics.bind_address, config.metrics.port, metrics.clone())
                .await;

        let queue = Arc::new(BoundedQueue::new(perf.queue_max_size, metrics.clone()));
        let ledger = Arc::new(ProgressLedger::new(metrics.clone()));
        let controller = Arc::new(BatchController::new(
            BatchPolicy::from_config(perf.batch_size, &config.batching),
            metrics.clone(),
        ));
        let (stop_loops, stop_rx) = watch::channel(false);

        let ctx = Arc::new(WorkerContext {
            queue: queue.clone(),
            controller: controller.clone(),
            ledger: ledger.clone(),
            metrics: metrics.clone(),
            sink,
            runtime,
            inference: config.inference.clone(),
            pop_timeout: perf.pop_timeout(),
        });
        let supervisor = Supervisor::start(ctx, config.supervisor.clone(), perf.worker_count);
        let mut loops = vec![supervisor.clone().spawn(stop_rx.clone())];
        loops.push(controller.clone().spawn(config.batching.interval(), stop_rx));

        let discovery_cancel = Arc::new(AtomicBool::new(false));
        let discovery = Arc::new(Discovery::new(
            root.clone(),
            skip,
            queue.clone(),
            ledger.clone(),
            DiscoveryOptions {
                io_workers: perf.io_workers,
                overflow: perf.overflow,
                follow_links: config.scan.follow_links,
            },
            discovery_cancel.clone(),
        ));
        let discovery_queue = queue.clone();
        let discovery_task = tokio::spawn(async move {
            discovery.run().await;
            // Workers see end-of-stream once the backlog is gone.
            discovery_queue.close();
        });

        info!(
            root = %root.display(),
            workers = perf.worker_count,
            batch_size = perf.batch_size,
            queue_capacity = perf.queue_max_size,
            runtime = %config.inference.runtime,
            "pipeline started"
        );
        Ok(Self {
            root,
            metrics,
            queue,
            ledger,
            controller,
            supervisor,
            discovery_cancel,
            discovery_task: Some(discovery_task),
            loops,
            stop_loops,
            metrics_server,
            started,
        })
    }

    /// Resolves once every discovered file has an outcome, or once the pool
    /// has no live workers left.
    pub async fn await_completion(&self) -> RunReport {
        tokio::select! {
            _ = self.ledger.wait_until_complete() => {}
            _ = self.supervisor.wait_fatal() => {
                self.discovery_cancel.store(true, Ordering::Release);
                self.ledger.wait_until_complete().await;
            }
        }
        let report = self.report(self.ledger.is_complete(), Vec::new());
        info!(
            status = ?report.status,
            succeeded = report.tally.succeeded,
            failed = report.tally.total_failed(),
            skipped = report.tally.total_skipped(),
            "run complete"
        );
        report
    }

    /// Stop every stage, waiting up to `timeout` for workers to finish their
    /// current batch before abandoning them.
    pub async fn shutdown(mut self, timeout: Duration) -> RunReport {
        let complete = self.ledger.is_complete();
        info!(root = %self.root.display(), ?timeout, "pipeline shutting down");

        self.discovery_cancel.store(true, Ordering::Release);
        self.queue.close();
        self.supervisor.begin_shutdown();

        let deadline = Instant::now() + timeout;
        while !self.supervisor.all_finished() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.supervisor.tick(Instant::now());
        let forced = self.supervisor.force_stop();
        if !forced.is_empty() {
            warn!(workers = ?forced, "workers did not stop in time and were force-stopped");
        }

        let _ = self.stop_loops.send(true);
        for handle in self.loops.drain(..) {
            if let Err(err) = handle.await {
                warn!(error = %err, "control loop ended abnormally");
            }
        }

        if let Some(mut task) = self.discovery_task.take() {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                warn!("discovery did not stop in time, aborting it");
                task.abort();
            }
        }

        for task in self.queue.drain_remaining() {
            self.ledger
                .settle_skip(task.id, SkipReason::QueueShutdown, "pipeline shut down");
        }
        for id in self.ledger.outstanding_ids() {
            self.ledger
                .settle_failure(id, FailureKind::Aborted, "unsettled at shutdown");
        }

        let report = self.report(complete, forced);

        if let Some(server) = self.metrics_server.take() {
            server.stop().await;
        }
        match serde_json::to_string(&self.metrics.snapshot()) {
            Ok(json) => info!(metrics = %json, "final metrics"),
            Err(err) => debug!(error = %err, "could not serialize final metrics"),
        }
        report
    }

    fn report(&self, complete: bool, force_stopped: Vec<WorkerId>) -> RunReport {
        RunReport::new(
            self.ledger.tally(),
            complete,
            self.supervisor.is_fatal(),
            self.supervisor.degraded_slots(),
            force_stopped,
            self.supervisor.restarts(),
            self.started.elapsed(),
        )
    }

    pub fn health(&self) -> SystemHealthSnapshot {
        SystemHealthSnapshot::from_records(
            self.supervisor.records(),
            self.queue.depth(),
            self.controller.target(),
        )
    }

    pub fn tally(&self) -> Tally {
        self.ledger.tally()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn queue_high_water(&self) -> usize {
        self.queue.high_water()
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_server.as_ref().map(MetricsServer::local_addr)
    }
}

/// Start a pipeline, wait for it to finish and shut it down.
pub async fn run(
    root: impl Into<PathBuf>,
    config: AppConfig,
    collaborators: Collaborators,
    shutdown_timeout: Duration,
) -> Result<RunReport, PipelineError> {
    let pipeline = Pipeline::start(root, config, collaborators).await?;
    pipeline.await_completion().await;
    Ok(pipeline.shutdown(shutdown_timeout).await)
}
