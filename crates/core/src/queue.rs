use crate::metrics::MetricsRegistry;
use crate::models::FileTask;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A push that did not happen. The task is handed back so the caller can
/// account for it.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full(FileTask),
    #[error("queue is closed")]
    Closed(FileTask),
}

impl QueueError {
    pub fn into_task(self) -> FileTask {
        match self {
            QueueError::Full(t) | QueueError::Closed(t) => t,
        }
    }
}

#[derive(Debug)]
pub enum PopOutcome {
    Batch(Vec<FileTask>),
    /// Nothing arrived within the fill window; the queue is still open.
    TimedOut,
    /// Closed and empty. Every later pop returns this too.
    Drained,
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<FileTask>,
    closed: bool,
}

#[derive(Debug)]
pub struct BoundedQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    high_water: AtomicUsize,
    not_empty: Notify,
    not_full: Notify,
    metrics: Arc<MetricsRegistry>,
}

impl BoundedQueue {
    pub fn new(capacity: usize, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            high_water: AtomicUsize::new(0),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Nothing panics while holding the lock, but a poisoned queue must
        // still drain at shutdown.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_depth(&self, depth: usize) {
        self.high_water.fetch_max(depth, Ordering::Relaxed);
        self.metrics.set_queue_depth(depth);
    }

    pub fn try_push(&self, task: FileTask) -> Result<(), QueueError> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(QueueError::Closed(task));
            }
            if inner.items.len() >= self.capacity {
                return Err(QueueError::Full(task));
            }
            inner.items.push_back(task);
            self.record_depth(inner.items.len());
        }
        self.not_empty.notify_waiters();
        Ok(())
    }

    /// Enqueue, waiting for space while the queue is full. Fails only once the
    /// queue is closed.
    pub async fn push(&self, mut task: FileTask) -> Result<(), QueueError> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_push(task) {
                Ok(()) => return Ok(()),
                Err(QueueError::Full(t)) => task = t,
                Err(closed) => return Err(closed),
            }
            notified.await;
        }
    }

    /// Take up to `max` tasks, waiting at most `fill_timeout` to fill the batch.
    pub async fn pop_batch(&self, max: usize, fill_timeout: Duration) -> PopOutcome {
        let max = max.max(1);
        let deadline = Instant::now() + fill_timeout;
        let mut batch = Vec::with_capacity(max.min(self.capacity));
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (took, closed) = {
                let mut inner = self.lock();
                let before = batch.len();
                while batch.len() < max {
                    match inner.items.pop_front() {
                        Some(task) => batch.push(task),
                        None => break,
                    }
                }
                let took = batch.len() - before;
                if took > 0 {
                    self.metrics.set_queue_depth(inner.items.len());
                }
                (took, inner.closed)
            };
            if took > 0 {
                self.not_full.notify_waiters();
            }

            if batch.len() == max {
                return PopOutcome::Batch(batch);
            }
            if closed {
                return if batch.is_empty() {
                    PopOutcome::Drained
                } else {
                    PopOutcome::Batch(batch)
                };
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return if batch.is_empty() {
                    PopOutcome::TimedOut
                } else {
                    PopOutcome::Batch(batch)
                };
            }
        }
    }

    /// Stop accepting pushes. Idempotent; queued items stay poppable.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn drain_remaining(&self) -> Vec<FileTask> {
        let drained: Vec<FileTask> = {
            let mut inner = self.lock();
            let items = inner.items.drain(..).collect();
            self.metrics.set_queue_depth(0);
            items
        };
        if !drained.is_empty() {
            self.not_full.notify_waiters();
        }
        drained
    }

    pub fn depth(&self) -> usize {
        self.lock().items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn task(id: u64) -> FileTask {
        FileTask::new(id, Path::new("/r"), PathBuf::from(format!("/r/{id}.txt")), 1)
    }

    fn queue(capacity: usize) -> Arc<BoundedQueue> {
        Arc::new(BoundedQueue::new(capacity, Arc::new(MetricsRegistry::new())))
    }

    fn ids(outcome: PopOutcome) -> Vec<u64> {
        match outcome {
            PopOutcome::Batch(b) => b.into_iter().map(|t| t.id).collect(),
            other => panic!("expected a batch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn try_push_rejects_when_full() {
        let q = queue(2);
        q.try_push(task(1)).unwrap();
        q.try_push(task(2)).unwrap();
        let err = q.try_push(task(3)).unwrap_err();
        assert!(matches!(err, QueueError::Full(_)));
        assert_eq!(err.into_task().id, 3);
        assert_eq!(q.depth(), 2);
        assert_eq!(q.high_water(), 2);
    }

    #[tokio::test]
    async fn push_waits_for_space() {
        let q = queue(1);
        q.push(task(1)).await.unwrap();

        let producer = {
            let q = q.clone();
            tokio::spawn(async move { q.push(task(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(q.depth(), 1);

        assert_eq!(ids(q.pop_batch(1, Duration::from_millis(10)).await), vec![1]);
        producer.await.unwrap().unwrap();
        assert_eq!(ids(q.pop_batch(1, Duration::from_millis(10)).await), vec![2]);
        assert_eq!(q.high_water(), 1);
    }

    #[tokio::test]
    async fn close_wakes_blocked_producer() {
        let q = queue(1);
        q.push(task(1)).await.unwrap();
        let producer = {
            let q = q.clone();
            tokio::spawn(async move { q.push(task(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        let err = producer.await.unwrap().unwrap_err();
        assert!(matches!(err, QueueError::Closed(ref t) if t.id == 2));
    }

    #[tokio::test]
    async fn pop_batch_returns_partial_batch_after_fill_window() {
        let q = queue(10);
        q.push(task(1)).await.unwrap();
        let started = std::time::Instant::now();
        assert_eq!(ids(q.pop_batch(4, Duration::from_millis(40)).await), vec![1]);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(matches!(
            q.pop_batch(4, Duration::from_millis(10)).await,
            PopOutcome::TimedOut
        ));
    }

    #[tokio::test]
    async fn pop_batch_fills_from_late_pushes() {
        let q = queue(10);
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop_batch(2, Duration::from_secs(5)).await })
        };
        q.push(task(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(task(2)).await.unwrap();
        assert_eq!(ids(consumer.await.unwrap()), vec![1, 2]);
    }

    #[tokio::test]
    async fn closed_queue_drains_in_order_then_signals_end() {
        let q = queue(10);
        for id in 1..=5 {
            q.push(task(id)).await.unwrap();
        }
        q.close();
        q.close();
        assert!(matches!(q.try_push(task(6)), Err(QueueError::Closed(_))));

        assert_eq!(ids(q.pop_batch(2, Duration::from_secs(5)).await), vec![1, 2]);
        assert_eq!(ids(q.pop_batch(2, Duration::from_secs(5)).await), vec![3, 4]);
        assert_eq!(ids(q.pop_batch(2, Duration::from_secs(5)).await), vec![5]);
        assert!(matches!(
            q.pop_batch(2, Duration::from_secs(5)).await,
            PopOutcome::Drained
        ));
    }

    #[tokio::test]
    async fn close_wakes_idle_consumer() {
        let q = queue(4);
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop_batch(2, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        let outcome = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .expect("consumer woke")
            .unwrap();
        assert!(matches!(outcome, PopOutcome::Drained));
    }

    #[tokio::test]
    async fn drain_remaining_empties_queue() {
        let q = queue(4);
        q.push(task(1)).await.unwrap();
        q.push(task(2)).await.unwrap();
        let left: Vec<u64> = q.drain_remaining().into_iter().map(|t| t.id).collect();
        assert_eq!(left, vec![1, 2]);
        assert_eq!(q.depth(), 0);
    }
}
