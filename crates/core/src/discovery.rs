//! Directory walk that feeds the work queue. At most `io_workers`
//! directories are read at once; entries are never opened.

use crate::config::OverflowPolicy;
use crate::models::{FileTask, SkipReason};
use crate::progress::ProgressLedger;
use crate::queue::{BoundedQueue, QueueError};
use crate::skip::SkipPredicate;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub io_workers: usize,
    pub overflow: OverflowPolicy,
    pub follow_links: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub directories: u64,
    pub files: u64,
}

pub struct Discovery {
    root: PathBuf,
    skip: Arc<dyn SkipPredicate>,
    queue: Arc<BoundedQueue>,
    ledger: Arc<ProgressLedger>,
    options: DiscoveryOptions,
    cancel: Arc<AtomicBool>,
    /// Canonical directories already walked; only consulted when following
    /// links, to break cycles.
    visited: Mutex<HashSet<PathBuf>>,
    directories: AtomicU64,
    files: AtomicU64,
}

impl Discovery {
    pub fn new(
        root: PathBuf,
        skip: Arc<dyn SkipPredicate>,
        queue: Arc<BoundedQueue>,
        ledger: Arc<ProgressLedger>,
        options: DiscoveryOptions,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            root,
            skip,
            queue,
            ledger,
            options,
            cancel,
            visited: Mutex::new(HashSet::new()),
            directories: AtomicU64::new(0),
            files: AtomicU64::new(0),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Walk the whole tree, then mark discovery finished in the ledger. The
    /// root itself is never passed to the skip predicate.
    pub async fn run(self: Arc<Self>) -> DiscoveryStats {
        let permits = Arc::new(Semaphore::new(self.options.io_workers.max(1)));
        let mut walkers = JoinSet::new();
        if self.first_visit(&self.root).await {
            walkers.spawn(self.clone().scan_dir(self.root.clone(), permits.clone()));
        }

        while let Some(joined) = walkers.join_next().await {
            match joined {
                Ok(subdirs) => {
                    if self.cancelled() {
                        continue;
                    }
                    for dir in subdirs {
                        if self.first_visit(&dir).await {
                            walkers.spawn(self.clone().scan_dir(dir, permits.clone()));
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "directory task failed");
                    self.ledger.discovery_error();
                }
            }
        }

        self.ledger.mark_discovery_done();
        let stats = DiscoveryStats {
            directories: self.directories.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
        };
        if self.cancelled() {
            info!(files = stats.files, "discovery cancelled");
        } else {
            info!(
                directories = stats.directories,
                files = stats.files,
                root = %self.root.display(),
                "discovery finished"
            );
        }
        stats
    }

    async fn first_visit(&self, dir: &Path) -> bool {
        if !self.options.follow_links {
            return true;
        }
        let canonical = match tokio::fs::canonicalize(dir).await {
            Ok(path) => path,
            Err(_) => dir.to_path_buf(),
        };
        let first = self
            .visited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(canonical);
        if !first {
            debug!(dir = %dir.display(), "directory already walked, skipping link cycle");
        }
        first
    }

    /// Read one directory, pushing files as they are listed, and return its
    /// subdirectories. The permit stays held across pushes so a full queue
    /// stalls the walk instead of letting it read ahead.
    async fn scan_dir(self: Arc<Self>, dir: PathBuf, permits: Arc<Semaphore>) -> Vec<PathBuf> {
        let mut subdirs = Vec::new();
        let Ok(_permit) = permits.acquire().await else {
            return subdirs;
        };
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "cannot read directory");
                self.ledger.discovery_error();
                return subdirs;
            }
        };
        self.directories.fetch_add(1, Ordering::Relaxed);

        while !self.cancelled() {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "directory listing interrupted");
                    self.ledger.discovery_error();
                    break;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(ft) => ft,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "cannot stat entry");
                    self.ledger.discovery_error();
                    continue;
                }
            };
            let (is_dir, is_file) = if file_type.is_symlink() {
                if !self.options.follow_links {
                    continue;
                }
                match tokio::fs::metadata(&path).await {
                    Ok(meta) => (meta.is_dir(), meta.is_file()),
                    Err(err) => {
                        debug!(path = %path.display(), error = %err, "broken symlink");
                        self.ledger.discovery_error();
                        continue;
                    }
                }
            } else {
                (file_type.is_dir(), file_type.is_file())
            };

            if self.skip.should_skip(&path, is_dir) {
                continue;
            }
            if is_dir {
                subdirs.push(path);
            } else if is_file {
                self.discover_file(path).await;
            }
        }
        subdirs
    }

    async fn discover_file(&self, path: PathBuf) {
        let id = self.ledger.register();
        self.files.fetch_add(1, Ordering::Relaxed);
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(err) => {
                self.ledger.discovery_error();
                self.ledger
                    .settle_skip(id, SkipReason::Unreadable, &err.to_string());
                return;
            }
        };
        let task = FileTask::new(id, &self.root, path, size);
        let pushed = match self.options.overflow {
            OverflowPolicy::Block => self.queue.push(task).await,
            OverflowPolicy::Reject => self.queue.try_push(task),
        };
        match pushed {
            Ok(()) => {}
            Err(QueueError::Full(task)) => {
                self.ledger
                    .settle_skip(task.id, SkipReason::QueueRejected, "queue full");
            }
            Err(QueueError::Closed(task)) => {
                self.ledger
                    .settle_skip(task.id, SkipReason::QueueShutdown, "queue closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::queue::PopOutcome;
    use crate::skip::GlobSkipPredicate;
    use std::fs;
    use std::time::Duration;

    fn setup(
        root: &Path,
        capacity: usize,
        overflow: OverflowPolicy,
        skip: Arc<dyn SkipPredicate>,
    ) -> (Arc<Discovery>, Arc<BoundedQueue>, Arc<ProgressLedger>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let queue = Arc::new(BoundedQueue::new(capacity, metrics.clone()));
        let ledger = Arc::new(ProgressLedger::new(metrics));
        let discovery = Arc::new(Discovery::new(
            root.to_path_buf(),
            skip,
            queue.clone(),
            ledger.clone(),
            DiscoveryOptions {
                io_workers: 2,
                overflow,
                follow_links: false,
            },
            Arc::new(AtomicBool::new(false)),
        ));
        (discovery, queue, ledger)
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        fs::write(root.join("top.txt"), b"1").unwrap();
        fs::write(root.join("a/one.pdf"), b"22").unwrap();
        fs::write(root.join("a/b/two.png"), b"333").unwrap();
        fs::write(root.join(".cache/hidden.bin"), b"x").unwrap();
        fs::write(root.join(".env"), b"x").unwrap();
        dir
    }

    #[tokio::test]
    async fn walks_nested_tree_and_respects_skip() {
        let dir = tree();
        let (discovery, queue, ledger) =
            setup(dir.path(), 16, OverflowPolicy::Block, Arc::new(GlobSkipPredicate::default()));
        let stats = discovery.run().await;
        assert_eq!(stats.files, 3);
        assert!(!ledger.is_complete(), "queued tasks are still outstanding");

        queue.close();
        let mut names = Vec::new();
        while let PopOutcome::Batch(batch) = queue.pop_batch(8, Duration::from_millis(10)).await {
            for task in batch {
                assert!(task.size_bytes > 0);
                names.push(task.relative_path.to_string_lossy().replace('\\', "/"));
            }
        }
        names.sort();
        assert_eq!(names, vec!["a/b/two.png", "a/one.pdf", "top.txt"]);
        assert_eq!(ledger.tally().discovered, 3);
    }

    #[tokio::test]
    async fn full_queue_stalls_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        for d in 0..20 {
            let sub = dir.path().join(format!("d{d:02}"));
            fs::create_dir_all(&sub).unwrap();
            for f in 0..5 {
                fs::write(sub.join(format!("f{f}.txt")), b"x").unwrap();
            }
        }
        let (discovery, queue, ledger) =
            setup(dir.path(), 1, OverflowPolicy::Block, Arc::new(GlobSkipPredicate::default()));
        let walk = tokio::spawn(discovery.clone().run());
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Root plus one directory per io worker, each parked on its first push.
        assert_eq!(queue.depth(), 1);
        assert!(discovery.directories.load(Ordering::Relaxed) <= 3);
        assert!(ledger.tally().discovered <= 3);
        assert!(!walk.is_finished());

        queue.close();
        let stats = walk.await.unwrap();
        assert_eq!(stats.directories, 21);
        for task in queue.drain_remaining() {
            ledger.settle_skip(task.id, SkipReason::QueueShutdown, "test drain");
        }
        let tally = ledger.tally();
        assert_eq!(tally.discovered, 100);
        assert!(tally.is_balanced(), "{tally:?}");
    }

    #[tokio::test]
    async fn reject_policy_skips_overflow() {
        let dir = tree();
        let (discovery, queue, ledger) =
            setup(dir.path(), 1, OverflowPolicy::Reject, Arc::new(GlobSkipPredicate::default()));
        discovery.run().await;

        assert_eq!(queue.depth(), 1);
        let tally = ledger.tally();
        assert_eq!(tally.discovered, 3);
        assert_eq!(tally.skipped[&SkipReason::QueueRejected], 2);
        assert_eq!(queue.high_water(), 1);
    }

    #[tokio::test]
    async fn closed_queue_skips_as_shutdown() {
        let dir = tree();
        let (discovery, queue, ledger) =
            setup(dir.path(), 16, OverflowPolicy::Block, Arc::new(GlobSkipPredicate::default()));
        queue.close();
        discovery.run().await;
        let tally = ledger.tally();
        assert_eq!(tally.skipped[&SkipReason::QueueShutdown], 3);
        assert!(tally.is_balanced());
    }

    #[tokio::test]
    async fn closure_predicate_prunes_directories() {
        let dir = tree();
        let skip = |path: &Path, is_dir: bool| is_dir && path.ends_with("a");
        let (discovery, _queue, ledger) =
            setup(dir.path(), 16, OverflowPolicy::Block, Arc::new(skip));
        let stats = discovery.run().await;
        // top.txt, .env and .cache/hidden.bin; nothing under a/.
        assert_eq!(stats.files, 3);
        assert_eq!(ledger.tally().discovered, 3);
    }

    #[tokio::test]
    async fn missing_root_counts_an_error_and_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        let (discovery, _queue, ledger) =
            setup(&gone, 4, OverflowPolicy::Block, Arc::new(GlobSkipPredicate::default()));
        let stats = discovery.run().await;
        assert_eq!(stats, DiscoveryStats::default());
        let tally = ledger.tally();
        assert_eq!(tally.discovery_errors, 1);
        assert!(ledger.is_complete());
    }
}
