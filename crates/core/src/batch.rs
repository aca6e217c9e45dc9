//! Pool-wide batch size: workers signal, a periodic tick decides.

use crate::config::BatchingConfig;
use crate::metrics::MetricsRegistry;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Normal,
    /// Reductions are suppressed until the deadline passes.
    Cooling { until: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Reduced { from: usize, to: usize },
    Raised { from: usize, to: usize },
}

#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub default_size: usize,
    pub factor: usize,
    pub cooldown: Duration,
    pub recovery_batches: u64,
}

impl BatchPolicy {
    pub fn from_config(default_size: usize, cfg: &BatchingConfig) -> Self {
        Self {
            default_size: default_size.max(1),
            factor: cfg.reduction_factor.max(2),
            cooldown: cfg.cooldown(),
            recovery_batches: cfg.recovery_batches.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchGovernor {
    policy: BatchPolicy,
    state: ControllerState,
    target: usize,
    clean_streak: u64,
}

impl BatchGovernor {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            target: policy.default_size,
            policy,
            state: ControllerState::Normal,
            clean_streak: 0,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Apply the signals gathered since the previous step.
    pub fn step(&mut self, now: Instant, exhausted: u64, clean: u64) -> Option<Adjustment> {
        if let ControllerState::Cooling { until } = self.state {
            if now >= until {
                self.state = ControllerState::Normal;
            }
        }

        if exhausted > 0 {
            self.clean_streak = 0;
            return match self.state {
                ControllerState::Cooling { .. } => None,
                ControllerState::Normal => {
                    self.state = ControllerState::Cooling {
                        until: now + self.policy.cooldown,
                    };
                    let from = self.target;
                    let to = (from / self.policy.factor).max(1);
                    if to < from {
                        self.target = to;
                        Some(Adjustment::Reduced { from, to })
                    } else {
                        None
                    }
                }
            };
        }

        if self.state != ControllerState::Normal || self.target >= self.policy.default_size {
            return None;
        }
        self.clean_streak += clean;
        if self.clean_streak < self.policy.recovery_batches {
            return None;
        }
        self.clean_streak = 0;
        let from = self.target;
        let to = from
            .saturating_mul(self.policy.factor)
            .min(self.policy.default_size);
        self.target = to;
        Some(Adjustment::Raised { from, to })
    }
}

#[derive(Debug)]
pub struct BatchController {
    target: AtomicUsize,
    exhausted: AtomicU64,
    clean: AtomicU64,
    governor: Mutex<BatchGovernor>,
    metrics: Arc<MetricsRegistry>,
}

impl BatchController {
    pub fn new(policy: BatchPolicy, metrics: Arc<MetricsRegistry>) -> Self {
        let governor = BatchGovernor::new(policy);
        metrics.set_batch_size(governor.target());
        Self {
            target: AtomicUsize::new(governor.target()),
            exhausted: AtomicU64::new(0),
            clean: AtomicU64::new(0),
            governor: Mutex::new(governor),
            metrics,
        }
    }

    /// Current pool-wide target batch size.
    pub fn target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    pub fn report_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::AcqRel);
    }

    pub fn report_clean_batch(&self) {
        self.clean.fetch_add(1, Ordering::AcqRel);
    }

    pub fn state(&self) -> ControllerState {
        self.governor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    pub fn tick(&self, now: Instant) -> Option<Adjustment> {
        let exhausted = self.exhausted.swap(0, Ordering::AcqRel);
        let clean = self.clean.swap(0, Ordering::AcqRel);
        let mut governor = self.governor.lock().unwrap_or_else(PoisonError::into_inner);
        let adjustment = governor.step(now, exhausted, clean);
        self.target.store(governor.target(), Ordering::Release);
        drop(governor);

        match adjustment {
            Some(Adjustment::Reduced { from, to }) => {
                self.metrics.batch_reduced();
                self.metrics.set_batch_size(to);
                info!(from, to, exhausted, "resource pressure, reducing batch size");
            }
            Some(Adjustment::Raised { from, to }) => {
                self.metrics.set_batch_size(to);
                info!(from, to, "pressure cleared, raising batch size");
            }
            None if exhausted > 0 => {
                debug!(exhausted, "exhaustion signals absorbed by cooldown");
            }
            None => {}
        }
        adjustment
    }

    /// Run `tick` every `interval` until `shutdown` flips to true.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick(Instant::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("batch controller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BatchPolicy {
        BatchPolicy {
            default_size: 64,
            factor: 2,
            cooldown: Duration::from_secs(5),
            recovery_batches: 3,
        }
    }

    #[test]
    fn exhaustion_halves_target_and_cools_down() {
        let mut g = BatchGovernor::new(policy());
        let t0 = Instant::now();
        assert_eq!(
            g.step(t0, 1, 0),
            Some(Adjustment::Reduced { from: 64, to: 32 })
        );
        assert!(matches!(g.state(), ControllerState::Cooling { .. }));

        // Debounced while cooling.
        assert_eq!(g.step(t0 + Duration::from_secs(1), 7, 0), None);
        assert_eq!(g.target(), 32);

        assert_eq!(
            g.step(t0 + Duration::from_secs(6), 1, 0),
            Some(Adjustment::Reduced { from: 32, to: 16 })
        );
    }

    #[test]
    fn target_never_drops_below_one() {
        let mut g = BatchGovernor::new(BatchPolicy {
            default_size: 3,
            cooldown: Duration::ZERO,
            ..policy()
        });
        let t = Instant::now();
        assert_eq!(g.step(t, 1, 0), Some(Adjustment::Reduced { from: 3, to: 1 }));
        assert_eq!(g.step(t, 1, 0), None);
        assert_eq!(g.target(), 1);
    }

    #[test]
    fn recovery_steps_back_to_default_without_overshoot() {
        let mut g = BatchGovernor::new(BatchPolicy {
            default_size: 48,
            ..policy()
        });
        let t0 = Instant::now();
        g.step(t0, 1, 0);
        g.step(t0 + Duration::from_secs(1), 1, 0);
        assert_eq!(g.target(), 24);

        // Clean batches during cooldown do not count.
        assert_eq!(g.step(t0 + Duration::from_secs(2), 0, 10), None);

        let later = t0 + Duration::from_secs(10);
        assert_eq!(g.step(later, 0, 2), None);
        assert_eq!(g.step(later, 0, 1), Some(Adjustment::Raised { from: 24, to: 48 }));
        assert_eq!(g.step(later, 0, 100), None);
        assert_eq!(g.target(), 48);
    }

    #[test]
    fn exhaustion_resets_clean_streak() {
        let mut g = BatchGovernor::new(BatchPolicy {
            cooldown: Duration::ZERO,
            ..policy()
        });
        let t = Instant::now();
        g.step(t, 1, 0);
        g.step(t, 0, 2);
        g.step(t, 1, 0);
        assert_eq!(g.target(), 16);
        assert_eq!(g.step(t, 0, 2), None);
        assert_eq!(g.step(t, 0, 1), Some(Adjustment::Raised { from: 16, to: 32 }));
    }

    #[test]
    fn controller_publishes_target_on_tick() {
        let metrics = Arc::new(MetricsRegistry::new());
        let c = BatchController::new(policy(), metrics.clone());
        assert_eq!(c.target(), 64);
        c.report_exhausted();
        c.report_exhausted();
        assert_eq!(c.target(), 64, "signals apply on the next tick");
        c.tick(Instant::now());
        assert_eq!(c.target(), 32);
        let snap = metrics.snapshot();
        assert_eq!(snap.batch_size, 32);
        assert_eq!(snap.batch_reductions, 1);
    }

    #[tokio::test]
    async fn loop_ticks_until_shutdown() {
        let c = Arc::new(BatchController::new(policy(), Arc::new(MetricsRegistry::new())));
        let (tx, rx) = watch::channel(false);
        let handle = c.clone().spawn(Duration::from_millis(10), rx);
        c.report_exhausted();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(c.target(), 32);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
