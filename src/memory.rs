use crate::config::MemoryConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tracks system memory usage and holds back model stages while memory
/// pressure is high.
pub struct MemoryMonitor {
    config: MemoryConfig,
    paused: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
}

impl MemoryMonitor {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            paused: Arc::new(AtomicBool::new(false)),
            resume_notify: Arc::new(Notify::new()),
        }
    }

    /// Get a handle the sequential driver uses to check pause state
    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            paused: Arc::clone(&self.paused),
            resume_notify: Arc::clone(&self.resume_notify),
        }
    }

    /// Start the background sampling task; it stops when `cancel` fires
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let paused = Arc::clone(&self.paused);
        let resume_notify = Arc::clone(&self.resume_notify);
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut sys = System::new();

            loop {
                sys.refresh_memory();
                if let Some(percent) = used_percent(sys.used_memory(), sys.total_memory()) {
                    apply_sample(&paused, &resume_notify, &config, percent);
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.check_interval) => {}
                }
            }

            // Never leave a waiter parked once monitoring stops
            paused.store(false, Ordering::SeqCst);
            resume_notify.notify_waiters();
        })
    }
}

fn used_percent(used: u64, total: u64) -> Option<f64> {
    (total > 0).then(|| used as f64 / total as f64 * 100.0)
}

/// Hysteresis: pause above the high mark, resume only below the low mark
fn apply_sample(paused: &AtomicBool, resume_notify: &Notify, config: &MemoryConfig, percent: f64) {
    let currently_paused = paused.load(Ordering::SeqCst);

    if !currently_paused && percent > config.high_percent {
        paused.store(true, Ordering::SeqCst);
        warn!(
            memory_percent = format!("{:.1}", percent),
            threshold = config.high_percent,
            "Memory pressure detected, holding model stages"
        );
    } else if currently_paused && percent < config.low_percent {
        paused.store(false, Ordering::SeqCst);
        resume_notify.notify_waiters();
        info!(
            memory_percent = format!("{:.1}", percent),
            threshold = config.low_percent,
            "Memory recovered, resuming model stages"
        );
    } else {
        debug!(
            memory_percent = format!("{:.1}", percent),
            paused = currently_paused,
            "Memory check"
        );
    }
}

/// Cheaply cloneable view of the monitor's pause state
#[derive(Clone)]
pub struct MemoryHandle {
    paused: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
}

impl MemoryHandle {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Wait until not paused (returns immediately if not paused)
    pub async fn wait_if_paused(&self) {
        while self.is_paused() {
            let notified = self.resume_notify.notified();
            if !self.is_paused() {
                break;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_used_percent() {
        assert_eq!(used_percent(50, 200), Some(25.0));
        assert_eq!(used_percent(1, 0), None);
    }

    #[test]
    fn test_hysteresis() {
        let monitor = MemoryMonitor::new(MemoryConfig::default());
        let handle = monitor.handle();
        let config = MemoryConfig::default();

        apply_sample(&monitor.paused, &monitor.resume_notify, &config, 95.0);
        assert!(handle.is_paused());
        // Between the marks: stay paused
        apply_sample(&monitor.paused, &monitor.resume_notify, &config, 80.0);
        assert!(handle.is_paused());
        apply_sample(&monitor.paused, &monitor.resume_notify, &config, 70.0);
        assert!(!handle.is_paused());
        // Between the marks from below: stay running
        apply_sample(&monitor.paused, &monitor.resume_notify, &config, 85.0);
        assert!(!handle.is_paused());
    }

    #[tokio::test]
    async fn test_wait_if_paused_returns_immediately_when_not_paused() {
        let monitor = MemoryMonitor::new(MemoryConfig::default());
        monitor.handle().wait_if_paused().await;
    }

    #[tokio::test]
    async fn test_waiter_released_on_recovery() {
        let monitor = MemoryMonitor::new(MemoryConfig::default());
        let config = MemoryConfig::default();
        apply_sample(&monitor.paused, &monitor.resume_notify, &config, 99.0);

        let handle = monitor.handle();
        let waiter = tokio::spawn(async move { handle.wait_if_paused().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        apply_sample(&monitor.paused, &monitor.resume_notify, &config, 10.0);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
