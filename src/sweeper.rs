//! Periodic housekeeping for the abuse-control maps.
//!
//! One [`Sweeper`] owns a background task that evicts expired limiter entries
//! and expired blacklist entries. The task is started explicitly, shut down
//! explicitly, and aborted if the handle is dropped; it is never an implicit
//! side effect of constructing a component.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::rate_limit::RateLimiter;
use crate::refresh::RefreshGuard;

/// Handle to the background sweep task.
pub struct Sweeper {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Start sweeping both components every `every`.
    ///
    /// Sweeps take the same locks as foreground traffic, so a tick can never
    /// observe a torn entry; a missed tick is delayed, not bunched.
    #[must_use]
    pub fn spawn<T>(
        limiter: Arc<RateLimiter>,
        refresh_guard: Arc<RefreshGuard<T>>,
        every: Duration,
    ) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let (shutdown, mut signal) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let limiter_removed = limiter.sweep_expired().await;
                        let blacklist_removed = refresh_guard.sweep_expired().await;
                        if limiter_removed > 0 || blacklist_removed > 0 {
                            debug!(limiter_removed, blacklist_removed, "sweep complete");
                        }
                    }
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow_and_update() {
                            break;
                        }
                    }
                }
            }
        });
        Self {
            shutdown,
            task: Some(task),
        }
    }

    /// Stop the task and wait for the current tick, if any, to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!("sweeper task ended abnormally: {err}");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
