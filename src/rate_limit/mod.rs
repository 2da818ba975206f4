//! Sliding-window rate limiting with escalating backoff.
//!
//! One [`RateLimiter`] instance tracks every throttled key in the process:
//! client addresses, normalized account emails, whatever the call site derives
//! (see [`crate::keys`]). Each key carries a rolling request window plus a
//! failure count that survives window rollover, so an attacker cannot shed
//! accumulated backoff by waiting out a single window.
//!
//! Limits are per call site via [`RateLimitConfig`]; the limiter itself holds
//! no configuration. Exceeding a limit is an expected outcome surfaced as a
//! [`Decision`], never an error.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::{debug, warn};

mod config;
mod decision;

pub use config::RateLimitConfig;
pub use decision::Decision;

/// Exponent cap for block escalation: blocks never exceed 32x the base duration.
const MAX_BACKOFF_SHIFT: u32 = 5;

/// What one limiter call represents.
///
/// Only a completed attempt may touch backoff state: a pre-action admission
/// merely counts the request, otherwise each admission would erode the
/// failure recorded for the previous attempt and a block could never arm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    /// Pre-action admission; counts the request, leaves backoff untouched.
    Admission,
    /// A completed attempt that succeeded; erodes one recorded failure.
    Success,
    /// A completed attempt that failed; accumulates toward a block.
    Failure,
}

/// Per-key limiter state.
///
/// `window_ms` is captured from the config on every touch so the sweep can
/// decide expiry without knowing which call site owns the key.
#[derive(Clone, Copy, Debug)]
struct RateLimitEntry {
    count: u32,
    window_start: u64,
    window_ms: u64,
    failure_count: u32,
    last_failure_at: Option<u64>,
    blocked_until: Option<u64>,
}

impl RateLimitEntry {
    fn new(now: u64, window_ms: u64) -> Self {
        Self {
            count: 0,
            window_start: now,
            window_ms,
            failure_count: 0,
            last_failure_at: None,
            blocked_until: None,
        }
    }

    fn window_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.window_start) >= self.window_ms
    }

    fn blocked(&self, now: u64) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }

    /// Start a fresh window, preserving backoff state across the rollover.
    fn roll_window(&mut self, now: u64, window_ms: u64) {
        if self.window_expired(now) {
            self.count = 0;
            self.window_start = now;
        }
        self.window_ms = window_ms;
    }

    /// Arm (or re-arm) the block for the current failure count.
    ///
    /// Every failure beyond the threshold doubles the duration, capped at
    /// `2^MAX_BACKOFF_SHIFT` times the base.
    fn arm_block(&mut self, config: &RateLimitConfig, now: u64) -> u64 {
        let shift = self
            .failure_count
            .saturating_sub(config.max_failures())
            .min(MAX_BACKOFF_SHIFT);
        let duration = config.block_duration_ms() << shift;
        self.blocked_until = Some(now + duration);
        duration
    }
}

/// In-memory sliding-window rate limiter.
///
/// All keys share one map guarded by a single async mutex; every mutation is a
/// short read-modify-write with no await inside the critical section, so
/// per-key updates are linearized. Shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct RateLimiter {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a completed attempt against `key` and decide whether it was
    /// within limits.
    ///
    /// Single-call model: the call itself reports the attempt's outcome via
    /// `is_failure`, so a clean call erodes one recorded failure. For the
    /// split flow use [`admit`](Self::admit) before the protected action and
    /// [`record_outcome`](Self::record_outcome) after it.
    ///
    /// # Panics
    /// Panics on an empty key.
    pub async fn check(&self, key: &str, config: &RateLimitConfig, is_failure: bool) -> Decision {
        let attempt = if is_failure {
            Attempt::Failure
        } else {
            Attempt::Success
        };
        self.check_at(key, config, attempt, now_ms()).await
    }

    /// Admission check before attempting the protected action.
    ///
    /// Counts the request but leaves backoff state untouched: nothing has
    /// succeeded or failed yet. The outcome is reported separately through
    /// [`record_outcome`](Self::record_outcome).
    pub async fn admit(&self, key: &str, config: &RateLimitConfig) -> Decision {
        self.check_at(key, config, Attempt::Admission, now_ms()).await
    }

    /// Register the outcome of an already-admitted action.
    ///
    /// Failures feed the backoff state and may arm (or lengthen) a block;
    /// successes erode accumulated failures one at a time. The request count
    /// is untouched: the attempt was already counted at admission.
    pub async fn record_outcome(&self, key: &str, config: &RateLimitConfig, succeeded: bool) {
        self.record_outcome_at(key, config, succeeded, now_ms()).await;
    }

    /// Drop entries whose window has expired and which are not blocked.
    ///
    /// Idempotent; takes the same lock as [`check`](Self::check), so it is safe
    /// to run concurrently with foreground traffic. Returns the number of
    /// entries removed.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(now_ms()).await
    }

    /// Number of keys currently tracked.
    pub async fn tracked_keys(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn check_at(
        &self,
        key: &str,
        config: &RateLimitConfig,
        attempt: Attempt,
        now: u64,
    ) -> Decision {
        assert!(!key.is_empty(), "rate limit key must not be empty");

        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry::new(now, config.window_ms()));

        entry.roll_window(now, config.window_ms());

        // An active block denies outright; the attempt is not even counted.
        if let Some(until) = entry.blocked_until {
            if until > now {
                return Decision {
                    allowed: false,
                    remaining: 0,
                    reset_at: entry.window_start + config.window_ms(),
                    retry_after_seconds: Some(retry_after(until, now)),
                    blocked_until: Some(until),
                };
            }
            // The block was served in full: clean slate.
            entry.blocked_until = None;
            entry.failure_count = 0;
        }

        entry.count += 1;

        match attempt {
            Attempt::Failure => {
                entry.failure_count += 1;
                entry.last_failure_at = Some(now);
                if entry.failure_count >= config.max_failures() {
                    let duration = entry.arm_block(config, now);
                    warn!(key, block_ms = duration, "rate limit block armed");
                    return Decision {
                        allowed: false,
                        remaining: 0,
                        reset_at: entry.window_start + config.window_ms(),
                        retry_after_seconds: Some(retry_after(now + duration, now)),
                        blocked_until: entry.blocked_until,
                    };
                }
            }
            Attempt::Success => {
                if entry.failure_count > 0 {
                    entry.failure_count -= 1;
                }
            }
            Attempt::Admission => {}
        }

        let allowed = entry.count <= config.max_requests();
        let reset_at = entry.window_start + config.window_ms();
        Decision {
            allowed,
            remaining: config.max_requests().saturating_sub(entry.count),
            reset_at,
            retry_after_seconds: if allowed {
                None
            } else {
                Some(retry_after(reset_at, now))
            },
            blocked_until: None,
        }
    }

    async fn record_outcome_at(
        &self,
        key: &str,
        config: &RateLimitConfig,
        succeeded: bool,
        now: u64,
    ) {
        assert!(!key.is_empty(), "rate limit key must not be empty");

        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry::new(now, config.window_ms()));

        entry.roll_window(now, config.window_ms());

        // No clean-slate handling here: outcomes arrive for actions that were
        // already admitted, and repeated failures must keep escalating the
        // block even across block expirations.
        if succeeded {
            if entry.failure_count > 0 {
                entry.failure_count -= 1;
            }
        } else {
            entry.failure_count += 1;
            entry.last_failure_at = Some(now);
            if entry.failure_count >= config.max_failures() {
                let duration = entry.arm_block(config, now);
                warn!(key, block_ms = duration, "rate limit block armed");
            }
        }
    }

    #[cfg(test)]
    async fn entry(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.lock().await.get(key).copied()
    }

    async fn sweep_expired_at(&self, now: u64) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.window_expired(now) || entry.blocked(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "swept rate limit entries");
        }
        removed
    }
}

fn now_ms() -> u64 {
    u64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}

/// Seconds until `until`, rounded up so clients never retry early.
fn retry_after(until: u64, now: u64) -> u64 {
    until.saturating_sub(now).div_ceil(1000)
}
