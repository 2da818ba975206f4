//! Admission decisions returned by the rate limiter.

use serde::Serialize;

/// The allow/deny verdict for one attempt against one key.
///
/// Hitting a limit is an expected outcome, not an error: the HTTP layer maps a
/// denied decision to `429` using these fields (`Retry-After` from
/// `retry_after_seconds`, `X-RateLimit-Remaining`/`-Reset` from `remaining` and
/// `reset_at`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the attempt may proceed.
    pub allowed: bool,
    /// Requests left in the current window, saturating at zero.
    pub remaining: u32,
    /// Epoch milliseconds when the current window ends.
    pub reset_at: u64,
    /// Seconds until a blocked key may retry, rounded up. Only set on denial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    /// Epoch milliseconds until which the key is blocked outright.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<u64>,
}

impl Decision {
    /// Pick the more restrictive of two decisions.
    ///
    /// Any denial wins over any allowance, and its retry hint is the one
    /// surfaced. Between two denials the longer-blocked one wins; between two
    /// allowances the one with fewer remaining requests wins.
    #[must_use]
    pub fn more_restrictive(self, other: Decision) -> Decision {
        match (self.allowed, other.allowed) {
            (true, false) => other,
            (false, true) => self,
            (false, false) => {
                if other.retry_after_seconds.unwrap_or(0) > self.retry_after_seconds.unwrap_or(0) {
                    other
                } else {
                    self
                }
            }
            (true, true) => {
                if other.remaining < self.remaining {
                    other
                } else {
                    self
                }
            }
        }
    }
}
