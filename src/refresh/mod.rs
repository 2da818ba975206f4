//! Refresh-token single-use enforcement.
//!
//! Two pieces of state, both owned by [`RefreshGuard`]:
//!
//! - a blacklist of consumed token ids, so a rotated or revoked refresh token
//!   can never be presented again before its natural expiry;
//! - an in-flight registry that coalesces concurrent refresh calls for the
//!   same user into one rotation, so racing duplicate requests cannot consume
//!   the same single-use token twice and spuriously log the user out.
//!
//! Tokens are identified by a truncated digest ([`crate::keys::token_id`]);
//! the raw secret is never stored.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::keys;

/// Rotation failure shared by every coalesced caller.
///
/// Cloneable because a single execution's outcome is handed to all waiters;
/// the underlying collaborator error is reference-counted, not duplicated.
#[derive(Clone, Debug, thiserror::Error)]
#[error("token rotation failed: {0}")]
pub struct RotationError(Arc<anyhow::Error>);

impl RotationError {
    #[must_use]
    pub fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

/// Blacklist record for one consumed token id. Times are epoch seconds.
#[derive(Clone, Copy, Debug)]
struct BlacklistEntry {
    user_id: u64,
    blacklisted_at: u64,
    expires_at: u64,
}

/// Blacklist counters for the monitoring collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BlacklistStats {
    pub total_entries: usize,
    pub active_entries: usize,
}

/// One in-flight rotation, shareable between coalesced callers.
type PendingRotation<T> = Shared<BoxFuture<'static, Result<T, RotationError>>>;

/// Single-use guard for refresh tokens.
///
/// `T` is the rotation outcome shared between coalesced callers (in practice
/// the freshly issued token pair); it must be cheap to clone.
pub struct RefreshGuard<T> {
    blacklist: Mutex<HashMap<String, BlacklistEntry>>,
    // Arc so the wrapped rotation future can deregister itself on completion.
    in_flight: Arc<Mutex<HashMap<u64, PendingRotation<T>>>>,
}

impl<T> Default for RefreshGuard<T> {
    fn default() -> Self {
        Self {
            blacklist: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> RefreshGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `raw_token` has already been consumed.
    ///
    /// An entry past its expiry counts as absent: the token would be rejected
    /// by signature/expiry checks anyway, so it is evicted on sight.
    pub async fn is_blacklisted(&self, raw_token: &str) -> bool {
        self.is_blacklisted_at(raw_token, now_secs()).await
    }

    /// Mark `raw_token` as consumed until its own expiry.
    ///
    /// Idempotent: re-blacklisting the same token refreshes its metadata.
    pub async fn blacklist(&self, raw_token: &str, user_id: u64, expires_at_secs: u64) {
        self.blacklist_at(raw_token, user_id, expires_at_secs, now_secs())
            .await;
    }

    /// Run `operation` unless a rotation for `user_id` is already in flight,
    /// in which case attach to it and share its outcome.
    ///
    /// The in-flight entry is registered before any await point and removed
    /// by the wrapped future itself once the outcome is ready, success or
    /// failure alike, so one failed rotation never poisons the next attempt.
    /// A hung `operation` holds the per-user slot indefinitely; callers that
    /// need a timeout must wrap `operation` themselves.
    pub async fn run_exclusive<F, Fut>(&self, user_id: u64, operation: F) -> Result<T, RotationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RotationError>> + Send + 'static,
    {
        let pending = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(&user_id) {
                debug!(user_id, "coalescing concurrent token refresh");
                existing.clone()
            } else {
                let registry = Arc::clone(&self.in_flight);
                let rotation = operation();
                let wrapped = async move {
                    let outcome = rotation.await;
                    // Deregister before yielding the outcome so the next
                    // refresh for this user starts a fresh execution.
                    registry.lock().await.remove(&user_id);
                    outcome
                }
                .boxed()
                .shared();
                in_flight.insert(user_id, wrapped.clone());
                wrapped
            }
        };
        pending.await
    }

    /// Purge blacklist entries whose tokens have expired on their own.
    /// Returns the number of entries removed.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(now_secs()).await
    }

    /// Blacklist counters; `active_entries` excludes already-expired tokens.
    pub async fn stats(&self) -> BlacklistStats {
        let now = now_secs();
        let blacklist = self.blacklist.lock().await;
        BlacklistStats {
            total_entries: blacklist.len(),
            active_entries: blacklist
                .values()
                .filter(|entry| entry.expires_at > now)
                .count(),
        }
    }

    /// Number of rotations currently in flight across all users.
    pub async fn pending_rotations(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    async fn is_blacklisted_at(&self, raw_token: &str, now: u64) -> bool {
        let id = keys::token_id(raw_token);
        let mut blacklist = self.blacklist.lock().await;
        match blacklist.get(&id) {
            Some(entry) if entry.expires_at > now => true,
            Some(entry) => {
                let age_secs = now.saturating_sub(entry.blacklisted_at);
                debug!(user_id = entry.user_id, age_secs, "evicting expired blacklist entry");
                blacklist.remove(&id);
                false
            }
            None => false,
        }
    }

    async fn blacklist_at(&self, raw_token: &str, user_id: u64, expires_at: u64, now: u64) {
        let id = keys::token_id(raw_token);
        let mut blacklist = self.blacklist.lock().await;
        blacklist.insert(
            id,
            BlacklistEntry {
                user_id,
                blacklisted_at: now,
                expires_at,
            },
        );
    }

    async fn sweep_expired_at(&self, now: u64) -> usize {
        let mut blacklist = self.blacklist.lock().await;
        let before = blacklist.len();
        blacklist.retain(|_, entry| entry.expires_at > now);
        let removed = before - blacklist.len();
        if removed > 0 {
            debug!(removed, remaining = blacklist.len(), "swept blacklist entries");
        }
        removed
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::oneshot;

    const NOW: u64 = 1_700_000_000;

    #[tokio::test]
    async fn blacklisted_token_is_recognized_until_expiry() {
        let guard = RefreshGuard::<()>::new();
        guard.blacklist_at("token-a", 1, NOW + 3600, NOW).await;

        assert!(guard.is_blacklisted_at("token-a", NOW).await);
        assert!(!guard.is_blacklisted_at("token-b", NOW).await);
        // Past expiry the entry counts as absent and is evicted.
        assert!(!guard.is_blacklisted_at("token-a", NOW + 3600).await);
        assert_eq!(guard.stats().await.total_entries, 0);
    }

    #[tokio::test]
    async fn token_blacklisted_with_past_expiry_is_not_blacklisted() {
        let guard = RefreshGuard::<()>::new();
        guard.blacklist_at("stale", 1, NOW - 3600, NOW).await;
        assert!(!guard.is_blacklisted_at("stale", NOW).await);
    }

    #[tokio::test]
    async fn reblacklisting_refreshes_expiry() {
        let guard = RefreshGuard::<()>::new();
        guard.blacklist_at("token", 1, NOW + 10, NOW).await;
        guard.blacklist_at("token", 1, NOW + 3600, NOW + 5).await;

        // The first expiry has passed; the refreshed one keeps the entry live.
        assert!(guard.is_blacklisted_at("token", NOW + 60).await);
    }

    #[tokio::test]
    async fn sweep_purges_expired_entries() {
        let guard = RefreshGuard::<()>::new();
        guard.blacklist_at("live", 1, NOW + 3600, NOW).await;
        guard.blacklist_at("dead", 2, NOW + 10, NOW).await;

        assert_eq!(guard.sweep_expired_at(NOW + 60).await, 1);
        let stats = guard.stats().await;
        assert_eq!(stats.total_entries, 1);
        assert!(guard.is_blacklisted_at("live", NOW + 60).await);
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce_into_one_execution() {
        let guard = Arc::new(RefreshGuard::<String>::new());
        let executions = Arc::new(AtomicU32::new(0));
        let (release, gate) = oneshot::channel::<()>();

        let first = {
            let guard = Arc::clone(&guard);
            let executions = Arc::clone(&executions);
            tokio::spawn(async move {
                guard
                    .run_exclusive(42, move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        gate.await.ok();
                        Ok("first".to_string())
                    })
                    .await
            })
        };

        // Let the first rotation start and park on the gate.
        while guard.pending_rotations().await == 0 {
            tokio::task::yield_now().await;
        }

        let second = {
            let guard = Arc::clone(&guard);
            let executions = Arc::clone(&executions);
            tokio::spawn(async move {
                guard
                    .run_exclusive(42, move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        Ok("second".to_string())
                    })
                    .await
            })
        };

        // Give the second caller time to attach, then release the gate.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        release.send(()).unwrap();

        assert_eq!(first.await.unwrap().unwrap(), "first");
        assert_eq!(second.await.unwrap().unwrap(), "first");
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(guard.pending_rotations().await, 0);
    }

    #[tokio::test]
    async fn sequential_refreshes_execute_fresh() {
        let guard = RefreshGuard::<u32>::new();
        let out = guard.run_exclusive(42, || async { Ok(1) }).await.unwrap();
        assert_eq!(out, 1);
        let out = guard.run_exclusive(42, || async { Ok(2) }).await.unwrap();
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn users_do_not_interfere() {
        let guard = Arc::new(RefreshGuard::<&'static str>::new());
        let (release, gate) = oneshot::channel::<()>();

        let parked = {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move {
                guard
                    .run_exclusive(1, move || async move {
                        gate.await.ok();
                        Ok("one")
                    })
                    .await
            })
        };
        while guard.pending_rotations().await == 0 {
            tokio::task::yield_now().await;
        }

        // User 2 completes while user 1 is still parked.
        let out = guard.run_exclusive(2, || async { Ok("two") }).await.unwrap();
        assert_eq!(out, "two");

        release.send(()).unwrap();
        assert_eq!(parked.await.unwrap().unwrap(), "one");
    }

    #[tokio::test]
    async fn failure_clears_registry_and_reaches_all_callers() {
        let guard = Arc::new(RefreshGuard::<u32>::new());
        let (release, gate) = oneshot::channel::<()>();

        let first = {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move {
                guard
                    .run_exclusive(42, move || async move {
                        gate.await.ok();
                        Err(RotationError::new(anyhow!("store unavailable")))
                    })
                    .await
            })
        };
        while guard.pending_rotations().await == 0 {
            tokio::task::yield_now().await;
        }
        let second = {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move { guard.run_exclusive(42, || async { Ok(7) }).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        release.send(()).unwrap();

        let first_err = first.await.unwrap().unwrap_err();
        let second_err = second.await.unwrap().unwrap_err();
        assert!(first_err.to_string().contains("store unavailable"));
        assert!(second_err.to_string().contains("store unavailable"));

        // The failed rotation did not poison the slot.
        assert_eq!(guard.pending_rotations().await, 0);
        let out = guard.run_exclusive(42, || async { Ok(7) }).await.unwrap();
        assert_eq!(out, 7);
    }
}
