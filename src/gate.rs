//! The abuse-control gate composed at the authentication boundary.
//!
//! HTTP handlers drive every login and refresh through an [`AuthGate`]:
//! admission first, then the external credential/rotation collaborator, then
//! outcome reporting. Login admission evaluates both the client address and
//! the target account and applies whichever verdict is more restrictive, which
//! defeats IP rotation and many-IP credential stuffing at the same time.

use std::future::Future;
use std::sync::Arc;

use crate::keys;
use crate::rate_limit::{Decision, RateLimitConfig, RateLimiter};
use crate::refresh::{RefreshGuard, RotationError};

/// Per-call-site rate limit configuration for the gate.
#[derive(Clone, Copy, Debug)]
pub struct GateConfig {
    login_per_ip: RateLimitConfig,
    login_per_email: RateLimitConfig,
    refresh_per_ip: RateLimitConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            login_per_ip: RateLimitConfig::login_per_ip(),
            login_per_email: RateLimitConfig::login_per_email(),
            refresh_per_ip: RateLimitConfig::refresh_per_ip(),
        }
    }
}

impl GateConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_login_per_ip(mut self, config: RateLimitConfig) -> Self {
        self.login_per_ip = config;
        self
    }

    #[must_use]
    pub fn with_login_per_email(mut self, config: RateLimitConfig) -> Self {
        self.login_per_email = config;
        self
    }

    #[must_use]
    pub fn with_refresh_per_ip(mut self, config: RateLimitConfig) -> Self {
        self.refresh_per_ip = config;
        self
    }
}

/// Refusals surfaced to the HTTP layer.
///
/// Each carries a machine-readable code for the response body; the HTTP layer
/// maps `RateLimited` to `429` (with headers built from the enclosed
/// [`Decision`]) and `TokenRevoked` to `401`.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("rate limit exceeded, retry in {}s", .0.retry_after_seconds.unwrap_or(0))]
    RateLimited(Decision),
    #[error("refresh token has been revoked")]
    TokenRevoked,
    #[error(transparent)]
    Rotation(#[from] RotationError),
}

impl GateError {
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "RATE_LIMIT_EXCEEDED",
            Self::TokenRevoked => "TOKEN_REVOKED",
            Self::Rotation(_) => "REFRESH_FAILED",
        }
    }
}

/// Abuse-control authority for one process, shared across handlers via `Arc`.
///
/// `T` is the rotation outcome type of the token-issuance collaborator.
pub struct AuthGate<T> {
    limiter: Arc<RateLimiter>,
    refresh_guard: Arc<RefreshGuard<T>>,
    config: GateConfig,
}

impl<T> AuthGate<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(
        limiter: Arc<RateLimiter>,
        refresh_guard: Arc<RefreshGuard<T>>,
        config: GateConfig,
    ) -> Self {
        Self {
            limiter,
            refresh_guard,
            config,
        }
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    #[must_use]
    pub fn refresh_guard(&self) -> &Arc<RefreshGuard<T>> {
        &self.refresh_guard
    }

    /// Admission decision for a login attempt.
    ///
    /// Both keys are always evaluated (and counted), so an attacker cannot
    /// probe one limit without spending the other.
    pub async fn check_login(&self, ip: &str, email: Option<&str>) -> Decision {
        let mut decision = self
            .limiter
            .admit(&keys::ip_key(ip), &self.config.login_per_ip)
            .await;
        if let Some(email) = email {
            let by_email = self
                .limiter
                .admit(&keys::email_key(email), &self.config.login_per_email)
                .await;
            decision = decision.more_restrictive(by_email);
        }
        decision
    }

    /// Report the credential-verification outcome for an admitted login.
    pub async fn record_login_outcome(&self, ip: &str, email: Option<&str>, succeeded: bool) {
        self.limiter
            .record_outcome(&keys::ip_key(ip), &self.config.login_per_ip, succeeded)
            .await;
        if let Some(email) = email {
            self.limiter
                .record_outcome(
                    &keys::email_key(email),
                    &self.config.login_per_email,
                    succeeded,
                )
                .await;
        }
    }

    /// Run a refresh-token rotation under full abuse control.
    ///
    /// Admission on the client key, blacklist check on the presented token,
    /// rotation coalesced per user, and on success the consumed token is
    /// blacklisted until its own expiry (`expires_at_secs`, from the token's
    /// claims). Presenting a revoked token counts as a failure against the
    /// client key, so replay attempts escalate into a block.
    pub async fn run_refresh<F, Fut>(
        &self,
        ip: &str,
        raw_token: &str,
        user_id: u64,
        expires_at_secs: u64,
        rotate: F,
    ) -> Result<T, GateError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let ip_key = keys::ip_key(ip);
        let decision = self.limiter.admit(&ip_key, &self.config.refresh_per_ip).await;
        if !decision.allowed {
            return Err(GateError::RateLimited(decision));
        }

        if self.refresh_guard.is_blacklisted(raw_token).await {
            self.limiter
                .record_outcome(&ip_key, &self.config.refresh_per_ip, false)
                .await;
            return Err(GateError::TokenRevoked);
        }

        let guard = Arc::clone(&self.refresh_guard);
        let consumed_token = raw_token.to_string();
        let outcome = self
            .refresh_guard
            .run_exclusive(user_id, move || async move {
                let issued = rotate().await.map_err(RotationError::new)?;
                // The presented token is spent the moment rotation succeeds.
                guard
                    .blacklist(&consumed_token, user_id, expires_at_secs)
                    .await;
                Ok(issued)
            })
            .await;

        self.limiter
            .record_outcome(&ip_key, &self.config.refresh_per_ip, outcome.is_ok())
            .await;
        outcome.map_err(GateError::from)
    }
}
