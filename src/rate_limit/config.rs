//! Rate limit configuration and per-call-site presets.

const MINUTE_MS: u64 = 60 * 1000;

const LOGIN_IP_WINDOW_MS: u64 = 15 * MINUTE_MS;
const LOGIN_IP_MAX_REQUESTS: u32 = 20;
const LOGIN_IP_MAX_FAILURES: u32 = 10;
const LOGIN_IP_BLOCK_MS: u64 = 15 * MINUTE_MS;

const LOGIN_EMAIL_WINDOW_MS: u64 = 15 * MINUTE_MS;
const LOGIN_EMAIL_MAX_REQUESTS: u32 = 10;
const LOGIN_EMAIL_MAX_FAILURES: u32 = 5;
const LOGIN_EMAIL_BLOCK_MS: u64 = 30 * MINUTE_MS;

const REFRESH_IP_WINDOW_MS: u64 = MINUTE_MS;
const REFRESH_IP_MAX_REQUESTS: u32 = 30;
const REFRESH_IP_MAX_FAILURES: u32 = 10;
const REFRESH_IP_BLOCK_MS: u64 = 5 * MINUTE_MS;

/// Limits applied to one key at one call site.
///
/// Each call site (login per IP, login per email, refresh per IP) uses its own
/// values; the limiter itself is configuration-free and shared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    window_ms: u64,
    max_requests: u32,
    max_failures: u32,
    block_duration_ms: u64,
}

impl RateLimitConfig {
    /// Build a validated config.
    ///
    /// # Panics
    /// Panics when any field is zero. An all-allowing or instantly-blocking
    /// config is a programming error; defaulting to "allow" here would be a
    /// security regression.
    #[must_use]
    pub fn new(window_ms: u64, max_requests: u32, max_failures: u32, block_duration_ms: u64) -> Self {
        assert!(window_ms > 0, "window_ms must be positive");
        assert!(max_requests >= 1, "max_requests must be at least 1");
        assert!(max_failures >= 1, "max_failures must be at least 1");
        assert!(block_duration_ms > 0, "block_duration_ms must be positive");
        Self {
            window_ms,
            max_requests,
            max_failures,
            block_duration_ms,
        }
    }

    /// Login attempts from one client address.
    #[must_use]
    pub fn login_per_ip() -> Self {
        Self::new(
            LOGIN_IP_WINDOW_MS,
            LOGIN_IP_MAX_REQUESTS,
            LOGIN_IP_MAX_FAILURES,
            LOGIN_IP_BLOCK_MS,
        )
    }

    /// Login attempts against one account, regardless of source address.
    /// Tighter than the IP preset to blunt credential stuffing from many IPs.
    #[must_use]
    pub fn login_per_email() -> Self {
        Self::new(
            LOGIN_EMAIL_WINDOW_MS,
            LOGIN_EMAIL_MAX_REQUESTS,
            LOGIN_EMAIL_MAX_FAILURES,
            LOGIN_EMAIL_BLOCK_MS,
        )
    }

    /// Token refresh calls from one client address.
    #[must_use]
    pub fn refresh_per_ip() -> Self {
        Self::new(
            REFRESH_IP_WINDOW_MS,
            REFRESH_IP_MAX_REQUESTS,
            REFRESH_IP_MAX_FAILURES,
            REFRESH_IP_BLOCK_MS,
        )
    }

    #[must_use]
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    #[must_use]
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    #[must_use]
    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    #[must_use]
    pub fn block_duration_ms(&self) -> u64 {
        self.block_duration_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        let ip = RateLimitConfig::login_per_ip();
        let email = RateLimitConfig::login_per_email();
        let refresh = RateLimitConfig::refresh_per_ip();

        // Per-email limits must be at least as strict as per-IP limits.
        assert!(email.max_requests() <= ip.max_requests());
        assert!(email.max_failures() <= ip.max_failures());
        assert!(refresh.window_ms() < ip.window_ms());
    }

    #[test]
    #[should_panic(expected = "max_failures")]
    fn zero_max_failures_panics() {
        let _ = RateLimitConfig::new(1000, 5, 0, 1000);
    }

    #[test]
    #[should_panic(expected = "block_duration_ms")]
    fn zero_block_duration_panics() {
        let _ = RateLimitConfig::new(1000, 5, 3, 0);
    }
}
