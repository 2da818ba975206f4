//! # Portcullis (Authentication Abuse Control)
//!
//! `portcullis` is the abuse-control authority sitting at the authentication
//! boundary of a user-management backend. It owns the two pieces of the flow
//! with real temporal state and concurrency hazards, and nothing else:
//!
//! - **Rate limiting** ([`rate_limit`]): sliding request windows per opaque
//!   key with escalating, failure-driven blocks. Backoff state deliberately
//!   survives window rollover, so waiting out one window never resets a
//!   penalty. Exceeding a limit is a first-class [`Decision`], not an error.
//! - **Refresh-token protection** ([`refresh`]): a blacklist of consumed token
//!   digests enforcing single-use semantics, plus per-user single-flight so
//!   concurrent refresh calls coalesce into one rotation instead of racing to
//!   consume the same token.
//!
//! [`AuthGate`] composes the two for handlers: dual-key login admission
//! (client address and account, whichever is more restrictive), outcome
//! reporting, and the full guarded refresh flow. [`Sweeper`] is the owned
//! background task that evicts expired state.
//!
//! ## Collaborators
//!
//! Credential verification, token signing and parsing, and persistence stay
//! outside this crate; handlers pass their outcomes in and consume the typed
//! decisions that come back. All state is in-memory and keyed by opaque
//! identifiers (address, normalized email, token digest), never by a raw
//! secret. One process is one authority: nothing here coordinates across
//! instances.

pub mod gate;
pub mod keys;
pub mod rate_limit;
pub mod refresh;
pub mod sweeper;

pub use gate::{AuthGate, GateConfig, GateError};
pub use rate_limit::{Decision, RateLimitConfig, RateLimiter};
pub use refresh::{BlacklistStats, RefreshGuard, RotationError};
pub use sweeper::Sweeper;
