//! switchyard-health: health probing for Switchyard environments.
//!
//! Each environment exposes a cheap liveness path and a deep path that
//! exercises its dependencies. A probe runs the requested checks against
//! every endpoint of the environment, with a per-call timeout and bounded
//! retries, and reports the result as a `HealthVerdict`.
//!
//! # Architecture
//!
//! ```text
//! Prober (trait)
//!   └── HealthProber
//!       ├── endpoints from StateStore
//!       ├── http_probe() → CheckOutcome   (per endpoint × check)
//!       └── BackoffPolicy::retry on failed checks
//!
//! wait_until_healthy(prober, id, max_wait, poll) → final HealthVerdict
//! ```
//!
//! Remote failures never surface as errors. They are encoded in the
//! verdict so callers can gate on `verdict.healthy` alone.

pub mod checker;
pub mod prober;

pub use checker::{http_probe, CheckKind, DEFAULT_CHECKS};
pub use prober::{wait_until_healthy, HealthProber, Prober};
