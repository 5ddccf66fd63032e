//! switchyard-core: shared identifiers, configuration, and retry policy.

pub mod backoff;
pub mod config;
pub mod types;

pub use backoff::BackoffPolicy;
pub use config::{SwitchyardConfig, validate_steps, validate_version};
pub use types::*;
