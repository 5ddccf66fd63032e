//! switchyard-router: edge router collaborators for Switchyard.
//!
//! The traffic switch executor talks to the edge through the `EdgeRouter`
//! trait: hand it a `TrafficState` to adopt, then read back what it is
//! actually serving. Two implementations ship:
//!
//! - `WeightedRouter`: in-process smooth weighted round-robin. Requests
//!   reach it through `proxy_app`, which forwards them and records each
//!   outcome into the shared `OutcomeWindow`.
//! - `FileRouter`: writes an upstream file for an external proxy (write
//!   to a temp file, then rename) and runs a reload command.
//!
//! `RouterSync` pushes the store's committed state to the router at startup.

use async_trait::async_trait;
use thiserror::Error;

use switchyard_state::TrafficState;

pub mod file;
pub mod proxy;
pub mod sync;
pub mod weighted;

pub use file::FileRouter;
pub use proxy::proxy_app;
pub use sync::{RouterSync, SyncError};
pub use weighted::WeightedRouter;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("reload failed: {0}")]
    Reload(String),

    #[error("reload timed out after {0}ms")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid upstream config: {0}")]
    Config(String),
}

impl RouterError {
    /// Hiccups worth retrying. A config the router cannot parse is not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RouterError::Config(_))
    }
}

/// An edge router that adopts traffic weights on a reload signal.
#[async_trait]
pub trait EdgeRouter: Send + Sync {
    /// Signal the router to adopt `state`.
    async fn reload(&self, state: &TrafficState) -> Result<(), RouterError>;

    /// The configuration the router is currently serving, if any.
    async fn current_config(&self) -> Result<Option<TrafficState>, RouterError>;
}
