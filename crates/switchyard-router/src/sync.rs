//! Router state synchronization: bridges the state store to the edge router.
//!
//! After a restart the router may be serving nothing, or a revision the
//! store has since moved past. `RouterSync` compares the two and reloads
//! the router with the store's committed state when they differ.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use switchyard_state::{Revision, StateError, StateStore};

use crate::{EdgeRouter, RouterError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("router error: {0}")]
    Router(#[from] RouterError),
}

pub struct RouterSync {
    store: StateStore,
    router: Arc<dyn EdgeRouter>,
}

impl RouterSync {
    pub fn new(store: StateStore, router: Arc<dyn EdgeRouter>) -> Self {
        Self { store, router }
    }

    /// Reload the router if it is not serving the committed revision.
    ///
    /// Returns the revision pushed, or `None` if nothing needed doing.
    pub async fn sync(&self) -> Result<Option<Revision>, SyncError> {
        let Some(committed) = self.store.current_traffic()? else {
            debug!("no committed traffic state to sync");
            return Ok(None);
        };

        let serving = self.router.current_config().await?;
        if serving.as_ref() == Some(&committed) {
            debug!(revision = committed.revision, "router already in sync");
            return Ok(None);
        }

        self.router.reload(&committed).await?;
        info!(
            revision = committed.revision,
            previous = serving.map(|s| s.revision),
            "router synced to committed traffic state"
        );
        Ok(Some(committed.revision))
    }
}
