//! switchyard-state: embedded state store for Switchyard.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for environments, the traffic state singleton and its revision
//! log, migration plans, health verdicts, deployment history, and the
//! global migration lease.
//!
//! # Atomicity
//!
//! Every mutation runs in a single redb write transaction. Readers open
//! their own read transaction and therefore observe either the previous
//! or the new committed value, never a partial write. redb admits one
//! writer at a time, which serializes history appends and lease grabs.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{LeaseOutcome, StateStore};
pub use types::*;
