//! Switchyard continuous monitor.
//!
//! Runs beside any migration, on its own fixed interval:
//!
//! ```text
//!   tick ──▶ Prober (every environment) ──▶ verdicts ─┐
//!        ──▶ OutcomeWindow (trailing window) ─────────┼─▶ thresholds ─▶ AlertFanout
//!        ──▶ availability (healthy ticks / ticks) ────┘                    │
//!                                                   Critical + running plan ▼
//!                                                              RollbackAdvice channel
//! ```
//!
//! The monitor never writes traffic weights. Advice goes to the
//! deployment controller, which re-checks health before acting on it.

pub mod monitor;
pub mod thresholds;

pub use monitor::{ContinuousMonitor, RollbackAdvice, TickReport};
pub use thresholds::{evaluate, Breach, Thresholds};
