//! switchyard-metrics: request outcome tracking for Switchyard.
//!
//! The edge router (in-process, or external via outcome ingestion) records
//! one sample per request. The continuous monitor reads trailing-window
//! aggregates (error rate, latency percentiles) from the same window.
//!
//! # Architecture
//!
//! ```text
//! OutcomeWindow
//!   ├── record() / ingest()   ← router or POST /api/v1/outcomes
//!   ├── snapshot_at()         → per-environment WindowMetrics
//!   └── totals()              → lifetime counters for /metrics
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod prometheus;
pub mod window;

pub use prometheus::{render_prometheus, Exposition};
pub use window::{OutcomeSample, OutcomeWindow, WindowMetrics};
