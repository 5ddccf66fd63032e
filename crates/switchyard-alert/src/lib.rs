//! switchyard-alert: alert fan-out for Switchyard.
//!
//! Alerts raised by the monitor and the planner go through an
//! `AlertFanout`, which suppresses repeats of the same cooldown key within
//! the cooldown window and hands the rest to every registered sink.
//! Delivery runs on spawned tasks with a timeout, so a slow or failing
//! sink never blocks the caller.

pub mod fanout;
pub mod sink;

pub use fanout::AlertFanout;
pub use sink::{AlertSink, ChannelSink, TracingSink};
