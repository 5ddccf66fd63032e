//! Alert fan-out with per-key cooldown.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use switchyard_state::AlertEvent;

use crate::sink::AlertSink;

/// Alerts kept for `recent()`.
const RECENT_CAPACITY: usize = 100;

/// Upper bound on one sink delivery.
const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

struct CooldownState {
    /// cooldown_key → timestamp (ms) of the last delivered alert.
    last_sent: HashMap<String, u64>,
    recent: VecDeque<AlertEvent>,
}

/// Publishes alerts to every sink, at most once per key per cooldown.
pub struct AlertFanout {
    sinks: Vec<Arc<dyn AlertSink>>,
    cooldown_ms: u64,
    delivery_timeout: Duration,
    state: Mutex<CooldownState>,
}

impl AlertFanout {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            sinks: Vec::new(),
            cooldown_ms: cooldown.as_millis() as u64,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            state: Mutex::new(CooldownState {
                last_sent: HashMap::new(),
                recent: VecDeque::new(),
            }),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Publish an alert. Returns false if it was suppressed by cooldown.
    ///
    /// Must be called from within a tokio runtime; delivery is spawned.
    pub fn publish(&self, event: AlertEvent) -> bool {
        {
            let mut state = self.state.lock().expect("alert cooldown lock");
            // Keys whose window has passed can no longer suppress anything.
            let cooldown_ms = self.cooldown_ms;
            state
                .last_sent
                .retain(|_, last| event.timestamp < last.saturating_add(cooldown_ms));
            if let Some(last) = state.last_sent.get(&event.cooldown_key) {
                if event.timestamp < last.saturating_add(self.cooldown_ms) {
                    debug!(key = %event.cooldown_key, "alert suppressed by cooldown");
                    return false;
                }
            }
            state
                .last_sent
                .insert(event.cooldown_key.clone(), event.timestamp);
            state.recent.push_back(event.clone());
            while state.recent.len() > RECENT_CAPACITY {
                state.recent.pop_front();
            }
        }

        for sink in &self.sinks {
            let sink = sink.clone();
            let event = event.clone();
            let timeout = self.delivery_timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, sink.deliver(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(sink = sink.name(), key = %event.cooldown_key, error = %e, "alert delivery failed");
                    }
                    Err(_) => {
                        warn!(sink = sink.name(), key = %event.cooldown_key, "alert delivery timed out");
                    }
                }
            });
        }
        true
    }

    /// Most recently published alerts, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AlertEvent> {
        let state = self.state.lock().expect("alert cooldown lock");
        let skip = state.recent.len().saturating_sub(limit);
        state.recent.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ChannelSink, TracingSink};
    use async_trait::async_trait;
    use switchyard_core::EnvironmentId;
    use switchyard_state::{AlertKind, Severity};
    use tokio::sync::mpsc;

    fn alert(kind: AlertKind, env: Option<EnvironmentId>, ts: u64) -> AlertEvent {
        AlertEvent::new(kind, Severity::Critical, env, "test", ts)
    }

    #[tokio::test]
    async fn repeats_within_cooldown_are_suppressed() {
        let (tx, mut rx) = mpsc::channel(16);
        let fanout = AlertFanout::new(Duration::from_secs(300))
            .with_sink(Arc::new(ChannelSink::new(tx)));

        assert!(fanout.publish(alert(AlertKind::ErrorRate, None, 1_000)));
        assert!(!fanout.publish(alert(AlertKind::ErrorRate, None, 10_000)));
        // Different key is independent.
        assert!(fanout.publish(alert(AlertKind::Latency, None, 10_000)));
        // After the window the key fires again.
        assert!(fanout.publish(alert(AlertKind::ErrorRate, None, 301_000)));

        let mut delivered = Vec::new();
        for _ in 0..3 {
            delivered.push(rx.recv().await.unwrap().kind);
        }
        assert_eq!(delivered.iter().filter(|k| **k == AlertKind::ErrorRate).count(), 2);
        assert_eq!(fanout.recent(10).len(), 3);
    }

    #[tokio::test]
    async fn expired_keys_are_forgotten() {
        let fanout = AlertFanout::new(Duration::from_secs(300)).with_sink(Arc::new(TracingSink));
        let envs = [EnvironmentId::Primary, EnvironmentId::Secondary, EnvironmentId::Canary];
        for (i, env) in envs.into_iter().enumerate() {
            assert!(fanout.publish(alert(AlertKind::EnvironmentUnhealthy, Some(env), 1_000 + i as u64)));
        }
        assert_eq!(fanout.state.lock().unwrap().last_sent.len(), 3);

        assert!(fanout.publish(alert(AlertKind::ErrorRate, None, 400_000)));
        let state = fanout.state.lock().unwrap();
        assert_eq!(state.last_sent.len(), 1);
        assert!(state.last_sent.contains_key(&alert(AlertKind::ErrorRate, None, 0).cooldown_key));
    }

    #[tokio::test]
    async fn environment_is_part_of_the_key() {
        let fanout = AlertFanout::new(Duration::from_secs(300)).with_sink(Arc::new(TracingSink));
        assert!(fanout.publish(alert(AlertKind::EnvironmentUnhealthy, Some(EnvironmentId::Primary), 1)));
        assert!(fanout.publish(alert(AlertKind::EnvironmentUnhealthy, Some(EnvironmentId::Secondary), 1)));
    }

    struct StuckSink;

    #[async_trait]
    impl AlertSink for StuckSink {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn deliver(&self, _event: &AlertEvent) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_sink_does_not_block_others() {
        let (tx, mut rx) = mpsc::channel(4);
        let fanout = AlertFanout::new(Duration::from_secs(1))
            .with_sink(Arc::new(StuckSink))
            .with_sink(Arc::new(ChannelSink::new(tx)));

        assert!(fanout.publish(alert(AlertKind::RollbackFailed, None, 0)));
        assert_eq!(rx.recv().await.unwrap().kind, AlertKind::RollbackFailed);
    }

    #[test]
    fn recent_is_bounded() {
        let fanout = AlertFanout::new(Duration::ZERO);
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            for i in 0..150 {
                fanout.publish(alert(AlertKind::Availability, None, i));
            }
        });
        let recent = fanout.recent(1_000);
        assert_eq!(recent.len(), RECENT_CAPACITY);
        assert_eq!(recent.last().unwrap().timestamp, 149);
    }
}
