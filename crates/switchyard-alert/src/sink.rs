//! Alert sinks.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use switchyard_state::{AlertEvent, Severity};

/// An external channel that accepts alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &AlertEvent) -> anyhow::Result<()>;
}

/// Writes every alert as a structured log record.
pub struct TracingSink;

#[async_trait]
impl AlertSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn deliver(&self, event: &AlertEvent) -> anyhow::Result<()> {
        let kind = event.kind.as_str();
        let environment = event.environment_id.map(|id| id.to_string());
        match event.severity {
            Severity::Critical => error!(alert = kind, ?environment, message = %event.message, "critical alert"),
            Severity::Warning => warn!(alert = kind, ?environment, message = %event.message, "warning alert"),
            Severity::Info => info!(alert = kind, ?environment, message = %event.message, "alert"),
        }
        Ok(())
    }
}

/// Forwards alerts into an mpsc channel.
pub struct ChannelSink {
    tx: mpsc::Sender<AlertEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<AlertEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl AlertSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn deliver(&self, event: &AlertEvent) -> anyhow::Result<()> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| anyhow::anyhow!("alert channel closed"))
    }
}
