use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::lifecycle::Report;

use super::types::Channel;

/// Everything a sink needs to produce one outbound delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub report: Report,
    pub channel: Channel,
    pub attempt_number: u32,
}

/// Proof of delivery returned by a sink.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub confirmation_id: String,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryReceipt {
    pub fn new(confirmation_id: impl Into<String>) -> Self {
        Self {
            confirmation_id: confirmation_id.into(),
            delivered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{0}")]
    Failed(String),
}

impl SinkError {
    pub fn failed(reason: impl Into<String>) -> Self {
        SinkError::Failed(reason.into())
    }
}

/// One outbound channel implementation. Sinks are stateless from the
/// coordinator's point of view; retries re-invoke `send` with a fresh
/// attempt number. A send that neither returns nor errors is cut off by
/// the coordinator's timeout and counted as a failed attempt.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, SinkError>;
}

/// Channel-indexed set of sinks the coordinator fans out to.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: HashMap<Channel, Arc<dyn DeliverySink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sink: Arc<dyn DeliverySink>) {
        self.sinks.insert(sink.channel(), sink);
    }

    pub fn with_sink(mut self, sink: Arc<dyn DeliverySink>) -> Self {
        self.register(sink);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn DeliverySink>> {
        self.sinks.get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.sinks.keys().copied().collect();
        channels.sort();
        channels
    }
}

/// Sink that records the delivery in the process log and succeeds. Stands
/// in for real channel integrations in local deployments and demos.
pub struct LogSink {
    channel: Channel,
}

impl LogSink {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Registry covering every channel with log-only sinks.
    pub fn registry() -> SinkRegistry {
        let mut registry = SinkRegistry::new();
        for channel in Channel::ALL {
            registry.register(Arc::new(LogSink::new(channel)));
        }
        registry
    }
}

#[async_trait]
impl DeliverySink for LogSink {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, SinkError> {
        info!(
            report_id = %request.report.report_id,
            patient = %request.report.patient_name,
            channel = %self.channel,
            attempt = request.attempt_number,
            "Delivering report"
        );
        Ok(DeliveryReceipt::new(format!(
            "{}-{}",
            self.channel,
            Uuid::new_v4().simple()
        )))
    }
}
