//! Scripted delivery sinks for tests. No side effects, no network.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::sink::{DeliveryReceipt, DeliveryRequest, DeliverySink, SinkError};
use super::types::Channel;

/// Sink whose outcomes are scripted up front. Consumes one scripted
/// outcome per send; once the script runs dry it falls back to the
/// configured default. Records every request it sees.
pub struct ScriptedSink {
    channel: Channel,
    script: Mutex<VecDeque<Result<(), String>>>,
    default: Mutex<Result<(), String>>,
    requests: Mutex<Vec<u32>>,
    delay: Option<Duration>,
}

impl ScriptedSink {
    /// Sink that delivers every request.
    pub fn delivering(channel: Channel) -> Self {
        Self {
            channel,
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(Ok(())),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sink that fails every request with the given reason.
    pub fn failing(channel: Channel, reason: &str) -> Self {
        let sink = Self::delivering(channel);
        *sink.default.lock().unwrap() = Err(reason.to_string());
        sink
    }

    /// Sink that fails `failures` times and then delivers.
    pub fn flaky(channel: Channel, failures: u32, reason: &str) -> Self {
        let sink = Self::delivering(channel);
        {
            let mut script = sink.script.lock().unwrap();
            for _ in 0..failures {
                script.push_back(Err(reason.to_string()));
            }
        }
        sink
    }

    /// Queue one explicit outcome ahead of the default.
    pub fn push_outcome(&self, outcome: Result<(), String>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Make every send stall for `delay` before resolving, so coordinator
    /// timeouts can be driven.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Attempt numbers of every request this sink received, in order.
    pub fn seen_attempts(&self) -> Vec<u32> {
        self.requests.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliverySink for ScriptedSink {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, SinkError> {
        self.requests.lock().unwrap().push(request.attempt_number);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = {
            let mut script = self.script.lock().unwrap();
            match script.pop_front() {
                Some(outcome) => outcome,
                None => self.default.lock().unwrap().clone(),
            }
        };
        match outcome {
            Ok(()) => Ok(DeliveryReceipt::new(format!(
                "mock-{}-{}",
                self.channel,
                request.attempt_number
            ))),
            Err(reason) => Err(SinkError::failed(reason)),
        }
    }
}
