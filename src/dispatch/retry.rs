//! Retry scheduling for failed delivery attempts.
//!
//! Failed channels are retried on an exponential backoff timer until they
//! deliver or the per-channel attempt budget runs out. Pending timers are
//! cancelled when a report is recalled, and reconstructed from the
//! attempts ledger when the process restarts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::lifecycle::ReportId;

use super::coordinator::{AttemptDisposition, DeliveryEngine, RETRY_SCHEDULER_ACTOR};
use super::types::Channel;

/// Per-channel attempt budget. Attempt one happens at dispatch; the
/// scheduler and manual retries share the remaining four slots.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Backoff configuration for delivery retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_DELIVERY_ATTEMPTS,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(15 * 60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt that follows `failed_attempt`. Doubles per
    /// failure from `base_delay`, capped at `max_delay`, with up to 50%
    /// downward jitter to spread thundering retries.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        if self.jitter {
            delay.mul_f64(0.5 + rand::random::<f64>() * 0.5)
        } else {
            delay
        }
    }
}

/// What a restart recovery pass found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Dispatched reports restored into the in-memory delivery table.
    pub reports_restored: usize,
    /// Channels whose retry timer was re-armed.
    pub retries_resumed: usize,
    /// Attempts that were in flight at crash time, resolved as failed.
    pub interrupted_attempts: usize,
    /// Channels found with no budget left, routed to the failed queue.
    pub exhausted_channels: usize,
    /// Channels left untouched because their report was recalled.
    pub cancelled_channels: usize,
}

/// Durable marker that a scheduler instance completed recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryCheckpoint {
    pub checkpoint_id: String,
    pub hostname: String,
    pub process_id: u32,
    pub recovered_at: DateTime<Utc>,
    pub retries_resumed: usize,
    pub interrupted_attempts: usize,
}

impl RetryCheckpoint {
    pub fn new(report: &RecoveryReport) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            checkpoint_id: format!(
                "scheduler_{}_{}",
                Utc::now().format("%Y%m%d_%H%M%S"),
                rand::random::<u32>()
            ),
            hostname,
            process_id: std::process::id(),
            recovered_at: Utc::now(),
            retries_resumed: report.retries_resumed,
            interrupted_attempts: report.interrupted_attempts,
        }
    }
}

struct PendingRetry {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Arms one timer per failed channel and walks it through the remaining
/// attempt budget. All bookkeeping is keyed by (report, channel) so a
/// recall or a manual retry can cancel exactly the timer it means to.
pub struct RetryScheduler {
    engine: Arc<DeliveryEngine>,
    policy: RetryPolicy,
    pending: Mutex<HashMap<(ReportId, Channel), PendingRetry>>,
    generation: AtomicU64,
}

impl RetryScheduler {
    pub fn new(engine: Arc<DeliveryEngine>, policy: RetryPolicy) -> Self {
        Self {
            engine,
            policy,
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Arm the timer for the attempt after `failed_attempt`. Passing 0
    /// re-runs a channel whose first attempt never started.
    pub fn schedule(self: &Arc<Self>, report_id: ReportId, channel: Channel, failed_attempt: u32) {
        let delay = self.policy.delay_after(failed_attempt);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        info!(
            report_id = %report_id,
            channel = %channel,
            next_attempt = failed_attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling delivery retry"
        );

        let scheduler = Arc::clone(self);
        let key = (report_id.clone(), channel);
        let task_key = key.clone();
        // Publish the entry under the same lock the timer task takes, so a
        // zero-delay timer firing on another worker cannot find it missing
        // and treat itself as cancelled.
        let mut pending = self.pending.lock().unwrap();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut pending = scheduler.pending.lock().unwrap();
                match pending.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        pending.remove(&task_key);
                    }
                    // A newer timer or a cancel replaced this one.
                    _ => return,
                }
            }
            let (report_id, channel) = task_key;
            match scheduler
                .engine
                .run_attempt(&report_id, channel, RETRY_SCHEDULER_ACTOR)
                .await
            {
                Ok(AttemptDisposition::FailedRetryable { failed_attempt }) => {
                    scheduler.schedule(report_id, channel, failed_attempt);
                }
                Ok(AttemptDisposition::FailedExhausted) => {
                    warn!(
                        report_id = %report_id,
                        channel = %channel,
                        "Delivery retries exhausted, channel queued for manual resolution"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(
                        report_id = %report_id,
                        channel = %channel,
                        error = %e,
                        "Retry attempt could not be executed"
                    );
                }
            }
        });
        if let Some(previous) = pending.insert(key, PendingRetry { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel the pending timer for one channel. Returns whether a timer
    /// was actually armed.
    pub fn cancel(&self, report_id: &ReportId, channel: Channel) -> bool {
        let removed = self
            .pending
            .lock()
            .unwrap()
            .remove(&(report_id.clone(), channel));
        match removed {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer for a report. Used on recall.
    pub fn cancel_for_report(&self, report_id: &ReportId) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let keys: Vec<(ReportId, Channel)> = pending
            .keys()
            .filter(|(id, _)| id == report_id)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(entry) = pending.remove(key) {
                entry.handle.abort();
            }
        }
        keys.len()
    }

    /// Abort all timers. Part of shutdown.
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let count = pending.len();
        for (_, entry) in pending.drain() {
            entry.handle.abort();
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_scheduled(&self, report_id: &ReportId, channel: Channel) -> bool {
        self.pending
            .lock()
            .unwrap()
            .contains_key(&(report_id.clone(), channel))
    }
}
