//! Fan-out delivery coordination.
//!
//! The coordinator consumes authorized reports, marks the owning sample
//! dispatched, and runs one delivery attempt per requested channel. Each
//! channel resolves independently; failures are handed to the retry
//! scheduler, and the report's aggregate status is recomputed after every
//! resolution. When the last channel settles the outcome is fed back into
//! the sample lifecycle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::audit::{AuditEvent, AuditStore};
use crate::lifecycle::{
    LifecycleError, Report, ReportId, SampleId, SampleRegistry, SampleStage, REPORTS_LEDGER,
};
use crate::storage::LedgerStorage;

use super::retry::{RecoveryReport, RetryCheckpoint, RetryPolicy, RetryScheduler};
use super::sink::{DeliveryRequest, SinkRegistry};
use super::types::{
    AttemptOutcome, Channel, ChannelResolution, DeliveryAttempt, DeliveryOverview, DispatchError,
    DispatchStats, FailedDelivery, FailedQueueStats, ReportDeliveryStatus,
};

pub(crate) const ATTEMPTS_LEDGER: &str = "delivery_attempts";
pub(crate) const DISPATCHES_LEDGER: &str = "dispatches";
pub(crate) const CHECKPOINTS_LEDGER: &str = "scheduler_checkpoints";

/// Actor recorded for automated fan-out bookkeeping.
pub const DISPATCH_ACTOR: &str = "dispatch-coordinator";
/// Actor recorded for timer-driven retry attempts.
pub const RETRY_SCHEDULER_ACTOR: &str = "retry-scheduler";

/// Durable record of a fan-out decision, written before the sample is
/// marked dispatched so recovery always knows which channels were chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchIntent {
    pub report_id: ReportId,
    pub sample_id: SampleId,
    pub channels: Vec<Channel>,
    pub actor: String,
    pub dispatched_at: DateTime<Utc>,
}

/// How one delivery attempt left its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDisposition {
    Delivered,
    /// Failed with budget remaining; the caller should arm a retry.
    FailedRetryable { failed_attempt: u32 },
    /// Failed on the final budget slot. Only manual resolution remains.
    FailedExhausted,
    /// Failed after the report was recalled. No retry follows.
    FailedCancelled,
    /// No attempt was run.
    Skipped { reason: &'static str },
}

#[derive(Debug, Clone, Default)]
struct ChannelDelivery {
    attempts: Vec<DeliveryAttempt>,
    cancelled: bool,
}

impl ChannelDelivery {
    fn latest(&self) -> Option<&DeliveryAttempt> {
        self.attempts.last()
    }

    fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    fn delivered(&self) -> bool {
        matches!(
            self.latest().map(|a| a.outcome),
            Some(AttemptOutcome::Delivered)
        )
    }

    fn resolution(&self, max_attempts: u32) -> ChannelResolution {
        match self.latest() {
            None => {
                if self.cancelled {
                    ChannelResolution::Failed
                } else {
                    ChannelResolution::Unresolved
                }
            }
            Some(attempt) => match attempt.outcome {
                AttemptOutcome::Delivered => ChannelResolution::Delivered,
                AttemptOutcome::Pending => ChannelResolution::Unresolved,
                AttemptOutcome::Failed => {
                    if self.cancelled || self.attempt_count() >= max_attempts {
                        ChannelResolution::Failed
                    } else {
                        ChannelResolution::Unresolved
                    }
                }
            },
        }
    }
}

#[derive(Debug)]
struct ReportDelivery {
    report: Report,
    channels: BTreeMap<Channel, ChannelDelivery>,
    dispatched_at: DateTime<Utc>,
    recalled: bool,
    converged: bool,
}

impl ReportDelivery {
    fn new(report: Report, channels: &[Channel], dispatched_at: DateTime<Utc>) -> Self {
        let channels = channels
            .iter()
            .map(|c| (*c, ChannelDelivery::default()))
            .collect();
        Self {
            report,
            channels,
            dispatched_at,
            recalled: false,
            converged: false,
        }
    }

    fn aggregate(&self, max_attempts: u32) -> ReportDeliveryStatus {
        ReportDeliveryStatus::aggregate(self.channels.values().map(|c| c.resolution(max_attempts)))
    }

    fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.channels
            .values()
            .filter(|c| c.delivered())
            .filter_map(|c| c.latest().map(|a| a.timestamp))
            .max()
    }
}

/// Channel that needs action after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumeAction {
    /// Failed mid-budget; re-arm the retry timer.
    Resume { channel: Channel, after_attempt: u32 },
    /// An attempt was in flight at crash time and must be resolved first.
    Interrupted { channel: Channel },
    Exhausted { channel: Channel },
    Cancelled { channel: Channel },
}

/// Shared attempt execution core. The coordinator runs first attempts
/// through it and the retry scheduler runs every subsequent one, so both
/// paths record outcomes, budgets, and convergence identically.
pub(crate) struct DeliveryEngine {
    table: tokio::sync::Mutex<HashMap<ReportId, ReportDelivery>>,
    sinks: SinkRegistry,
    storage: Arc<LedgerStorage>,
    audit: Arc<dyn AuditStore>,
    registry: Arc<SampleRegistry>,
    max_attempts: u32,
    sink_timeout: Duration,
}

enum BeginAttempt {
    Started { report: Report, attempt: DeliveryAttempt },
    Skip(&'static str),
}

impl DeliveryEngine {
    fn has_sink(&self, channel: Channel) -> bool {
        self.sinks.get(channel).is_some()
    }

    async fn register_report(
        &self,
        report: Report,
        channels: &[Channel],
        dispatched_at: DateTime<Utc>,
    ) {
        let mut table = self.table.lock().await;
        table.insert(
            report.report_id.clone(),
            ReportDelivery::new(report, channels, dispatched_at),
        );
    }

    /// Claim the next attempt slot for a channel and persist the pending
    /// marker. Returns `Skip` when there is nothing to do.
    async fn begin_attempt(
        &self,
        report_id: &ReportId,
        channel: Channel,
    ) -> Result<BeginAttempt, DispatchError> {
        let (report, attempt) = {
            let mut table = self.table.lock().await;
            let entry = table.get_mut(report_id).ok_or_else(|| {
                DispatchError::UnknownReport {
                    report_id: report_id.clone(),
                }
            })?;
            if entry.recalled {
                return Ok(BeginAttempt::Skip("report recalled"));
            }
            let state = entry.channels.get_mut(&channel).ok_or_else(|| {
                DispatchError::NothingToRetry {
                    report_id: report_id.clone(),
                    channel,
                }
            })?;
            if state.cancelled {
                return Ok(BeginAttempt::Skip("channel cancelled"));
            }
            match state.latest().map(|a| a.outcome) {
                Some(AttemptOutcome::Delivered) => {
                    return Ok(BeginAttempt::Skip("already delivered"))
                }
                Some(AttemptOutcome::Pending) => {
                    return Ok(BeginAttempt::Skip("attempt already in flight"))
                }
                _ => {}
            }
            let attempt_number = state.attempt_count() + 1;
            if attempt_number > self.max_attempts {
                return Ok(BeginAttempt::Skip("attempt budget exhausted"));
            }
            let attempt = DeliveryAttempt {
                report_id: report_id.clone(),
                channel,
                attempt_number,
                outcome: AttemptOutcome::Pending,
                failure_reason: None,
                timestamp: Utc::now(),
            };
            state.attempts.push(attempt.clone());
            (entry.report.clone(), attempt)
        };

        if let Err(e) = self.storage.append(ATTEMPTS_LEDGER, &attempt).await {
            // Roll the claimed slot back so the budget is not burned by a
            // send that never happened.
            let mut table = self.table.lock().await;
            if let Some(state) = table
                .get_mut(report_id)
                .and_then(|entry| entry.channels.get_mut(&channel))
            {
                state.attempts.pop();
            }
            return Err(e.into());
        }
        Ok(BeginAttempt::Started { report, attempt })
    }

    /// Resolve the in-flight attempt on a channel: persist and audit the
    /// outcome, then publish it, refresh the aggregate, and feed
    /// convergence back into the sample lifecycle when the last channel
    /// settles. Nothing is published unless the ledger row and the audit
    /// event both land; a failed write leaves the attempt pending so
    /// restart recovery closes it.
    async fn resolve_attempt(
        &self,
        report_id: &ReportId,
        channel: Channel,
        outcome: AttemptOutcome,
        failure_reason: Option<String>,
        note: Option<String>,
        actor: &str,
    ) -> Result<AttemptDisposition, DispatchError> {
        // Stage the resolution; the table is untouched until the writes land.
        let resolved = {
            let table = self.table.lock().await;
            let entry = table.get(report_id).ok_or_else(|| {
                DispatchError::UnknownReport {
                    report_id: report_id.clone(),
                }
            })?;
            let state = entry.channels.get(&channel).ok_or_else(|| {
                DispatchError::NothingToRetry {
                    report_id: report_id.clone(),
                    channel,
                }
            })?;
            match state.latest() {
                Some(a) if a.outcome == AttemptOutcome::Pending => {
                    let mut resolved = a.clone();
                    resolved.outcome = outcome;
                    resolved.failure_reason = failure_reason;
                    resolved.timestamp = Utc::now();
                    resolved
                }
                _ => {
                    return Ok(AttemptDisposition::Skipped {
                        reason: "no attempt in flight",
                    })
                }
            }
        };

        self.storage.append(ATTEMPTS_LEDGER, &resolved).await?;
        self.audit
            .record(AuditEvent::delivery_outcome(
                report_id.as_str(),
                actor,
                channel.as_str(),
                resolved.attempt_number,
                &outcome.to_string(),
                resolved.failure_reason.clone().or(note),
            ))
            .await?;

        let (sample_id, disposition, aggregate, converged) = {
            let mut table = self.table.lock().await;
            let entry = table.get_mut(report_id).ok_or_else(|| {
                DispatchError::UnknownReport {
                    report_id: report_id.clone(),
                }
            })?;
            let recalled = entry.recalled;
            let state = entry.channels.get_mut(&channel).ok_or_else(|| {
                DispatchError::NothingToRetry {
                    report_id: report_id.clone(),
                    channel,
                }
            })?;
            let cancelled = state.cancelled;
            let attempt_count = state.attempt_count();
            match state.attempts.last_mut() {
                Some(a)
                    if a.outcome == AttemptOutcome::Pending
                        && a.attempt_number == resolved.attempt_number =>
                {
                    *a = resolved.clone();
                }
                _ => {
                    return Ok(AttemptDisposition::Skipped {
                        reason: "no attempt in flight",
                    })
                }
            }

            let disposition = match outcome {
                AttemptOutcome::Delivered => AttemptDisposition::Delivered,
                AttemptOutcome::Failed if recalled || cancelled => {
                    AttemptDisposition::FailedCancelled
                }
                AttemptOutcome::Failed if attempt_count >= self.max_attempts => {
                    AttemptDisposition::FailedExhausted
                }
                AttemptOutcome::Failed => AttemptDisposition::FailedRetryable {
                    failed_attempt: attempt_count,
                },
                AttemptOutcome::Pending => AttemptDisposition::Skipped {
                    reason: "attempt left pending",
                },
            };

            let aggregate = entry.aggregate(self.max_attempts);
            let converged = aggregate.is_terminal() && !entry.converged;
            if converged {
                entry.converged = true;
            }
            (
                entry.report.sample_id.clone(),
                disposition,
                aggregate,
                converged,
            )
        };

        match outcome {
            AttemptOutcome::Delivered => info!(
                report_id = %report_id,
                channel = %channel,
                attempt = resolved.attempt_number,
                aggregate = %aggregate,
                "Delivery attempt succeeded"
            ),
            _ => warn!(
                report_id = %report_id,
                channel = %channel,
                attempt = resolved.attempt_number,
                aggregate = %aggregate,
                reason = resolved.failure_reason.as_deref().unwrap_or("unknown"),
                "Delivery attempt failed"
            ),
        }

        if matches!(disposition, AttemptDisposition::FailedExhausted) {
            self.audit
                .record(AuditEvent::record(
                    report_id.as_str(),
                    actor,
                    "RETRY_BUDGET_EXHAUSTED",
                    Some(format!(
                        "channel {channel} failed {} times",
                        resolved.attempt_number
                    )),
                ))
                .await?;
        }

        self.registry
            .note_delivery_status(&sample_id, report_id, aggregate);
        if converged {
            self.registry
                .on_report_converged(&sample_id, report_id, aggregate, DISPATCH_ACTOR)
                .await?;
        }
        Ok(disposition)
    }

    /// One full attempt: claim a slot, invoke the sink under the timeout,
    /// resolve the outcome.
    pub(crate) async fn run_attempt(
        &self,
        report_id: &ReportId,
        channel: Channel,
        actor: &str,
    ) -> Result<AttemptDisposition, DispatchError> {
        let (report, attempt) = match self.begin_attempt(report_id, channel).await? {
            BeginAttempt::Started { report, attempt } => (report, attempt),
            BeginAttempt::Skip(reason) => return Ok(AttemptDisposition::Skipped { reason }),
        };

        let request = DeliveryRequest {
            report,
            channel,
            attempt_number: attempt.attempt_number,
        };
        let outcome = match self.sinks.get(channel) {
            None => Err(format!("no sink registered for channel {channel}")),
            Some(sink) => {
                match tokio::time::timeout(self.sink_timeout, sink.send(&request)).await {
                    Ok(Ok(receipt)) => Ok(receipt),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!(
                        "timed out after {}s",
                        self.sink_timeout.as_secs()
                    )),
                }
            }
        };

        match outcome {
            Ok(receipt) => {
                self.resolve_attempt(
                    report_id,
                    channel,
                    AttemptOutcome::Delivered,
                    None,
                    Some(format!("confirmation {}", receipt.confirmation_id)),
                    actor,
                )
                .await
            }
            Err(reason) => {
                self.resolve_attempt(
                    report_id,
                    channel,
                    AttemptOutcome::Failed,
                    Some(reason),
                    None,
                    actor,
                )
                .await
            }
        }
    }

    /// Resolve an attempt that was in flight when the process died.
    async fn resolve_interrupted(
        &self,
        report_id: &ReportId,
        channel: Channel,
    ) -> Result<AttemptDisposition, DispatchError> {
        self.resolve_attempt(
            report_id,
            channel,
            AttemptOutcome::Failed,
            Some("interrupted by restart".to_string()),
            None,
            RETRY_SCHEDULER_ACTOR,
        )
        .await
    }

    async fn check_manual_retry(
        &self,
        report_id: &ReportId,
        channel: Channel,
    ) -> Result<(), DispatchError> {
        let table = self.table.lock().await;
        let entry = table
            .get(report_id)
            .ok_or_else(|| DispatchError::UnknownReport {
                report_id: report_id.clone(),
            })?;
        let state = entry
            .channels
            .get(&channel)
            .ok_or_else(|| DispatchError::NothingToRetry {
                report_id: report_id.clone(),
                channel,
            })?;
        if entry.recalled || state.cancelled {
            return Err(DispatchError::ReportRecalled {
                report_id: report_id.clone(),
                channel,
            });
        }
        match state.latest().map(|a| a.outcome) {
            Some(AttemptOutcome::Failed) => {
                if state.attempt_count() >= self.max_attempts {
                    Err(DispatchError::RetryExhausted {
                        report_id: report_id.clone(),
                        channel,
                    })
                } else {
                    Ok(())
                }
            }
            _ => Err(DispatchError::NothingToRetry {
                report_id: report_id.clone(),
                channel,
            }),
        }
    }

    /// Mark a report recalled and cancel every undelivered channel.
    /// Returns the channels that were cancelled.
    async fn cancel_report(&self, report_id: &ReportId) -> Vec<Channel> {
        let mut table = self.table.lock().await;
        let Some(entry) = table.get_mut(report_id) else {
            warn!(report_id = %report_id, "Recall for a report with no delivery state");
            return Vec::new();
        };
        entry.recalled = true;
        let mut cancelled = Vec::new();
        for (channel, state) in entry.channels.iter_mut() {
            if !state.delivered() && !state.cancelled {
                state.cancelled = true;
                cancelled.push(*channel);
            }
        }
        cancelled
    }

    /// Rebuild one report's delivery state from ledger rows. Returns the
    /// per-channel follow-ups plus the aggregate when it is already
    /// terminal at restore time.
    async fn restore_report(
        &self,
        report: Report,
        channels: Vec<Channel>,
        attempts: Vec<DeliveryAttempt>,
        recalled: bool,
        dispatched_at: DateTime<Utc>,
    ) -> (Vec<ResumeAction>, Option<ReportDeliveryStatus>) {
        let mut entry = ReportDelivery::new(report, &channels, dispatched_at);
        for row in attempts {
            let state = entry.channels.entry(row.channel).or_default();
            match row.outcome {
                AttemptOutcome::Pending => state.attempts.push(row),
                _ => match state.attempts.last_mut() {
                    Some(last)
                        if last.attempt_number == row.attempt_number
                            && last.outcome == AttemptOutcome::Pending =>
                    {
                        *last = row;
                    }
                    _ => state.attempts.push(row),
                },
            }
        }
        if recalled {
            entry.recalled = true;
            for state in entry.channels.values_mut() {
                if !state.delivered() {
                    state.cancelled = true;
                }
            }
        }

        let mut actions = Vec::new();
        for (channel, state) in &entry.channels {
            match state.latest() {
                None => {
                    if state.cancelled {
                        actions.push(ResumeAction::Cancelled { channel: *channel });
                    } else {
                        actions.push(ResumeAction::Resume {
                            channel: *channel,
                            after_attempt: 0,
                        });
                    }
                }
                Some(attempt) => match attempt.outcome {
                    AttemptOutcome::Delivered => {}
                    AttemptOutcome::Pending => {
                        actions.push(ResumeAction::Interrupted { channel: *channel })
                    }
                    AttemptOutcome::Failed => {
                        if state.cancelled {
                            actions.push(ResumeAction::Cancelled { channel: *channel });
                        } else if state.attempt_count() >= self.max_attempts {
                            actions.push(ResumeAction::Exhausted { channel: *channel });
                        } else {
                            actions.push(ResumeAction::Resume {
                                channel: *channel,
                                after_attempt: state.attempt_count(),
                            });
                        }
                    }
                },
            }
        }

        let aggregate = entry.aggregate(self.max_attempts);
        let terminal = aggregate.is_terminal().then_some(aggregate);
        if terminal.is_some() {
            entry.converged = true;
        }

        let report_id = entry.report.report_id.clone();
        let sample_id = entry.report.sample_id.clone();
        self.table.lock().await.insert(report_id.clone(), entry);
        self.registry
            .note_delivery_status(&sample_id, &report_id, aggregate);
        (actions, terminal)
    }

    async fn report_status(&self, report_id: &ReportId) -> Option<ReportDeliveryStatus> {
        let table = self.table.lock().await;
        table.get(report_id).map(|e| e.aggregate(self.max_attempts))
    }

    async fn attempts_for(&self, report_id: &ReportId) -> Option<Vec<DeliveryAttempt>> {
        let table = self.table.lock().await;
        table.get(report_id).map(|entry| {
            let mut attempts: Vec<DeliveryAttempt> = entry
                .channels
                .values()
                .flat_map(|c| c.attempts.iter().cloned())
                .collect();
            attempts.sort_by_key(|a| a.timestamp);
            attempts
        })
    }

    async fn overview(&self) -> Vec<DeliveryOverview> {
        let table = self.table.lock().await;
        let mut rows: Vec<DeliveryOverview> = table
            .values()
            .map(|entry| {
                let status = entry.aggregate(self.max_attempts);
                DeliveryOverview {
                    report_id: entry.report.report_id.clone(),
                    patient_name: entry.report.patient_name.clone(),
                    test_type: entry.report.test_type.clone(),
                    channels: entry.channels.keys().copied().collect(),
                    status,
                    dispatched_at: entry.dispatched_at,
                    delivered_at: (status == ReportDeliveryStatus::Delivered)
                        .then(|| entry.delivered_at())
                        .flatten(),
                }
            })
            .collect();
        rows.sort_by(|a, b| b.dispatched_at.cmp(&a.dispatched_at));
        rows
    }

    async fn failed_deliveries(&self) -> Vec<FailedDelivery> {
        let table = self.table.lock().await;
        let mut rows = Vec::new();
        for entry in table.values() {
            for (channel, state) in &entry.channels {
                let Some(latest) = state.latest() else { continue };
                if latest.outcome != AttemptOutcome::Failed {
                    continue;
                }
                rows.push(FailedDelivery {
                    report_id: entry.report.report_id.clone(),
                    patient_name: entry.report.patient_name.clone(),
                    test_type: entry.report.test_type.clone(),
                    channel: *channel,
                    failure_reason: latest
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                    failed_at: latest.timestamp,
                    attempt_count: state.attempt_count(),
                    exhausted: state.attempt_count() >= self.max_attempts,
                    recalled: entry.recalled || state.cancelled,
                });
            }
        }
        rows.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        rows
    }

    async fn dispatch_stats(&self) -> DispatchStats {
        let table = self.table.lock().await;
        let mut stats = DispatchStats {
            total: table.len(),
            ..Default::default()
        };
        for entry in table.values() {
            match entry.aggregate(self.max_attempts) {
                ReportDeliveryStatus::Delivered => stats.delivered += 1,
                ReportDeliveryStatus::Pending => stats.pending += 1,
                ReportDeliveryStatus::Partial => stats.partial += 1,
                ReportDeliveryStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

/// Public face of the dispatch subsystem. Owns the ready queue of
/// authorized reports, the delivery engine, and the retry scheduler.
pub struct DispatchCoordinator {
    engine: Arc<DeliveryEngine>,
    scheduler: Arc<RetryScheduler>,
    ready: tokio::sync::Mutex<BTreeMap<ReportId, Report>>,
    storage: Arc<LedgerStorage>,
    audit: Arc<dyn AuditStore>,
    registry: Arc<SampleRegistry>,
}

impl DispatchCoordinator {
    pub fn new(
        registry: Arc<SampleRegistry>,
        sinks: SinkRegistry,
        storage: Arc<LedgerStorage>,
        audit: Arc<dyn AuditStore>,
        policy: RetryPolicy,
        sink_timeout: Duration,
    ) -> Self {
        let engine = Arc::new(DeliveryEngine {
            table: tokio::sync::Mutex::new(HashMap::new()),
            sinks,
            storage: Arc::clone(&storage),
            audit: Arc::clone(&audit),
            registry: Arc::clone(&registry),
            max_attempts: policy.max_attempts,
            sink_timeout,
        });
        let scheduler = Arc::new(RetryScheduler::new(Arc::clone(&engine), policy));
        Self {
            engine,
            scheduler,
            ready: tokio::sync::Mutex::new(BTreeMap::new()),
            storage,
            audit,
            registry,
        }
    }

    /// Park an authorized report until channels are chosen for it.
    pub async fn enqueue_ready(&self, report: Report) {
        info!(
            report_id = %report.report_id,
            sample_id = %report.sample_id,
            "Report parked for dispatch"
        );
        self.ready
            .lock()
            .await
            .insert(report.report_id.clone(), report);
    }

    pub async fn ready_reports(&self) -> Vec<Report> {
        self.ready.lock().await.values().cloned().collect()
    }

    /// Dispatch a parked report. On validation failure the report stays
    /// parked; only a lifecycle rejection (the sample moved on without
    /// us) drops it from the queue.
    pub async fn dispatch_ready(
        &self,
        report_id: &ReportId,
        channels: Vec<Channel>,
        actor: &str,
    ) -> Result<ReportDeliveryStatus, DispatchError> {
        let report = self.ready.lock().await.remove(report_id).ok_or_else(|| {
            DispatchError::NotReady {
                report_id: report_id.clone(),
            }
        })?;
        match self.dispatch_report(report.clone(), channels, actor).await {
            Ok(status) => Ok(status),
            Err(e) => {
                match &e {
                    DispatchError::Lifecycle(LifecycleError::InvalidTransition { .. }) => {
                        warn!(
                            report_id = %report_id,
                            error = %e,
                            "Dropping stale ready-queue entry"
                        );
                    }
                    _ => {
                        self.ready
                            .lock()
                            .await
                            .insert(report.report_id.clone(), report);
                    }
                }
                Err(e)
            }
        }
    }

    /// Fan a report out to the given channels. Marks the sample
    /// dispatched, runs the first attempt on every channel concurrently,
    /// and returns the aggregate status after that first round.
    pub async fn dispatch_report(
        &self,
        report: Report,
        channels: Vec<Channel>,
        actor: &str,
    ) -> Result<ReportDeliveryStatus, DispatchError> {
        let mut seen = HashSet::new();
        let channels: Vec<Channel> = channels.into_iter().filter(|c| seen.insert(*c)).collect();
        if channels.is_empty() {
            return Err(DispatchError::EmptyChannelSet {
                report_id: report.report_id.clone(),
            });
        }
        for channel in &channels {
            if !self.engine.has_sink(*channel) {
                return Err(DispatchError::ChannelUnavailable { channel: *channel });
            }
        }

        let dispatched_at = Utc::now();
        let intent = DispatchIntent {
            report_id: report.report_id.clone(),
            sample_id: report.sample_id.clone(),
            channels: channels.clone(),
            actor: actor.to_string(),
            dispatched_at,
        };
        self.storage.append(DISPATCHES_LEDGER, &intent).await?;
        self.registry.begin_dispatch(&report.sample_id, actor).await?;
        self.engine
            .register_report(report.clone(), &channels, dispatched_at)
            .await;

        info!(
            report_id = %report.report_id,
            sample_id = %report.sample_id,
            channels = ?channels,
            actor = %actor,
            "Dispatching report"
        );

        let mut handles = Vec::new();
        for channel in channels {
            let engine = Arc::clone(&self.engine);
            let scheduler = Arc::clone(&self.scheduler);
            let report_id = report.report_id.clone();
            let actor = actor.to_string();
            let task = tokio::spawn(async move {
                match engine.run_attempt(&report_id, channel, &actor).await {
                    Ok(AttemptDisposition::FailedRetryable { failed_attempt }) => {
                        scheduler.schedule(report_id, channel, failed_attempt);
                    }
                    Ok(_) => {}
                    Err(e) => error!(
                        report_id = %report_id,
                        channel = %channel,
                        error = %e,
                        "Delivery attempt aborted"
                    ),
                }
            });
            handles.push((channel, task));
        }
        for (channel, handle) in handles {
            if let Err(e) = handle.await {
                error!(
                    report_id = %report.report_id,
                    channel = %channel,
                    error = %e,
                    "Delivery task crashed, channel left unresolved"
                );
            }
        }

        Ok(self
            .engine
            .report_status(&report.report_id)
            .await
            .unwrap_or(ReportDeliveryStatus::Pending))
    }

    /// Operator-driven retry of a failed channel. Bypasses the backoff
    /// timer but consumes a slot from the same attempt budget.
    pub async fn manual_retry(
        &self,
        report_id: &ReportId,
        channel: Channel,
        actor: &str,
    ) -> Result<AttemptDisposition, DispatchError> {
        self.engine.check_manual_retry(report_id, channel).await?;
        self.scheduler.cancel(report_id, channel);
        info!(
            report_id = %report_id,
            channel = %channel,
            actor = %actor,
            "Manual delivery retry"
        );
        let disposition = self.engine.run_attempt(report_id, channel, actor).await?;
        if let AttemptDisposition::FailedRetryable { failed_attempt } = disposition {
            self.scheduler
                .schedule(report_id.clone(), channel, failed_attempt);
        }
        Ok(disposition)
    }

    /// Called by the lifecycle when a sample is recalled. Drops a still
    /// parked report, cancels pending retries; an attempt already in
    /// flight is left to record its outcome.
    pub async fn cancel_report(
        &self,
        report_id: &ReportId,
        actor: &str,
        reason: &str,
    ) -> Result<Vec<Channel>, DispatchError> {
        if self.ready.lock().await.remove(report_id).is_some() {
            info!(report_id = %report_id, "Parked report withdrawn by recall");
        }
        let timers = self.scheduler.cancel_for_report(report_id);
        let cancelled = self.engine.cancel_report(report_id).await;
        self.audit
            .record(AuditEvent::record(
                report_id.as_str(),
                actor,
                "DELIVERY_CANCELLED",
                Some(format!("{reason}; {timers} pending retries cancelled")),
            ))
            .await?;
        info!(
            report_id = %report_id,
            cancelled_channels = ?cancelled,
            cancelled_timers = timers,
            "Delivery cancelled by recall"
        );
        Ok(cancelled)
    }

    /// Rebuild delivery state from the ledgers after a restart and re-arm
    /// retries that were pending at crash time.
    pub async fn recover(&self) -> Result<RecoveryReport, DispatchError> {
        let intents: Vec<DispatchIntent> = self.storage.read_all(DISPATCHES_LEDGER).await?;
        let attempts: Vec<DeliveryAttempt> = self.storage.read_all(ATTEMPTS_LEDGER).await?;
        let reports: Vec<Report> = self.storage.read_all(REPORTS_LEDGER).await?;

        let mut intent_by_report: HashMap<ReportId, DispatchIntent> = HashMap::new();
        for intent in intents {
            intent_by_report.insert(intent.report_id.clone(), intent);
        }
        let report_by_id: HashMap<ReportId, Report> = reports
            .into_iter()
            .map(|r| (r.report_id.clone(), r))
            .collect();
        let mut attempts_by_report: HashMap<ReportId, Vec<DeliveryAttempt>> = HashMap::new();
        for row in attempts {
            attempts_by_report
                .entry(row.report_id.clone())
                .or_default()
                .push(row);
        }

        let mut recovery = RecoveryReport::default();
        for (report_id, intent) in intent_by_report {
            let Some(report) = report_by_id.get(&report_id) else {
                warn!(report_id = %report_id, "Dispatch intent with no stored report");
                continue;
            };
            let stage = self.registry.stage_of(&intent.sample_id).await;
            let dispatched = matches!(
                stage,
                Some(SampleStage::Dispatched | SampleStage::ManualIntervention)
            );
            if !dispatched {
                continue;
            }
            let recalled = matches!(stage, Some(SampleStage::ManualIntervention));

            let rows = attempts_by_report.remove(&report_id).unwrap_or_default();
            let (actions, terminal) = self
                .engine
                .restore_report(
                    report.clone(),
                    intent.channels.clone(),
                    rows,
                    recalled,
                    intent.dispatched_at,
                )
                .await;
            recovery.reports_restored += 1;

            for action in actions {
                match action {
                    ResumeAction::Resume {
                        channel,
                        after_attempt,
                    } => {
                        self.scheduler
                            .schedule(report_id.clone(), channel, after_attempt);
                        recovery.retries_resumed += 1;
                    }
                    ResumeAction::Interrupted { channel } => {
                        recovery.interrupted_attempts += 1;
                        match self.engine.resolve_interrupted(&report_id, channel).await? {
                            AttemptDisposition::FailedRetryable { failed_attempt } => {
                                self.scheduler
                                    .schedule(report_id.clone(), channel, failed_attempt);
                                recovery.retries_resumed += 1;
                            }
                            AttemptDisposition::FailedExhausted => {
                                recovery.exhausted_channels += 1
                            }
                            _ => {}
                        }
                    }
                    ResumeAction::Exhausted { .. } => recovery.exhausted_channels += 1,
                    ResumeAction::Cancelled { .. } => recovery.cancelled_channels += 1,
                }
            }

            // Escalation that converged right before the crash may never
            // have reached the lifecycle.
            if let Some(aggregate) = terminal {
                if aggregate != ReportDeliveryStatus::Delivered
                    && matches!(stage, Some(SampleStage::Dispatched))
                {
                    self.registry
                        .on_report_converged(
                            &intent.sample_id,
                            &report_id,
                            aggregate,
                            RETRY_SCHEDULER_ACTOR,
                        )
                        .await?;
                }
            }
        }

        let checkpoint = RetryCheckpoint::new(&recovery);
        self.storage.append(CHECKPOINTS_LEDGER, &checkpoint).await?;
        info!(
            checkpoint_id = %checkpoint.checkpoint_id,
            reports_restored = recovery.reports_restored,
            retries_resumed = recovery.retries_resumed,
            interrupted_attempts = recovery.interrupted_attempts,
            "Delivery recovery complete"
        );
        Ok(recovery)
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }

    pub async fn report_status(&self, report_id: &ReportId) -> Option<ReportDeliveryStatus> {
        self.engine.report_status(report_id).await
    }

    pub async fn attempts_for(&self, report_id: &ReportId) -> Option<Vec<DeliveryAttempt>> {
        self.engine.attempts_for(report_id).await
    }

    pub async fn overview(&self) -> Vec<DeliveryOverview> {
        self.engine.overview().await
    }

    pub async fn failed_deliveries(&self) -> Vec<FailedDelivery> {
        self.engine.failed_deliveries().await
    }

    pub async fn dispatch_stats(&self) -> DispatchStats {
        self.engine.dispatch_stats().await
    }

    pub async fn failed_queue_stats(&self) -> FailedQueueStats {
        let rows = self.engine.failed_deliveries().await;
        if rows.is_empty() {
            return FailedQueueStats::default();
        }
        let total = rows.len();
        let exhausted = rows.iter().filter(|r| r.exhausted).count();
        let attempt_sum: u32 = rows.iter().map(|r| r.attempt_count).sum();
        let mut reasons: HashMap<String, usize> = HashMap::new();
        for row in &rows {
            *reasons.entry(row.failure_reason.clone()).or_default() += 1;
        }
        let mut by_reason: Vec<(String, usize)> = reasons.into_iter().collect();
        by_reason.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        FailedQueueStats {
            total,
            exhausted,
            average_attempts: f64::from(attempt_sum) / total as f64,
            by_reason,
        }
    }

    /// Stop timer activity. Part of shutdown.
    pub fn halt_retries(&self) -> usize {
        self.scheduler.cancel_all()
    }
}
