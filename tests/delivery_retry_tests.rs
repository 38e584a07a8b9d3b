//! Delivery fan-out and retry tests: budget exhaustion, partial delivery,
//! manual retries, and recall cancelling pending work.
//!
//! Testing library/framework: Rust built-in test framework with Tokio async
//! runtime (#[tokio::test]); scripted sinks stand in for real channels.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tempfile::TempDir;
use tokio::time::sleep;

use async_trait::async_trait;
use labflow::dispatch::mocks::ScriptedSink;
use labflow::dispatch::{
    AttemptDisposition, DeliveryReceipt, DeliveryRequest, DeliverySink, SinkError,
};
use labflow::{
    AttemptOutcome, Channel, DispatchError, LabSystem, LabflowConfig, QcStatus, Report,
    ReportDeliveryStatus, ResultSubmission, SampleId, SampleStage, SampleSubmission, SinkRegistry,
    Urgency, MAX_DELIVERY_ATTEMPTS,
};

/// Zero-delay retries so a failing channel burns its whole budget within
/// the test without a paused clock.
fn fast_retry_config(dir: &Path) -> LabflowConfig {
    let mut config = LabflowConfig::default();
    config.storage.data_dir = dir.to_string_lossy().into_owned();
    config.dispatch.auto_dispatch = false;
    config.dispatch.retry.base_delay_seconds = 0;
    config.dispatch.retry.max_delay_seconds = 0;
    config.dispatch.retry.jitter = false;
    config
}

/// Hour-long backoff keeps re-armed timers pending for the whole test, so
/// scheduler state can be inspected before anything fires.
fn slow_retry_config(dir: &Path) -> LabflowConfig {
    let mut config = fast_retry_config(dir);
    config.dispatch.retry.base_delay_seconds = 3600;
    config.dispatch.retry.max_delay_seconds = 7200;
    config
}

fn submission(sample_id: &str, channels: Vec<Channel>) -> SampleSubmission {
    SampleSubmission {
        sample_id: sample_id.to_string(),
        patient_id: "P-4002".to_string(),
        patient_name: "Sunethra Bandara".to_string(),
        test_type: "Lipid Panel".to_string(),
        mlt_name: "mlt.gunawardena".to_string(),
        qc_status: QcStatus::Pass,
        urgency: Urgency::Routine,
        results: vec![ResultSubmission {
            parameter: "LDL".to_string(),
            value: 2.9,
            unit: "mmol/L".to_string(),
            reference_low: 1.0,
            reference_high: 3.4,
        }],
        delivery_channels: channels,
    }
}

/// Ingest, verify, and authorize one sample, leaving its report parked.
async fn release_report(
    system: &LabSystem,
    sample_id: &str,
    channels: Vec<Channel>,
) -> Result<Report> {
    let id = SampleId::from(sample_id);
    system
        .intake()
        .ingest_sample(submission(sample_id, channels), "analyzer-feed")
        .await?;
    system
        .machine()
        .submit_verification(&id, "mlt.gunawardena", QcStatus::Pass)
        .await?;
    let report = system
        .machine()
        .authorize(&id, "dr.jayasuriya", "Within limits.", "Dr. A. Jayasuriya")
        .await?;
    Ok(report)
}

/// Wait until the retry cascade escalates the sample, or give up.
async fn wait_for_stage(system: &LabSystem, sample_id: &SampleId, stage: SampleStage) -> bool {
    for _ in 0..200 {
        if system.registry().stage_of(sample_id).await == Some(stage) {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_failing_channel_exhausts_budget_and_escalates() -> Result<()> {
    let temp = TempDir::new()?;
    let print = Arc::new(ScriptedSink::failing(Channel::Print, "printer offline"));
    let mut sinks = SinkRegistry::new();
    sinks.register(print.clone());
    let system = LabSystem::with_sinks(fast_retry_config(temp.path()), sinks);

    let sample_id = SampleId::from("LAB-2024-0100");
    let report = release_report(&system, "LAB-2024-0100", vec![Channel::Print]).await?;

    // Phase 1: the first round fails and the zero-delay chain takes over.
    let status = system
        .coordinator()
        .dispatch_ready(&report.report_id, vec![Channel::Print], "dr.jayasuriya")
        .await?;
    assert_eq!(status, ReportDeliveryStatus::Pending);

    // Phase 2: exhaustion escalates the sample for manual intervention.
    assert!(
        wait_for_stage(&system, &sample_id, SampleStage::ManualIntervention).await,
        "sample should escalate once the retry budget is spent"
    );
    assert_eq!(print.send_count(), MAX_DELIVERY_ATTEMPTS as usize);
    assert_eq!(print.seen_attempts(), vec![1, 2, 3, 4, 5]);
    assert_eq!(
        system.coordinator().report_status(&report.report_id).await,
        Some(ReportDeliveryStatus::Failed)
    );

    // Phase 3: the failed queue carries the exhausted row.
    let failed = system.coordinator().failed_deliveries().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].channel, Channel::Print);
    assert_eq!(failed[0].failure_reason, "printer offline");
    assert_eq!(failed[0].attempt_count, MAX_DELIVERY_ATTEMPTS);
    assert!(failed[0].exhausted);
    assert!(!failed[0].recalled);

    let err = system
        .coordinator()
        .manual_retry(&report.report_id, Channel::Print, "dr.jayasuriya")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::RetryExhausted { .. }));

    let trail = system
        .audit()
        .load_for_subject(report.report_id.as_str())
        .await?;
    assert!(trail.iter().any(|e| e.to_state == "RETRY_BUDGET_EXHAUSTED"));

    // The delivery record shows the failure with no delivered timestamp.
    let overview = system.coordinator().overview().await;
    let log = labflow::export_delivery_log(
        &overview,
        Utc::now() - chrono::Duration::minutes(5),
        Utc::now(),
    );
    let row = log
        .lines()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("delivery record row missing"))?;
    assert!(row.contains("PRINT,FAILED"));
    assert!(row.ends_with(','));
    Ok(())
}

#[tokio::test]
async fn test_flaky_channel_recovers_within_budget() -> Result<()> {
    let temp = TempDir::new()?;
    let email = Arc::new(ScriptedSink::flaky(
        Channel::Email,
        2,
        "smtp handshake failed",
    ));
    let mut sinks = SinkRegistry::new();
    sinks.register(email.clone());
    let system = LabSystem::with_sinks(fast_retry_config(temp.path()), sinks);

    let sample_id = SampleId::from("LAB-2024-0101");
    let report = release_report(&system, "LAB-2024-0101", vec![Channel::Email]).await?;
    system
        .coordinator()
        .dispatch_ready(&report.report_id, vec![Channel::Email], "dr.jayasuriya")
        .await?;

    // Third attempt lands; the sample stays a normal dispatch.
    let mut delivered = false;
    for _ in 0..200 {
        if system.coordinator().report_status(&report.report_id).await
            == Some(ReportDeliveryStatus::Delivered)
        {
            delivered = true;
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }
    assert!(delivered, "flaky channel should deliver on its third attempt");
    assert_eq!(email.seen_attempts(), vec![1, 2, 3]);
    assert_eq!(
        system.registry().stage_of(&sample_id).await,
        Some(SampleStage::Dispatched)
    );
    assert!(system.coordinator().failed_deliveries().await.is_empty());

    let stats = system.coordinator().dispatch_stats().await;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.delivered, 1);
    Ok(())
}

#[tokio::test]
async fn test_partial_delivery_escalates_but_keeps_the_delivered_half() -> Result<()> {
    let temp = TempDir::new()?;
    let email = Arc::new(ScriptedSink::delivering(Channel::Email));
    let print = Arc::new(ScriptedSink::failing(Channel::Print, "printer offline"));
    let mut sinks = SinkRegistry::new();
    sinks.register(email.clone());
    sinks.register(print.clone());
    let system = LabSystem::with_sinks(fast_retry_config(temp.path()), sinks);

    let sample_id = SampleId::from("LAB-2024-0102");
    let report = release_report(
        &system,
        "LAB-2024-0102",
        vec![Channel::Email, Channel::Print],
    )
    .await?;
    system
        .coordinator()
        .dispatch_ready(
            &report.report_id,
            vec![Channel::Email, Channel::Print],
            "dr.jayasuriya",
        )
        .await?;

    assert!(
        wait_for_stage(&system, &sample_id, SampleStage::ManualIntervention).await,
        "partial outcome should still escalate the sample"
    );
    assert_eq!(
        system.coordinator().report_status(&report.report_id).await,
        Some(ReportDeliveryStatus::Partial)
    );
    assert_eq!(email.send_count(), 1);
    assert_eq!(print.send_count(), MAX_DELIVERY_ATTEMPTS as usize);

    // Only the failed channel shows up in the queue.
    let failed = system.coordinator().failed_deliveries().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].channel, Channel::Print);

    let attempts = system
        .coordinator()
        .attempts_for(&report.report_id)
        .await
        .unwrap_or_default();
    assert_eq!(attempts.len(), 1 + MAX_DELIVERY_ATTEMPTS as usize);

    let stats = system.coordinator().dispatch_stats().await;
    assert_eq!(stats.partial, 1);
    Ok(())
}

#[tokio::test]
async fn test_manual_retry_supersedes_the_armed_timer() -> Result<()> {
    let temp = TempDir::new()?;
    let email = Arc::new(ScriptedSink::flaky(Channel::Email, 1, "mailbox full"));
    let mut sinks = SinkRegistry::new();
    sinks.register(email.clone());
    let system = LabSystem::with_sinks(slow_retry_config(temp.path()), sinks);

    let report = release_report(&system, "LAB-2024-0103", vec![Channel::Email]).await?;
    let status = system
        .coordinator()
        .dispatch_ready(&report.report_id, vec![Channel::Email], "dr.jayasuriya")
        .await?;
    assert_eq!(status, ReportDeliveryStatus::Pending);
    assert!(system
        .coordinator()
        .scheduler()
        .is_scheduled(&report.report_id, Channel::Email));

    // The operator jumps the hour-long backoff.
    let disposition = system
        .coordinator()
        .manual_retry(&report.report_id, Channel::Email, "dr.jayasuriya")
        .await?;
    assert!(matches!(disposition, AttemptDisposition::Delivered));
    assert!(!system
        .coordinator()
        .scheduler()
        .is_scheduled(&report.report_id, Channel::Email));
    assert_eq!(email.seen_attempts(), vec![1, 2]);
    assert_eq!(
        system.coordinator().report_status(&report.report_id).await,
        Some(ReportDeliveryStatus::Delivered)
    );

    // A delivered channel has nothing left to retry.
    let err = system
        .coordinator()
        .manual_retry(&report.report_id, Channel::Email, "dr.jayasuriya")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NothingToRetry { .. }));
    Ok(())
}

#[tokio::test]
async fn test_recall_cancels_pending_retries() -> Result<()> {
    let temp = TempDir::new()?;
    let email = Arc::new(ScriptedSink::failing(Channel::Email, "mailbox full"));
    let mut sinks = SinkRegistry::new();
    sinks.register(email.clone());
    let system = LabSystem::with_sinks(slow_retry_config(temp.path()), sinks);

    let sample_id = SampleId::from("LAB-2024-0104");
    let report = release_report(&system, "LAB-2024-0104", vec![Channel::Email]).await?;
    system
        .coordinator()
        .dispatch_ready(&report.report_id, vec![Channel::Email], "dr.jayasuriya")
        .await?;
    assert_eq!(system.coordinator().scheduler().pending_count(), 1);

    // Phase 1: recall escalates the sample and drops the timer.
    let sample = system
        .machine()
        .recall(&sample_id, "dr.jayasuriya", "specimen mismatch")
        .await?;
    assert_eq!(sample.stage, SampleStage::ManualIntervention);
    assert_eq!(system.coordinator().scheduler().pending_count(), 0);
    assert_eq!(
        system.coordinator().report_status(&report.report_id).await,
        Some(ReportDeliveryStatus::Failed)
    );

    // Phase 2: the failed row is informational only now.
    let failed = system.coordinator().failed_deliveries().await;
    assert_eq!(failed.len(), 1);
    assert!(failed[0].recalled);

    let err = system
        .coordinator()
        .manual_retry(&report.report_id, Channel::Email, "dr.jayasuriya")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ReportRecalled { .. }));
    assert_eq!(email.send_count(), 1);

    let trail = system
        .audit()
        .load_for_subject(report.report_id.as_str())
        .await?;
    let cancelled = trail
        .iter()
        .find(|e| e.to_state == "DELIVERY_CANCELLED")
        .ok_or_else(|| anyhow::anyhow!("cancellation audit row missing"))?;
    assert!(cancelled
        .note
        .as_deref()
        .unwrap_or_default()
        .contains("1 pending retries cancelled"));
    Ok(())
}

#[tokio::test]
async fn test_dispatch_validation_keeps_the_report_parked() -> Result<()> {
    let temp = TempDir::new()?;
    let email = Arc::new(ScriptedSink::delivering(Channel::Email));
    let mut sinks = SinkRegistry::new();
    sinks.register(email.clone());
    let system = LabSystem::with_sinks(fast_retry_config(temp.path()), sinks);

    let report = release_report(&system, "LAB-2024-0105", vec![Channel::Email]).await?;

    // No channels: refused, still parked.
    let err = system
        .coordinator()
        .dispatch_ready(&report.report_id, vec![], "dr.jayasuriya")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::EmptyChannelSet { .. }));
    assert_eq!(system.coordinator().ready_reports().await.len(), 1);

    // Unregistered channel: refused, still parked.
    let err = system
        .coordinator()
        .dispatch_ready(&report.report_id, vec![Channel::Portal], "dr.jayasuriya")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ChannelUnavailable { .. }));
    assert_eq!(system.coordinator().ready_reports().await.len(), 1);

    // Duplicate channels collapse to a single attempt.
    let status = system
        .coordinator()
        .dispatch_ready(
            &report.report_id,
            vec![Channel::Email, Channel::Email],
            "dr.jayasuriya",
        )
        .await?;
    assert_eq!(status, ReportDeliveryStatus::Delivered);
    assert_eq!(email.send_count(), 1);

    // The queue entry is consumed.
    let err = system
        .coordinator()
        .dispatch_ready(&report.report_id, vec![Channel::Email], "dr.jayasuriya")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotReady { .. }));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_dispatches_stay_isolated() -> Result<()> {
    let temp = TempDir::new()?;
    let email = Arc::new(ScriptedSink::delivering(Channel::Email));
    let mut sinks = SinkRegistry::new();
    sinks.register(email.clone());
    let system = LabSystem::with_sinks(fast_retry_config(temp.path()), sinks);

    let mut report_ids = Vec::new();
    for n in 0..3 {
        let sample_id = format!("LAB-2024-041{n}");
        let report = release_report(&system, &sample_id, vec![Channel::Email]).await?;
        report_ids.push(report.report_id);
    }

    // All three operators hit dispatch at once.
    let handles: Vec<_> = report_ids
        .iter()
        .map(|report_id| {
            let coordinator = system.coordinator().clone();
            let report_id = report_id.clone();
            tokio::spawn(async move {
                coordinator
                    .dispatch_ready(&report_id, vec![Channel::Email], "dr.jayasuriya")
                    .await
            })
        })
        .collect();
    for joined in futures::future::join_all(handles).await {
        assert_eq!(joined??, ReportDeliveryStatus::Delivered);
    }

    assert_eq!(email.send_count(), 3);
    let stats = system.coordinator().dispatch_stats().await;
    assert_eq!(stats.total, 3);
    assert_eq!(stats.delivered, 3);
    assert!(system.coordinator().ready_reports().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unpersisted_outcome_is_not_published() -> Result<()> {
    let temp = TempDir::new()?;
    let ledger_dir = temp.path().join("ledgers");
    let email = Arc::new(
        ScriptedSink::failing(Channel::Email, "mailbox full")
            .with_delay(Duration::from_millis(2000)),
    );
    let mut sinks = SinkRegistry::new();
    sinks.register(email.clone());
    let system = LabSystem::with_sinks(fast_retry_config(&ledger_dir), sinks);

    let report = release_report(&system, "LAB-2024-0430", vec![Channel::Email]).await?;

    let coordinator = system.coordinator().clone();
    let id = report.report_id.clone();
    let dispatch = tokio::spawn(async move {
        coordinator
            .dispatch_ready(&id, vec![Channel::Email], "dr.jayasuriya")
            .await
    });

    // Wait for the pending marker to land and the sink to stall, then take
    // the ledger directory away before the outcome can be written.
    for _ in 0..200 {
        if email.send_count() == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(email.send_count(), 1);
    std::fs::remove_dir_all(&ledger_dir)?;
    std::fs::write(&ledger_dir, b"")?;

    let status = dispatch.await??;
    assert_eq!(status, ReportDeliveryStatus::Pending);

    // An outcome that never reached the ledger must not be visible: the
    // attempt stays open and nothing reaches the failed queue or the
    // retry scheduler.
    let attempts = system
        .coordinator()
        .attempts_for(&report.report_id)
        .await
        .unwrap_or_default();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Pending);
    assert!(system.coordinator().failed_deliveries().await.is_empty());
    assert!(!system
        .coordinator()
        .scheduler()
        .is_scheduled(&report.report_id, Channel::Email));
    Ok(())
}

/// Sink that dies mid-send, standing in for a channel adapter bug.
struct CrashingSink {
    channel: Channel,
}

#[async_trait]
impl DeliverySink for CrashingSink {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, _request: &DeliveryRequest) -> Result<DeliveryReceipt, SinkError> {
        panic!("sink crashed mid-send");
    }
}

#[tokio::test]
async fn test_sink_panic_does_not_take_down_the_dispatch() -> Result<()> {
    let temp = TempDir::new()?;
    let email = Arc::new(ScriptedSink::delivering(Channel::Email));
    let mut sinks = SinkRegistry::new();
    sinks.register(email.clone());
    sinks.register(Arc::new(CrashingSink {
        channel: Channel::Sms,
    }));
    let system = LabSystem::with_sinks(fast_retry_config(temp.path()), sinks);

    let report = release_report(
        &system,
        "LAB-2024-0440",
        vec![Channel::Email, Channel::Sms],
    )
    .await?;

    // The crashing channel must not poison the fan-out: the healthy
    // channel still delivers and the dead channel's attempt is left open.
    let status = system
        .coordinator()
        .dispatch_ready(
            &report.report_id,
            vec![Channel::Email, Channel::Sms],
            "dr.jayasuriya",
        )
        .await?;
    assert_eq!(status, ReportDeliveryStatus::Pending);
    assert_eq!(email.send_count(), 1);

    let attempts = system
        .coordinator()
        .attempts_for(&report.report_id)
        .await
        .unwrap_or_default();
    let sms: Vec<_> = attempts
        .iter()
        .filter(|a| a.channel == Channel::Sms)
        .collect();
    assert_eq!(sms.len(), 1);
    assert_eq!(sms[0].outcome, AttemptOutcome::Pending);
    assert!(!system
        .coordinator()
        .scheduler()
        .is_scheduled(&report.report_id, Channel::Sms));
    Ok(())
}
