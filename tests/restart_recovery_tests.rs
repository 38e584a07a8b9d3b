//! Restart recovery tests: rebuilding samples, parked reports, delivery
//! state, and pending retries from the ledgers after a process dies.
//!
//! Testing library/framework: Rust built-in test framework; the crash
//! scenario drives two sequential Tokio runtimes over one ledger directory
//! and abandons the first mid-attempt.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};
use tempfile::TempDir;
use tokio::time::sleep;

use labflow::dispatch::mocks::ScriptedSink;
use labflow::dispatch::RetryCheckpoint;
use labflow::{
    Channel, DispatchError, LabSystem, LabflowConfig, LedgerStorage, QcStatus, Report,
    ReportDeliveryStatus, ReportId, ResultSubmission, SampleId, SampleStage, SampleSubmission,
    SinkRegistry, Urgency, MAX_DELIVERY_ATTEMPTS,
};

fn fast_retry_config(dir: &Path) -> LabflowConfig {
    let mut config = LabflowConfig::default();
    config.storage.data_dir = dir.to_string_lossy().into_owned();
    config.dispatch.auto_dispatch = false;
    config.dispatch.retry.base_delay_seconds = 0;
    config.dispatch.retry.max_delay_seconds = 0;
    config.dispatch.retry.jitter = false;
    config
}

/// Hour-long backoff: resumed timers stay armed for inspection.
fn slow_retry_config(dir: &Path) -> LabflowConfig {
    let mut config = fast_retry_config(dir);
    config.dispatch.retry.base_delay_seconds = 3600;
    config.dispatch.retry.max_delay_seconds = 7200;
    config
}

fn submission(sample_id: &str, channels: Vec<Channel>) -> SampleSubmission {
    SampleSubmission {
        sample_id: sample_id.to_string(),
        patient_id: "P-5003".to_string(),
        patient_name: "Ruwan Dias".to_string(),
        test_type: "Thyroid Panel".to_string(),
        mlt_name: "mlt.gunawardena".to_string(),
        qc_status: QcStatus::Pass,
        urgency: Urgency::Routine,
        results: vec![ResultSubmission {
            parameter: "TSH".to_string(),
            value: 2.1,
            unit: "mIU/L".to_string(),
            reference_low: 0.4,
            reference_high: 4.0,
        }],
        delivery_channels: channels,
    }
}

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
        .authorize(&id, "dr.jayasuriya", "Euthyroid.", "Dr. A. Jayasuriya")
        .await?;
    Ok(report)
}

#[tokio::test]
async fn test_restart_restores_samples_reports_and_parked_queue() -> Result<()> {
    let temp = TempDir::new()?;
    let delivered_sample = SampleId::from("LAB-2024-0200");
    let parked_sample = SampleId::from("LAB-2024-0201");

    // Phase 1: one report delivered, a second authorized but never sent.
    let (delivered_report, parked_report) = {
        let mut sinks = SinkRegistry::new();
        sinks.register(Arc::new(ScriptedSink::delivering(Channel::Email)));
        let system = LabSystem::with_sinks(fast_retry_config(temp.path()), sinks);

        let first = release_report(&system, "LAB-2024-0200", vec![Channel::Email]).await?;
        let status = system
            .coordinator()
            .dispatch_ready(&first.report_id, vec![Channel::Email], "dr.jayasuriya")
            .await?;
        assert_eq!(status, ReportDeliveryStatus::Delivered);

        let second = release_report(&system, "LAB-2024-0201", vec![Channel::Email]).await?;
        (first, second)
    };

    // Phase 2: a fresh process rebuilds everything from the ledgers.
    let system = LabSystem::new(fast_retry_config(temp.path()));
    let boot = system.boot().await?;
    assert_eq!(boot.restored.samples, 2);
    assert_eq!(boot.restored.reports, 2);
    assert_eq!(boot.restored.reparked, 1);
    assert_eq!(boot.recovery.reports_restored, 1);
    assert_eq!(boot.recovery.retries_resumed, 0);
    assert_eq!(boot.recovery.interrupted_attempts, 0);

    assert_eq!(
        system.registry().stage_of(&delivered_sample).await,
        Some(SampleStage::Dispatched)
    );
    assert_eq!(
        system.registry().stage_of(&parked_sample).await,
        Some(SampleStage::DispatchReady)
    );

    let parked = system.coordinator().ready_reports().await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].report_id, parked_report.report_id);

    assert_eq!(
        system
            .coordinator()
            .report_status(&delivered_report.report_id)
            .await,
        Some(ReportDeliveryStatus::Delivered)
    );
    let entry = system
        .index()
        .entry(&delivered_sample)
        .ok_or_else(|| anyhow::anyhow!("worklist entry missing after restart"))?;
    assert_eq!(entry.delivery_status, Some(ReportDeliveryStatus::Delivered));

    // The recovery pass left a durable checkpoint.
    let storage = LedgerStorage::new(temp.path());
    let checkpoints: Vec<RetryCheckpoint> = storage.read_all("scheduler_checkpoints").await?;
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].retries_resumed, 0);
    Ok(())
}

#[test]
fn test_interrupted_attempt_is_failed_and_rearmed_on_restart() -> Result<()> {
    let temp = TempDir::new()?;

    // Phase 1: die while a send is in flight. The attempt's claim row is
    // durable before the sink is called; the resolution never lands.
    let (report_id, sample_id): (ReportId, SampleId) = {
        let rt = tokio::runtime::Runtime::new()?;
        let ids = rt.block_on(async {
            let print = Arc::new(
                ScriptedSink::delivering(Channel::Print).with_delay(Duration::from_secs(30)),
            );
            let mut sinks = SinkRegistry::new();
            sinks.register(print.clone());
            let system = LabSystem::with_sinks(slow_retry_config(temp.path()), sinks);

            let report = release_report(&system, "LAB-2024-0202", vec![Channel::Print]).await?;
            let coordinator = Arc::clone(system.coordinator());
            let rid = report.report_id.clone();
            tokio::spawn(async move {
                let _ = coordinator
                    .dispatch_ready(&rid, vec![Channel::Print], "dr.jayasuriya")
                    .await;
            });

            let mut in_flight = false;
            for _ in 0..500 {
                if print.send_count() == 1 {
                    in_flight = true;
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
            ensure!(in_flight, "attempt never reached the sink");
            Ok::<_, anyhow::Error>((report.report_id, SampleId::from("LAB-2024-0202")))
        })?;
        rt.shutdown_background();
        ids
    };

    // Phase 2: restart resolves the orphaned claim and re-arms the retry.
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let system = LabSystem::new(slow_retry_config(temp.path()));
        let boot = system.boot().await?;
        assert_eq!(boot.restored.samples, 1);
        assert_eq!(boot.restored.reports, 1);
        assert_eq!(boot.restored.reparked, 0);
        assert_eq!(boot.recovery.reports_restored, 1);
        assert_eq!(boot.recovery.interrupted_attempts, 1);
        assert_eq!(boot.recovery.retries_resumed, 1);
        assert_eq!(boot.recovery.exhausted_channels, 0);
        assert_eq!(boot.recovery.cancelled_channels, 0);

        let failed = system.coordinator().failed_deliveries().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failure_reason, "interrupted by restart");
        assert_eq!(failed[0].attempt_count, 1);
        assert!(!failed[0].exhausted);

        assert!(system
            .coordinator()
            .scheduler()
            .is_scheduled(&report_id, Channel::Print));
        assert_eq!(
            system.coordinator().report_status(&report_id).await,
            Some(ReportDeliveryStatus::Pending)
        );
        assert_eq!(
            system.registry().stage_of(&sample_id).await,
            Some(SampleStage::Dispatched)
        );

        let storage = LedgerStorage::new(temp.path());
        let checkpoints: Vec<RetryCheckpoint> = storage.read_all("scheduler_checkpoints").await?;
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].interrupted_attempts, 1);
        Ok::<_, anyhow::Error>(())
    })
}

#[tokio::test]
async fn test_exhausted_failure_survives_restart_without_rearming() -> Result<()> {
    let temp = TempDir::new()?;
    let sample_id = SampleId::from("LAB-2024-0203");

    // Phase 1: a dead channel burns the whole budget and escalates.
    let report_id = {
        let mut sinks = SinkRegistry::new();
        sinks.register(Arc::new(ScriptedSink::failing(
            Channel::Print,
            "printer offline",
        )));
        let system = LabSystem::with_sinks(fast_retry_config(temp.path()), sinks);
        let report = release_report(&system, "LAB-2024-0203", vec![Channel::Print]).await?;
        system
            .coordinator()
            .dispatch_ready(&report.report_id, vec![Channel::Print], "dr.jayasuriya")
            .await?;

        let mut escalated = false;
        for _ in 0..200 {
            if system.registry().stage_of(&sample_id).await
                == Some(SampleStage::ManualIntervention)
            {
                escalated = true;
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        assert!(escalated, "exhaustion should escalate before the restart");
        report.report_id
    };

    // Phase 2: the failed queue is rebuilt; nothing is re-armed for a
    // sample already under manual intervention.
    let system = LabSystem::new(slow_retry_config(temp.path()));
    let boot = system.boot().await?;
    assert_eq!(boot.recovery.reports_restored, 1);
    assert_eq!(boot.recovery.retries_resumed, 0);
    assert_eq!(boot.recovery.cancelled_channels, 1);
    assert_eq!(system.coordinator().scheduler().pending_count(), 0);

    let failed = system.coordinator().failed_deliveries().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempt_count, MAX_DELIVERY_ATTEMPTS);
    assert!(failed[0].exhausted);
    assert!(failed[0].recalled);

    let err = system
        .coordinator()
        .manual_retry(&report_id, Channel::Print, "dr.jayasuriya")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ReportRecalled { .. }));

    // The intervention closes out by hand.
    let sample = system
        .machine()
        .resolve_manual(&sample_id, "dr.jayasuriya", "patient notified by phone")
        .await?;
    assert!(sample.resolution.is_some());
    assert_eq!(sample.stage, SampleStage::ManualIntervention);
    Ok(())
}
