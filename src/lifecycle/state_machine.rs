//! Operator-facing lifecycle operations.
//!
//! The machine validates inputs, drives the registry's transition
//! primitive, and hands authorized reports to the dispatch coordinator.
//! Stage legality is always decided under the per-sample lease in the
//! registry, never from a stale read here.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::dispatch::{DispatchCoordinator, ReportDeliveryStatus, DISPATCH_ACTOR};
use crate::storage::LedgerStorage;

use super::registry::{LifecycleError, SampleRegistry, REPORTS_LEDGER};
use super::types::{
    BulkApprovalOutcome, FlagLevel, InstrumentBatch, QcStatus, Report, ReportId, ReturnInfo,
    Sample, SampleId, SampleStage, SkippedSample, Urgency,
};

/// What a cold start recovered from the ledgers before dispatch
/// recovery ran.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreSummary {
    pub samples: usize,
    pub reports: usize,
    pub reparked: usize,
}

pub struct LifecycleStateMachine {
    registry: Arc<SampleRegistry>,
    coordinator: Arc<DispatchCoordinator>,
    storage: Arc<LedgerStorage>,
    /// Authorized report per sample. Rebuilt from the report ledger on
    /// restore; a sample has at most one live report.
    reports: tokio::sync::RwLock<HashMap<SampleId, Report>>,
    auto_dispatch: bool,
}

impl LifecycleStateMachine {
    pub fn new(
        registry: Arc<SampleRegistry>,
        coordinator: Arc<DispatchCoordinator>,
        storage: Arc<LedgerStorage>,
        auto_dispatch: bool,
    ) -> Self {
        Self {
            registry,
            coordinator,
            storage,
            reports: tokio::sync::RwLock::new(HashMap::new()),
            auto_dispatch,
        }
    }

    pub fn registry(&self) -> &Arc<SampleRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<DispatchCoordinator> {
        &self.coordinator
    }

    pub async fn sample(&self, sample_id: &SampleId) -> Option<Sample> {
        self.registry.get(sample_id).await
    }

    pub async fn report_for(&self, sample_id: &SampleId) -> Option<Report> {
        self.reports.read().await.get(sample_id).cloned()
    }

    /// MLT signs off the technical verification. The quality control
    /// verdict travels with the submission; anything other than a pass
    /// keeps the sample in VERIFICATION.
    pub async fn submit_verification(
        &self,
        sample_id: &SampleId,
        actor: &str,
        qc_status: QcStatus,
    ) -> Result<Sample, LifecycleError> {
        // The note is display-only; the returned marker itself is
        // re-read and cleared under the lease.
        let previously_returned = self
            .registry
            .get(sample_id)
            .await
            .and_then(|s| s.returned.map(|r| r.reason));
        let note = match &previously_returned {
            Some(reason) => format!("re-verified after return: {reason}"),
            None => format!("quality control {qc_status}"),
        };

        let id = sample_id.clone();
        self.registry
            .transition(
                sample_id,
                actor,
                "submit verification",
                &[SampleStage::Verification],
                SampleStage::Authorization,
                Some(note),
                move |_| match qc_status {
                    QcStatus::Pass => Ok(()),
                    other => Err(LifecycleError::InvalidTransition {
                        sample_id: id,
                        from: SampleStage::Verification,
                        action: format!("pass verification with quality control {other}"),
                    }),
                },
                |sample| {
                    sample.qc_status = qc_status;
                    sample.returned = None;
                },
            )
            .await
    }

    /// Pathologist bounces a sample back to the MLT queue with a
    /// mandatory reason. `urgent` bumps the sample to STAT so the rework
    /// sorts to the top of the verification worklist.
    pub async fn return_for_verification(
        &self,
        sample_id: &SampleId,
        actor: &str,
        reason: &str,
        urgent: bool,
    ) -> Result<Sample, LifecycleError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LifecycleError::MissingReason);
        }

        let info = ReturnInfo {
            reason: reason.to_string(),
            returned_by: actor.to_string(),
            returned_at: Utc::now(),
        };
        self.registry
            .transition(
                sample_id,
                actor,
                "return for verification",
                &[SampleStage::Authorization],
                SampleStage::Verification,
                Some(format!("returned: {reason}")),
                |_| Ok(()),
                move |sample| {
                    sample.returned = Some(info);
                    if urgent {
                        sample.urgency = Urgency::Stat;
                    }
                },
            )
            .await
    }

    /// Pathologist signs the interpretation and releases the report. The
    /// report row is persisted together with the stage commit, so a
    /// crash in between leaves an orphan row that restore filters out by
    /// stage, never a released sample without its report.
    pub async fn authorize(
        &self,
        sample_id: &SampleId,
        actor: &str,
        interpretation: &str,
        signature: &str,
    ) -> Result<Report, LifecycleError> {
        let interpretation = interpretation.trim();
        if interpretation.is_empty() {
            return Err(LifecycleError::MissingInterpretation);
        }
        let signature = signature.trim();
        if signature.is_empty() {
            return Err(LifecycleError::MissingSignature);
        }

        let sample =
            self.registry
                .get(sample_id)
                .await
                .ok_or_else(|| LifecycleError::SampleNotFound {
                    sample_id: sample_id.clone(),
                })?;

        let report = Report {
            report_id: ReportId(format!("R-{}", Uuid::new_v4())),
            sample_id: sample_id.clone(),
            patient_id: sample.patient_id.clone(),
            patient_name: sample.patient_name.clone(),
            test_type: sample.test_type.clone(),
            interpretation: interpretation.to_string(),
            signature: signature.to_string(),
            authorized_by: actor.to_string(),
            authorized_at: Utc::now(),
        };
        self.registry
            .commit_authorization(sample_id, actor, &report)
            .await?;

        self.reports
            .write()
            .await
            .insert(sample_id.clone(), report.clone());
        self.registry.note_delivery_status(
            sample_id,
            &report.report_id,
            ReportDeliveryStatus::Pending,
        );
        self.coordinator.enqueue_ready(report.clone()).await;
        info!(
            sample_id = %sample_id,
            report_id = %report.report_id,
            authorized_by = %actor,
            "Report authorized"
        );

        if self.auto_dispatch && !sample.delivery_channels.is_empty() {
            let coordinator = Arc::clone(&self.coordinator);
            let report_id = report.report_id.clone();
            let channels = sample.delivery_channels.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator
                    .dispatch_ready(&report_id, channels, DISPATCH_ACTOR)
                    .await
                {
                    warn!(
                        report_id = %report_id,
                        error = %e,
                        "Automatic dispatch did not start, report stays parked"
                    );
                }
            });
        }

        Ok(report)
    }

    /// Approve every clean member of an instrument run in one action.
    /// `selection` narrows the run to a chosen subset. Members that need
    /// individual attention are skipped with a reason, never failed.
    pub async fn bulk_approve(
        &self,
        batch: &InstrumentBatch,
        actor: &str,
        selection: Option<&[SampleId]>,
    ) -> Result<BulkApprovalOutcome, LifecycleError> {
        if batch.qc_status != QcStatus::Pass {
            return Err(LifecycleError::BatchQcNotPassed {
                batch_id: batch.batch_id.clone(),
            });
        }

        let candidates: Vec<SampleId> = match selection {
            Some(chosen) => chosen.to_vec(),
            None => batch.sample_ids.clone(),
        };

        let mut approved = Vec::new();
        let mut skipped = Vec::new();
        for sample_id in candidates {
            if !batch.sample_ids.contains(&sample_id) {
                skipped.push(SkippedSample {
                    sample_id,
                    reason: format!("not part of batch {}", batch.batch_id),
                });
                continue;
            }
            let Some(sample) = self.registry.get(&sample_id).await else {
                skipped.push(SkippedSample {
                    sample_id,
                    reason: "not registered".to_string(),
                });
                continue;
            };
            // Every field checked here only ever changes together with a
            // stage transition, so the stage check under the lease below
            // also revalidates these.
            if sample.stage != SampleStage::Verification {
                skipped.push(SkippedSample {
                    sample_id,
                    reason: format!("in stage {}", sample.stage),
                });
                continue;
            }
            if sample.qc_status != QcStatus::Pass {
                skipped.push(SkippedSample {
                    sample_id,
                    reason: format!("quality control {}", sample.qc_status),
                });
                continue;
            }
            if sample.flag != FlagLevel::Normal {
                skipped.push(SkippedSample {
                    sample_id,
                    reason: format!("flagged {}", sample.flag),
                });
                continue;
            }
            if let Some(returned) = &sample.returned {
                skipped.push(SkippedSample {
                    sample_id,
                    reason: format!("returned by {}: {}", returned.returned_by, returned.reason),
                });
                continue;
            }

            let result = self
                .registry
                .transition(
                    &sample_id,
                    actor,
                    "bulk approve",
                    &[SampleStage::Verification],
                    SampleStage::Authorization,
                    Some(format!("bulk approved from batch {}", batch.batch_id)),
                    |_| Ok(()),
                    |_| {},
                )
                .await;
            match result {
                Ok(_) => approved.push(sample_id),
                Err(LifecycleError::ConcurrentModification { .. }) => {
                    skipped.push(SkippedSample {
                        sample_id,
                        reason: "locked by a concurrent transition".to_string(),
                    });
                }
                Err(LifecycleError::InvalidTransition { from, .. }) => {
                    skipped.push(SkippedSample {
                        sample_id,
                        reason: format!("in stage {from}"),
                    });
                }
                // Storage loss aborts the run; approvals already made
                // stand, each with its own audit event.
                Err(e) => return Err(e),
            }
        }

        self.registry
            .audit()
            .record(AuditEvent::record(
                batch.batch_id.as_str(),
                actor,
                "BULK_APPROVAL",
                Some(format!(
                    "{} approved, {} skipped",
                    approved.len(),
                    skipped.len()
                )),
            ))
            .await?;
        info!(
            batch_id = %batch.batch_id,
            approved = approved.len(),
            skipped = skipped.len(),
            actor = %actor,
            "Bulk approval complete"
        );

        Ok(BulkApprovalOutcome {
            batch_id: batch.batch_id.clone(),
            approved,
            skipped,
        })
    }

    /// Pull a released report back before or during delivery. The sample
    /// escalates to MANUAL_INTERVENTION first, which blocks any new
    /// fan-out; pending retries are then cancelled. Sink calls already in
    /// flight record their outcome but cannot resurrect the sample.
    pub async fn recall(
        &self,
        sample_id: &SampleId,
        actor: &str,
        reason: &str,
    ) -> Result<Sample, LifecycleError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LifecycleError::MissingReason);
        }

        let sample = self
            .registry
            .transition(
                sample_id,
                actor,
                "recall",
                &[SampleStage::DispatchReady, SampleStage::Dispatched],
                SampleStage::ManualIntervention,
                Some(format!("recalled: {reason}")),
                |_| Ok(()),
                |_| {},
            )
            .await?;

        if let Some(report) = self.report_for(sample_id).await {
            // The recall is already committed and audited. Losing the
            // cancellation audit row is logged, not propagated.
            if let Err(e) = self
                .coordinator
                .cancel_report(&report.report_id, actor, &format!("recalled: {reason}"))
                .await
            {
                warn!(
                    sample_id = %sample_id,
                    report_id = %report.report_id,
                    error = %e,
                    "Recall cancelled delivery but the cancellation audit failed"
                );
            }
        }
        Ok(sample)
    }

    /// Operator closes out an escalated sample.
    pub async fn resolve_manual(
        &self,
        sample_id: &SampleId,
        actor: &str,
        note: &str,
    ) -> Result<Sample, LifecycleError> {
        self.registry.resolve_manual(sample_id, actor, note).await
    }

    /// Rebuild lifecycle state from the ledgers. Reports for samples
    /// still in DISPATCH_READY go back on the dispatch queue; reports
    /// for dispatched samples are re-linked and left for the dispatch
    /// coordinator's own recovery to replay.
    pub async fn restore(&self) -> Result<RestoreSummary, LifecycleError> {
        let samples = self.registry.load().await?;

        let rows: Vec<Report> = self.storage.read_all(REPORTS_LEDGER).await?;
        let mut latest: HashMap<SampleId, Report> = HashMap::new();
        for report in rows {
            latest.insert(report.sample_id.clone(), report);
        }

        let mut reports = self.reports.write().await;
        reports.clear();
        let mut reparked = 0;
        for (sample_id, report) in latest {
            match self.registry.stage_of(&sample_id).await {
                Some(SampleStage::DispatchReady) => {
                    self.registry.note_delivery_status(
                        &sample_id,
                        &report.report_id,
                        ReportDeliveryStatus::Pending,
                    );
                    self.coordinator.enqueue_ready(report.clone()).await;
                    reports.insert(sample_id, report);
                    reparked += 1;
                }
                Some(SampleStage::Dispatched | SampleStage::ManualIntervention) => {
                    reports.insert(sample_id, report);
                }
                // Orphan row from an authorize that never committed.
                _ => {}
            }
        }

        let summary = RestoreSummary {
            samples,
            reports: reports.len(),
            reparked,
        };
        info!(
            samples = summary.samples,
            reports = summary.reports,
            reparked = summary.reparked,
            "Lifecycle state restored"
        );
        Ok(summary)
    }
}
