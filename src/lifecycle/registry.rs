//! Authoritative sample store and the single transition primitive.
//!
//! Every stage change goes through `transition`, which takes an exclusive
//! per-sample lease, re-validates the expected stage under that lease,
//! appends the audit event and the sample snapshot, and only then makes
//! the new state visible. A second writer contending for the lease fails
//! immediately instead of queueing, so double-submits surface as errors
//! rather than silent double transitions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::{AuditError, AuditEvent, AuditStore};
use crate::dispatch::ReportDeliveryStatus;
use crate::storage::{LedgerStorage, StorageError};
use crate::worklist::WorklistIndex;

use super::types::{Report, ReportId, ResolutionInfo, Sample, SampleId, SampleStage};

pub const SAMPLES_LEDGER: &str = "samples";
pub const REPORTS_LEDGER: &str = "reports";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("sample {sample_id} is not registered")]
    SampleNotFound { sample_id: SampleId },

    #[error("sample {sample_id} is already registered")]
    DuplicateSample { sample_id: SampleId },

    #[error("sample {sample_id} cannot {action} from stage {from}")]
    InvalidTransition {
        sample_id: SampleId,
        from: SampleStage,
        action: String,
    },

    #[error("sample {sample_id} is locked by a concurrent transition")]
    ConcurrentModification { sample_id: SampleId },

    #[error("batch {batch_id} has not passed quality control, bulk approval rejected")]
    BatchQcNotPassed { batch_id: String },

    #[error("this operation requires a non-empty reason")]
    MissingReason,

    #[error("authorization requires a clinical interpretation")]
    MissingInterpretation,

    #[error("authorization requires the pathologist's signature")]
    MissingSignature,

    #[error("audit storage unavailable, operation aborted: {0}")]
    StorageUnavailable(#[source] StorageError),
}

impl From<StorageError> for LifecycleError {
    fn from(e: StorageError) -> Self {
        LifecycleError::StorageUnavailable(e)
    }
}

impl From<AuditError> for LifecycleError {
    fn from(e: AuditError) -> Self {
        match e {
            AuditError::StorageUnavailable(inner) => LifecycleError::StorageUnavailable(inner),
        }
    }
}

type SampleCell = Arc<tokio::sync::Mutex<Sample>>;

pub struct SampleRegistry {
    entries: tokio::sync::RwLock<HashMap<SampleId, SampleCell>>,
    audit: Arc<dyn AuditStore>,
    index: Arc<WorklistIndex>,
    storage: Arc<LedgerStorage>,
}

impl SampleRegistry {
    pub fn new(
        audit: Arc<dyn AuditStore>,
        index: Arc<WorklistIndex>,
        storage: Arc<LedgerStorage>,
    ) -> Self {
        Self {
            entries: tokio::sync::RwLock::new(HashMap::new()),
            audit,
            index,
            storage,
        }
    }

    /// Reload the sample population from the snapshot ledger. The last
    /// snapshot per sample wins. Returns how many samples were restored.
    pub async fn load(&self) -> Result<usize, LifecycleError> {
        let rows: Vec<Sample> = self.storage.read_all(SAMPLES_LEDGER).await?;
        let mut latest: HashMap<SampleId, Sample> = HashMap::new();
        for sample in rows {
            latest.insert(sample.sample_id.clone(), sample);
        }
        let samples: Vec<Sample> = latest.values().cloned().collect();
        self.index.rebuild(&samples);

        let mut entries = self.entries.write().await;
        entries.clear();
        let count = latest.len();
        for (id, sample) in latest {
            entries.insert(id, Arc::new(tokio::sync::Mutex::new(sample)));
        }
        Ok(count)
    }

    /// Admit a new sample in VERIFICATION. The registration is audited
    /// and snapshotted before it becomes visible.
    pub async fn register(&self, sample: Sample, actor: &str) -> Result<Sample, LifecycleError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&sample.sample_id) {
            return Err(LifecycleError::DuplicateSample {
                sample_id: sample.sample_id.clone(),
            });
        }
        self.audit
            .record(AuditEvent::record(
                sample.sample_id.as_str(),
                actor,
                sample.stage.as_str(),
                Some(format!("{} received", sample.test_type)),
            ))
            .await?;
        self.storage.append(SAMPLES_LEDGER, &sample).await?;
        entries.insert(
            sample.sample_id.clone(),
            Arc::new(tokio::sync::Mutex::new(sample.clone())),
        );
        self.index.upsert_sample(&sample);
        info!(
            sample_id = %sample.sample_id,
            test_type = %sample.test_type,
            urgency = %sample.urgency,
            "Sample registered"
        );
        Ok(sample)
    }

    pub(crate) fn audit(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    async fn cell(&self, sample_id: &SampleId) -> Result<SampleCell, LifecycleError> {
        self.entries
            .read()
            .await
            .get(sample_id)
            .cloned()
            .ok_or_else(|| LifecycleError::SampleNotFound {
                sample_id: sample_id.clone(),
            })
    }

    pub async fn get(&self, sample_id: &SampleId) -> Option<Sample> {
        let cell = self.entries.read().await.get(sample_id).cloned()?;
        let sample = cell.lock().await;
        Some(sample.clone())
    }

    pub async fn stage_of(&self, sample_id: &SampleId) -> Option<SampleStage> {
        self.get(sample_id).await.map(|s| s.stage)
    }

    pub async fn all(&self) -> Vec<Sample> {
        let cells: Vec<SampleCell> = self.entries.read().await.values().cloned().collect();
        let mut samples = Vec::with_capacity(cells.len());
        for cell in cells {
            samples.push(cell.lock().await.clone());
        }
        samples
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Core transition primitive. `validate` runs under the lease against
    /// the current sample; `mutate` shapes the successor state before the
    /// stage is set. Nothing is published unless both ledger writes land.
    pub(crate) async fn transition<V, F>(
        &self,
        sample_id: &SampleId,
        actor: &str,
        action: &str,
        expected: &[SampleStage],
        to: SampleStage,
        note: Option<String>,
        validate: V,
        mutate: F,
    ) -> Result<Sample, LifecycleError>
    where
        V: FnOnce(&Sample) -> Result<(), LifecycleError>,
        F: FnOnce(&mut Sample),
    {
        let cell = self.cell(sample_id).await?;
        let mut guard = cell.clone().try_lock_owned().map_err(|_| {
            LifecycleError::ConcurrentModification {
                sample_id: sample_id.clone(),
            }
        })?;

        let from = guard.stage;
        if !expected.contains(&from) {
            return Err(LifecycleError::InvalidTransition {
                sample_id: sample_id.clone(),
                from,
                action: action.to_string(),
            });
        }
        validate(&guard)?;

        let mut updated = guard.clone();
        mutate(&mut updated);
        updated.stage = to;
        updated.updated_at = Utc::now();

        self.audit
            .record(AuditEvent::stage_change(
                sample_id.as_str(),
                actor,
                from,
                to,
                note,
            ))
            .await?;
        self.storage.append(SAMPLES_LEDGER, &updated).await?;

        *guard = updated.clone();
        self.index.upsert_sample(&updated);
        info!(
            sample_id = %sample_id,
            from_state = %from,
            to_state = %to,
            actor = %actor,
            action = action,
            "Sample stage transition"
        );
        Ok(updated)
    }

    /// Operator sign-off on a manual intervention item. The sample stays
    /// in its terminal stage; the resolution note is what the audit trail
    /// and the worklist surface afterwards.
    pub async fn resolve_manual(
        &self,
        sample_id: &SampleId,
        actor: &str,
        note: &str,
    ) -> Result<Sample, LifecycleError> {
        if note.trim().is_empty() {
            return Err(LifecycleError::MissingReason);
        }
        let cell = self.cell(sample_id).await?;
        let mut guard = cell.clone().try_lock_owned().map_err(|_| {
            LifecycleError::ConcurrentModification {
                sample_id: sample_id.clone(),
            }
        })?;

        if guard.stage != SampleStage::ManualIntervention {
            return Err(LifecycleError::InvalidTransition {
                sample_id: sample_id.clone(),
                from: guard.stage,
                action: "resolve".to_string(),
            });
        }
        if guard.resolution.is_some() {
            return Err(LifecycleError::InvalidTransition {
                sample_id: sample_id.clone(),
                from: guard.stage,
                action: "resolve a closed intervention".to_string(),
            });
        }

        let mut updated = guard.clone();
        updated.resolution = Some(ResolutionInfo {
            note: note.to_string(),
            resolved_by: actor.to_string(),
            resolved_at: Utc::now(),
        });
        updated.updated_at = Utc::now();

        self.audit
            .record(AuditEvent::record(
                sample_id.as_str(),
                actor,
                "INTERVENTION_RESOLVED",
                Some(note.to_string()),
            ))
            .await?;
        self.storage.append(SAMPLES_LEDGER, &updated).await?;

        *guard = updated.clone();
        self.index.upsert_sample(&updated);
        info!(
            sample_id = %sample_id,
            actor = %actor,
            "Manual intervention resolved"
        );
        Ok(updated)
    }

    /// Authorization commit: the report row and the stage change land
    /// together under the lease. A report row for a sample that never
    /// left AUTHORIZATION can then only come from a crash mid-commit,
    /// and restore filters those out by stage.
    pub(crate) async fn commit_authorization(
        &self,
        sample_id: &SampleId,
        actor: &str,
        report: &Report,
    ) -> Result<Sample, LifecycleError> {
        let cell = self.cell(sample_id).await?;
        let mut guard = cell.clone().try_lock_owned().map_err(|_| {
            LifecycleError::ConcurrentModification {
                sample_id: sample_id.clone(),
            }
        })?;

        if guard.stage != SampleStage::Authorization {
            return Err(LifecycleError::InvalidTransition {
                sample_id: sample_id.clone(),
                from: guard.stage,
                action: "authorize".to_string(),
            });
        }

        let mut updated = guard.clone();
        updated.stage = SampleStage::DispatchReady;
        updated.updated_at = Utc::now();

        self.storage.append(REPORTS_LEDGER, report).await?;
        self.audit
            .record(AuditEvent::stage_change(
                sample_id.as_str(),
                actor,
                SampleStage::Authorization,
                SampleStage::DispatchReady,
                Some(format!("report {} authorized", report.report_id)),
            ))
            .await?;
        self.storage.append(SAMPLES_LEDGER, &updated).await?;

        *guard = updated.clone();
        self.index.upsert_sample(&updated);
        info!(
            sample_id = %sample_id,
            from_state = %SampleStage::Authorization,
            to_state = %SampleStage::DispatchReady,
            actor = %actor,
            report_id = %report.report_id,
            "Sample stage transition"
        );
        Ok(updated)
    }

    /// Move a report's sample from DISPATCH_READY to DISPATCHED as the
    /// fan-out starts.
    pub async fn begin_dispatch(
        &self,
        sample_id: &SampleId,
        actor: &str,
    ) -> Result<Sample, LifecycleError> {
        self.transition(
            sample_id,
            actor,
            "dispatch",
            &[SampleStage::DispatchReady],
            SampleStage::Dispatched,
            None,
            |_| Ok(()),
            |_| {},
        )
        .await
    }

    /// Reflect a report's aggregate delivery status in the worklist.
    pub fn note_delivery_status(
        &self,
        sample_id: &SampleId,
        report_id: &ReportId,
        status: ReportDeliveryStatus,
    ) {
        self.index.set_report(sample_id, report_id);
        self.index.set_delivery_status(sample_id, status);
    }

    /// Delivery feedback once every channel of a report has settled. A
    /// fully delivered report closes the sample out in DISPATCHED; any
    /// failure escalates it to MANUAL_INTERVENTION. Unlike operator
    /// transitions this waits for the lease instead of failing, because
    /// the outcome must not be lost to a busy sample.
    pub async fn on_report_converged(
        &self,
        sample_id: &SampleId,
        report_id: &ReportId,
        status: ReportDeliveryStatus,
        actor: &str,
    ) -> Result<(), LifecycleError> {
        let cell = match self.cell(sample_id).await {
            Ok(cell) => cell,
            Err(_) => {
                warn!(
                    sample_id = %sample_id,
                    report_id = %report_id,
                    "Delivery convergence for an unknown sample"
                );
                return Ok(());
            }
        };
        let mut guard = cell.lock().await;

        match (guard.stage, status) {
            (SampleStage::Dispatched, ReportDeliveryStatus::Delivered) => {
                self.audit
                    .record(AuditEvent::record(
                        sample_id.as_str(),
                        actor,
                        SampleStage::Dispatched.as_str(),
                        Some(format!("report {report_id} delivered on all channels")),
                    ))
                    .await?;
                info!(
                    sample_id = %sample_id,
                    report_id = %report_id,
                    "Report fully delivered"
                );
            }
            (SampleStage::Dispatched, _) => {
                let mut updated = guard.clone();
                updated.stage = SampleStage::ManualIntervention;
                updated.updated_at = Utc::now();
                self.audit
                    .record(AuditEvent::stage_change(
                        sample_id.as_str(),
                        actor,
                        SampleStage::Dispatched,
                        SampleStage::ManualIntervention,
                        Some(format!("report {report_id} delivery concluded {status}")),
                    ))
                    .await?;
                self.storage.append(SAMPLES_LEDGER, &updated).await?;
                *guard = updated.clone();
                self.index.upsert_sample(&updated);
                warn!(
                    sample_id = %sample_id,
                    report_id = %report_id,
                    delivery_status = %status,
                    "Sample escalated for manual intervention"
                );
            }
            (stage, _) => {
                self.audit
                    .record(AuditEvent::record(
                        sample_id.as_str(),
                        actor,
                        stage.as_str(),
                        Some(format!("report {report_id} delivery concluded {status}")),
                    ))
                    .await?;
            }
        }
        Ok(())
    }
}
