//! Instrument/LIS feed: raw result submissions become registered samples.
//!
//! Intake is where flags are derived. The feed carries measured values
//! and reference ranges; everything downstream only ever sees the
//! derived `FlagLevel`, so a result can never reach verification with a
//! value/flag mismatch.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn, Instrument};

use crate::audit::AuditEvent;
use crate::dispatch::Channel;
use crate::lifecycle::{
    InstrumentBatch, LifecycleError, QcStatus, ReferenceRange, ResultValue, Sample,
    SampleId, SampleRegistry, SampleStage, Urgency,
};
use crate::storage::{LedgerStorage, StorageError};
use crate::telemetry::{create_lifecycle_span, generate_correlation_id};

pub const BATCHES_LEDGER: &str = "batches";

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("invalid submission: {reason}")]
    InvalidSubmission { reason: String },

    #[error("batch {batch_id} is not known")]
    BatchNotFound { batch_id: String },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl From<StorageError> for IntakeError {
    fn from(e: StorageError) -> Self {
        IntakeError::Lifecycle(LifecycleError::StorageUnavailable(e))
    }
}

impl IntakeError {
    fn invalid(reason: impl Into<String>) -> Self {
        IntakeError::InvalidSubmission {
            reason: reason.into(),
        }
    }
}

/// One measured parameter as the instrument reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSubmission {
    pub parameter: String,
    pub value: f64,
    pub unit: String,
    pub reference_low: f64,
    pub reference_high: f64,
}

/// One sample as the feed delivers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSubmission {
    pub sample_id: String,
    pub patient_id: String,
    pub patient_name: String,
    pub test_type: String,
    pub mlt_name: String,
    pub qc_status: QcStatus,
    #[serde(default)]
    pub urgency: Urgency,
    pub results: Vec<ResultSubmission>,
    /// Patient delivery preferences, if the order carried any.
    #[serde(default)]
    pub delivery_channels: Vec<Channel>,
}

/// One instrument run: a batch header plus its member samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub batch_id: String,
    pub name: String,
    pub instrument_id: String,
    pub department: String,
    pub qc_status: QcStatus,
    pub samples: Vec<SampleSubmission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedSample {
    pub sample_id: String,
    pub reason: String,
}

/// What a batch ingestion produced: the persisted batch record, the
/// members that registered, and the members that did not.
#[derive(Debug, Clone)]
pub struct BatchIntakeOutcome {
    pub batch: InstrumentBatch,
    pub accepted: Vec<Sample>,
    pub rejected: Vec<RejectedSample>,
}

pub struct SampleIntake {
    registry: Arc<SampleRegistry>,
    storage: Arc<LedgerStorage>,
}

impl SampleIntake {
    pub fn new(registry: Arc<SampleRegistry>, storage: Arc<LedgerStorage>) -> Self {
        Self { registry, storage }
    }

    /// Admit a single sample into VERIFICATION.
    pub async fn ingest_sample(
        &self,
        submission: SampleSubmission,
        actor: &str,
    ) -> Result<Sample, IntakeError> {
        let sample = build_sample(&submission)?;
        let span =
            create_lifecycle_span("ingest_sample", Some(sample.sample_id.as_str()), Some(actor), None);
        let sample = self.registry.register(sample, actor).instrument(span).await?;
        Ok(sample)
    }

    /// Admit a whole instrument run. Individual rejects (a duplicate
    /// resend, a malformed member) do not fail the run; only members
    /// that registered appear on the batch record.
    pub async fn ingest_batch(
        &self,
        submission: BatchSubmission,
        actor: &str,
    ) -> Result<BatchIntakeOutcome, IntakeError> {
        let correlation_id = generate_correlation_id();
        let span =
            create_lifecycle_span("ingest_batch", None, Some(actor), Some(correlation_id.as_str()));
        self.run_batch(submission, actor, &correlation_id)
            .instrument(span)
            .await
    }

    async fn run_batch(
        &self,
        submission: BatchSubmission,
        actor: &str,
        correlation_id: &str,
    ) -> Result<BatchIntakeOutcome, IntakeError> {
        if submission.batch_id.trim().is_empty() {
            return Err(IntakeError::invalid("batch id is empty"));
        }
        if submission.samples.is_empty() {
            return Err(IntakeError::invalid(format!(
                "batch {} carries no samples",
                submission.batch_id
            )));
        }

        let mut accepted: Vec<Sample> = Vec::new();
        let mut rejected: Vec<RejectedSample> = Vec::new();
        for member in &submission.samples {
            let sample = match build_sample(member) {
                Ok(sample) => sample,
                Err(e) => {
                    warn!(
                        batch_id = %submission.batch_id,
                        sample_id = %member.sample_id,
                        error = %e,
                        "Batch member rejected at intake"
                    );
                    rejected.push(RejectedSample {
                        sample_id: member.sample_id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            match self.registry.register(sample, actor).await {
                Ok(sample) => accepted.push(sample),
                Err(e @ LifecycleError::DuplicateSample { .. }) => {
                    warn!(
                        batch_id = %submission.batch_id,
                        sample_id = %member.sample_id,
                        "Batch member already registered"
                    );
                    rejected.push(RejectedSample {
                        sample_id: member.sample_id.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let normal = accepted
            .iter()
            .filter(|s| s.flag == crate::lifecycle::FlagLevel::Normal)
            .count() as u32;
        let batch = InstrumentBatch {
            batch_id: submission.batch_id.clone(),
            name: submission.name.clone(),
            instrument_id: submission.instrument_id.clone(),
            department: submission.department.clone(),
            qc_status: submission.qc_status,
            sample_ids: accepted.iter().map(|s| s.sample_id.clone()).collect(),
            normal_results: normal,
            exceptions: accepted.len() as u32 - normal,
        };
        self.storage.append(BATCHES_LEDGER, &batch).await?;
        self.registry
            .audit()
            .record(
                AuditEvent::record(
                    batch.batch_id.as_str(),
                    actor,
                    "BATCH_RECEIVED",
                    Some(format!(
                        "{} samples, {} exceptions, quality control {}",
                        batch.sample_ids.len(),
                        batch.exceptions,
                        batch.qc_status
                    )),
                )
                .with_correlation_id(correlation_id),
            )
            .await
            .map_err(LifecycleError::from)?;
        info!(
            batch_id = %batch.batch_id,
            instrument_id = %batch.instrument_id,
            accepted = accepted.len(),
            rejected = rejected.len(),
            "Instrument batch ingested"
        );

        Ok(BatchIntakeOutcome {
            batch,
            accepted,
            rejected,
        })
    }

    /// Latest record per batch id, in first-seen order.
    pub async fn batches(&self) -> Result<Vec<InstrumentBatch>, IntakeError> {
        let rows: Vec<InstrumentBatch> = self.storage.read_all(BATCHES_LEDGER).await?;
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, InstrumentBatch> = HashMap::new();
        for batch in rows {
            if !latest.contains_key(&batch.batch_id) {
                order.push(batch.batch_id.clone());
            }
            latest.insert(batch.batch_id.clone(), batch);
        }
        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect())
    }

    pub async fn batch(&self, batch_id: &str) -> Result<InstrumentBatch, IntakeError> {
        self.batches()
            .await?
            .into_iter()
            .find(|b| b.batch_id == batch_id)
            .ok_or_else(|| IntakeError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })
    }
}

fn build_sample(submission: &SampleSubmission) -> Result<Sample, IntakeError> {
    let sample_id = submission.sample_id.trim();
    if sample_id.is_empty() {
        return Err(IntakeError::invalid("sample id is empty"));
    }
    if submission.patient_id.trim().is_empty() || submission.patient_name.trim().is_empty() {
        return Err(IntakeError::invalid(format!(
            "sample {sample_id} has no patient identity"
        )));
    }
    if submission.test_type.trim().is_empty() {
        return Err(IntakeError::invalid(format!(
            "sample {sample_id} has no test type"
        )));
    }
    if submission.results.is_empty() {
        return Err(IntakeError::invalid(format!(
            "sample {sample_id} carries no results"
        )));
    }

    let mut results = Vec::with_capacity(submission.results.len());
    for row in &submission.results {
        if row.parameter.trim().is_empty() {
            return Err(IntakeError::invalid(format!(
                "sample {sample_id} has a result with no parameter name"
            )));
        }
        if row.reference_low >= row.reference_high {
            return Err(IntakeError::invalid(format!(
                "sample {sample_id} parameter {}: reference low {} is not below high {}",
                row.parameter, row.reference_low, row.reference_high
            )));
        }
        let range = ReferenceRange {
            low: row.reference_low,
            high: row.reference_high,
        };
        results.push(ResultValue {
            parameter: row.parameter.trim().to_string(),
            value: row.value,
            unit: row.unit.clone(),
            flag: range.flag_for(row.value),
            reference_range: range,
        });
    }

    let flag = Sample::overall_flag(&results);
    let now = Utc::now();
    Ok(Sample {
        sample_id: SampleId(sample_id.to_string()),
        patient_id: submission.patient_id.trim().to_string(),
        patient_name: submission.patient_name.trim().to_string(),
        test_type: submission.test_type.trim().to_string(),
        mlt_name: submission.mlt_name.trim().to_string(),
        stage: SampleStage::Verification,
        qc_status: submission.qc_status,
        flag,
        urgency: submission.urgency,
        results,
        delivery_channels: submission.delivery_channels.clone(),
        received_at: now,
        returned: None,
        resolution: None,
        updated_at: now,
    })
}
