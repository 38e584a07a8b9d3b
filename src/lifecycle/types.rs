use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::Channel;

/// Stable identifier for a physical specimen / test order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleId(pub String);

impl SampleId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SampleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SampleId {
    fn from(s: &str) -> Self {
        SampleId(s.to_string())
    }
}

/// Identifier of the report produced at authorization time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReportId(pub String);

impl ReportId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReportId {
    fn from(s: &str) -> Self {
        ReportId(s.to_string())
    }
}

/// Lifecycle stage of a sample. Transitions are owned exclusively by the
/// state machine; nothing else mutates a sample's stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SampleStage {
    /// Awaiting technical verification by an MLT.
    Verification,
    /// Verified, awaiting clinical authorization by a pathologist.
    Authorization,
    /// Authorized and released, report parked for dispatch.
    DispatchReady,
    /// Fan-out started; terminal once every channel has resolved.
    Dispatched,
    /// Escalated for human resolution (recall or exhausted deliveries).
    ManualIntervention,
}

impl SampleStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SampleStage::Dispatched | SampleStage::ManualIntervention
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SampleStage::Verification => "VERIFICATION",
            SampleStage::Authorization => "AUTHORIZATION",
            SampleStage::DispatchReady => "DISPATCH_READY",
            SampleStage::Dispatched => "DISPATCHED",
            SampleStage::ManualIntervention => "MANUAL_INTERVENTION",
        }
    }
}

impl std::fmt::Display for SampleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Instrument-run quality control verdict. `Fail` blocks the sample from
/// ever leaving verification until a corrected run replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QcStatus {
    Pass,
    Fail,
    Pending,
}

impl std::fmt::Display for QcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QcStatus::Pass => "PASS",
            QcStatus::Fail => "FAIL",
            QcStatus::Pending => "PENDING",
        };
        write!(f, "{s}")
    }
}

/// Abnormality flag derived from result values against reference ranges.
/// Critical forces priority handling but never bypasses a required stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagLevel {
    Normal,
    High,
    Low,
    Critical,
}

impl FlagLevel {
    /// Severity rank used when folding result flags into a sample flag.
    pub fn severity(&self) -> u8 {
        match self {
            FlagLevel::Normal => 0,
            FlagLevel::Low | FlagLevel::High => 1,
            FlagLevel::Critical => 2,
        }
    }
}

impl std::fmt::Display for FlagLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlagLevel::Normal => "NORMAL",
            FlagLevel::High => "HIGH",
            FlagLevel::Low => "LOW",
            FlagLevel::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

/// Turnaround classification. STAT samples are sorted ahead of routine
/// ones in every worklist view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    #[default]
    Routine,
    Stat,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Urgency::Routine => "ROUTINE",
            Urgency::Stat => "STAT",
        };
        write!(f, "{s}")
    }
}

/// Low/high bounds a result value is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRange {
    pub low: f64,
    pub high: f64,
}

impl ReferenceRange {
    /// Derive the flag for a value. Outside the range is High/Low; more
    /// than twice the range span beyond either bound is Critical.
    pub fn flag_for(&self, value: f64) -> FlagLevel {
        let span = (self.high - self.low).max(f64::EPSILON);
        if value > self.high {
            if value > self.high + 2.0 * span {
                FlagLevel::Critical
            } else {
                FlagLevel::High
            }
        } else if value < self.low {
            if value < self.low - 2.0 * span {
                FlagLevel::Critical
            } else {
                FlagLevel::Low
            }
        } else {
            FlagLevel::Normal
        }
    }
}

/// One measured parameter on a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultValue {
    pub parameter: String,
    pub value: f64,
    pub unit: String,
    pub reference_range: ReferenceRange,
    pub flag: FlagLevel,
}

/// Set when a pathologist bounces a sample back to the MLT queue. Cleared
/// again when the sample is resubmitted for verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnInfo {
    pub reason: String,
    pub returned_by: String,
    pub returned_at: DateTime<Utc>,
}

/// Operator sign-off closing a manual intervention item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionInfo {
    pub note: String,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

/// One physical specimen flowing through the lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub sample_id: SampleId,
    pub patient_id: String,
    pub patient_name: String,
    pub test_type: String,
    /// Technologist who ran the test on the instrument.
    pub mlt_name: String,
    pub stage: SampleStage,
    pub qc_status: QcStatus,
    pub flag: FlagLevel,
    pub urgency: Urgency,
    pub results: Vec<ResultValue>,
    /// Patient delivery preferences captured at intake. Empty means the
    /// report waits for a dispatch operator to choose channels.
    pub delivery_channels: Vec<Channel>,
    pub received_at: DateTime<Utc>,
    pub returned: Option<ReturnInfo>,
    /// Present once an operator has closed out a manual intervention.
    pub resolution: Option<ResolutionInfo>,
    pub updated_at: DateTime<Utc>,
}

impl Sample {
    /// Most severe flag across all result values.
    pub fn overall_flag(results: &[ResultValue]) -> FlagLevel {
        let mut worst = FlagLevel::Normal;
        for result in results {
            if result.flag.severity() > worst.severity() {
                worst = result.flag;
            }
        }
        worst
    }
}

/// A group of samples produced by one instrument run. Bulk approval only
/// ever touches the members that passed QC with no abnormal flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentBatch {
    pub batch_id: String,
    pub name: String,
    pub instrument_id: String,
    pub department: String,
    /// Aggregate run verdict. A pending run cannot be bulk-approved.
    pub qc_status: QcStatus,
    pub sample_ids: Vec<SampleId>,
    pub normal_results: u32,
    pub exceptions: u32,
}

/// Signed clinical report, produced exactly once per authorization.
/// Immutable after creation; amendments would be a new report version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub report_id: ReportId,
    pub sample_id: SampleId,
    pub patient_id: String,
    pub patient_name: String,
    pub test_type: String,
    pub interpretation: String,
    pub signature: String,
    pub authorized_by: String,
    pub authorized_at: DateTime<Utc>,
}

/// Outcome of a bulk approval run: which samples advanced and which were
/// left for individual review, with the reason each one was skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkApprovalOutcome {
    pub batch_id: String,
    pub approved: Vec<SampleId>,
    pub skipped: Vec<SkippedSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedSample {
    pub sample_id: SampleId,
    pub reason: String,
}
