//! Sample lifecycle: stages, the authoritative registry, and the
//! operator-facing state machine.

pub mod registry;
pub mod state_machine;
pub mod types;

pub use registry::{LifecycleError, SampleRegistry, REPORTS_LEDGER, SAMPLES_LEDGER};
pub use state_machine::{LifecycleStateMachine, RestoreSummary};
pub use types::{
    BulkApprovalOutcome, FlagLevel, InstrumentBatch, QcStatus, ReferenceRange, Report, ReportId,
    ResolutionInfo, ResultValue, ReturnInfo, Sample, SampleId, SampleStage, SkippedSample, Urgency,
};
