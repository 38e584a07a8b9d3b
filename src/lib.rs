// Labflow Library - Laboratory Report Lifecycle Orchestration
// This exposes the core components for testing and integration

pub mod audit;
pub mod config;
pub mod dispatch;
pub mod intake;
pub mod lifecycle;
pub mod shutdown;
pub mod storage;
pub mod system;
pub mod telemetry;
pub mod worklist;

// Re-export key types for easy access
pub use audit::{
    export_delivery_log, export_range, AuditError, AuditEvent, AuditStore, JsonlAuditLog,
    MemoryAuditLog,
};
pub use config::{config, init_config, LabflowConfig};
pub use dispatch::{
    AttemptOutcome, Channel, DeliveryAttempt, DeliveryOverview, DeliverySink, DispatchCoordinator,
    DispatchError, FailedDelivery, ReportDeliveryStatus, RetryPolicy, RetryScheduler, SinkRegistry,
    MAX_DELIVERY_ATTEMPTS,
};
pub use intake::{BatchSubmission, IntakeError, ResultSubmission, SampleIntake, SampleSubmission};
pub use lifecycle::{
    BulkApprovalOutcome, FlagLevel, InstrumentBatch, LifecycleError, LifecycleStateMachine,
    QcStatus, Report, ReportId, Sample, SampleId, SampleRegistry, SampleStage, Urgency,
};
pub use shutdown::ShutdownCoordinator;
pub use storage::{LedgerStorage, StorageError};
pub use system::{BootReport, LabSystem};
pub use telemetry::{
    create_lifecycle_span, generate_correlation_id, init_telemetry, shutdown_telemetry,
};
pub use worklist::{WorklistIndex, WorklistPage, WorklistQuery};
