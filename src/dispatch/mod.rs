//! Report delivery: fan-out, sinks, retries, and the failed queue.

pub mod coordinator;
pub mod mocks;
pub mod retry;
pub mod sink;
pub mod types;

pub use coordinator::{
    AttemptDisposition, DispatchCoordinator, DispatchIntent, DISPATCH_ACTOR,
    RETRY_SCHEDULER_ACTOR,
};
pub use retry::{RecoveryReport, RetryCheckpoint, RetryPolicy, RetryScheduler, MAX_DELIVERY_ATTEMPTS};
pub use sink::{DeliveryReceipt, DeliveryRequest, DeliverySink, LogSink, SinkError, SinkRegistry};
pub use types::{
    AttemptOutcome, Channel, ChannelResolution, DeliveryAttempt, DeliveryOverview, DispatchError,
    DispatchStats, FailedDelivery, FailedQueueStats, ReportDeliveryStatus,
};
