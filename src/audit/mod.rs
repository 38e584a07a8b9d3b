//! Append-only audit trail.
//!
//! Every stage transition and every delivery attempt outcome lands here
//! before the change is considered committed. The trail doubles as the
//! recovery log the retry scheduler and worklist are rebuilt from.

pub mod export;
pub mod log;

pub use export::{export_delivery_log, export_range};
pub use log::{AuditError, AuditEvent, AuditStore, JsonlAuditLog, MemoryAuditLog};
