use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::lifecycle::SampleStage;
use crate::storage::{LedgerStorage, StorageError};

const AUDIT_LEDGER: &str = "audit";

#[derive(Debug, Error)]
pub enum AuditError {
    /// The backing store rejected the append. Callers must abort the
    /// operation that produced the event rather than proceed unrecorded.
    #[error("audit storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),
}

/// One immutable entry in the compliance record. Events are never updated
/// or deleted; corrections append new events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Sample or report the event is about.
    pub subject_id: String,
    /// Operator or system component that caused the event.
    pub actor: String,
    pub from_state: Option<String>,
    pub to_state: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl AuditEvent {
    /// Event for a sample moving between lifecycle stages.
    pub fn stage_change(
        subject_id: impl Into<String>,
        actor: impl Into<String>,
        from: SampleStage,
        to: SampleStage,
        note: Option<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            actor: actor.into(),
            from_state: Some(from.as_str().to_string()),
            to_state: to.as_str().to_string(),
            timestamp: Utc::now(),
            note,
            correlation_id: None,
        }
    }

    /// Event for a delivery attempt resolving on one channel.
    pub fn delivery_outcome(
        report_id: impl Into<String>,
        actor: impl Into<String>,
        channel: &str,
        attempt_number: u32,
        outcome: &str,
        note: Option<String>,
    ) -> Self {
        Self {
            subject_id: report_id.into(),
            actor: actor.into(),
            from_state: Some(format!("{channel}_ATTEMPT_{attempt_number}")),
            to_state: outcome.to_string(),
            timestamp: Utc::now(),
            note,
            correlation_id: None,
        }
    }

    /// Event with no prior state, e.g. a sample entering the system.
    pub fn record(
        subject_id: impl Into<String>,
        actor: impl Into<String>,
        state: impl Into<String>,
        note: Option<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            actor: actor.into(),
            from_state: None,
            to_state: state.into(),
            timestamp: Utc::now(),
            note,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Persistence seam for the audit trail. The production store appends to
/// a JSONL ledger; tests swap in the in-memory store.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError>;

    /// Every event in append order.
    async fn load_all(&self) -> Result<Vec<AuditEvent>, AuditError>;

    /// Events for one subject, in the order they were recorded.
    async fn load_for_subject(&self, subject_id: &str) -> Result<Vec<AuditEvent>, AuditError> {
        let events = self.load_all().await?;
        Ok(events
            .into_iter()
            .filter(|e| e.subject_id == subject_id)
            .collect())
    }
}

/// Ledger-backed audit store. One line per event in `audit.jsonl`.
pub struct JsonlAuditLog {
    storage: Arc<LedgerStorage>,
}

impl JsonlAuditLog {
    pub fn new(storage: Arc<LedgerStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl AuditStore for JsonlAuditLog {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        debug!(
            subject_id = %event.subject_id,
            actor = %event.actor,
            to_state = %event.to_state,
            "Recording audit event"
        );
        self.storage.append(AUDIT_LEDGER, &event).await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self.storage.read_all(AUDIT_LEDGER).await?)
    }
}

/// In-memory audit store for tests. `set_unavailable` makes every append
/// fail the way a full disk would, so callers' abort paths can be driven.
pub struct MemoryAuditLog {
    events: tokio::sync::Mutex<Vec<AuditEvent>>,
    unavailable: AtomicBool,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self {
            events: tokio::sync::Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn storage_error() -> AuditError {
        AuditError::StorageUnavailable(StorageError::Io {
            path: std::path::PathBuf::from("<memory>"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "audit store offline"),
        })
    }
}

impl Default for MemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditLog {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Self::storage_error());
        }
        self.events.lock().await.push(event);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Self::storage_error());
        }
        Ok(self.events.lock().await.clone())
    }
}
