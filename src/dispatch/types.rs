use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::ReportId;
use crate::storage::StorageError;

/// Outbound delivery channel for a finalized report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Sms,
    Print,
    Portal,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Email, Channel::Sms, Channel::Print, Channel::Portal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
            Channel::Print => "PRINT",
            Channel::Portal => "PORTAL",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EMAIL" => Ok(Channel::Email),
            "SMS" => Ok(Channel::Sms),
            "PRINT" => Ok(Channel::Print),
            "PORTAL" => Ok(Channel::Portal),
            other => Err(format!(
                "unknown channel '{other}', expected one of EMAIL, SMS, PRINT, PORTAL"
            )),
        }
    }
}

/// Result of one send on one channel. `Pending` marks an attempt that has
/// started but not yet resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Pending,
    Delivered,
    Failed,
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttemptOutcome::Pending => "PENDING",
            AttemptOutcome::Delivered => "DELIVERED",
            AttemptOutcome::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// One send attempt, persisted to the attempts ledger both when it starts
/// (outcome Pending) and when it resolves. Replaying the ledger in order
/// reconstructs the exact delivery state at crash time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub report_id: ReportId,
    pub channel: Channel,
    /// 1-based position in the shared per-channel attempt budget.
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate delivery state of a report across all of its channels,
/// recomputed after every attempt resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportDeliveryStatus {
    /// At least one channel has not reached a terminal outcome yet.
    Pending,
    /// Every channel delivered.
    Delivered,
    /// Some channels delivered, the rest failed terminally.
    Partial,
    /// Every channel failed terminally.
    Failed,
}

impl std::fmt::Display for ReportDeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReportDeliveryStatus::Pending => "PENDING",
            ReportDeliveryStatus::Delivered => "DELIVERED",
            ReportDeliveryStatus::Partial => "PARTIAL",
            ReportDeliveryStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Terminal-or-not view of one channel, used to fold the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelResolution {
    Unresolved,
    Delivered,
    Failed,
}

impl ReportDeliveryStatus {
    pub fn aggregate(resolutions: impl IntoIterator<Item = ChannelResolution>) -> Self {
        let mut delivered = 0usize;
        let mut failed = 0usize;
        let mut unresolved = 0usize;
        for resolution in resolutions {
            match resolution {
                ChannelResolution::Delivered => delivered += 1,
                ChannelResolution::Failed => failed += 1,
                ChannelResolution::Unresolved => unresolved += 1,
            }
        }
        if delivered + failed + unresolved == 0 || unresolved > 0 {
            ReportDeliveryStatus::Pending
        } else if failed == 0 {
            ReportDeliveryStatus::Delivered
        } else if delivered == 0 {
            ReportDeliveryStatus::Failed
        } else {
            ReportDeliveryStatus::Partial
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReportDeliveryStatus::Pending)
    }
}

/// Row in the failed deliveries queue awaiting operator action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedDelivery {
    pub report_id: ReportId,
    pub patient_name: String,
    pub test_type: String,
    pub channel: Channel,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
    /// Attempts consumed so far out of the per-channel budget.
    pub attempt_count: u32,
    /// True once the budget is exhausted and only manual resolution remains.
    pub exhausted: bool,
    /// True when the report was recalled; the row is informational and
    /// cannot be retried.
    pub recalled: bool,
}

/// Row in the delivery dashboard listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOverview {
    pub report_id: ReportId,
    pub patient_name: String,
    pub test_type: String,
    pub channels: Vec<Channel>,
    pub status: ReportDeliveryStatus,
    pub dispatched_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Counts for the dispatch dashboard cards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub total: usize,
    pub delivered: usize,
    pub pending: usize,
    pub partial: usize,
    pub failed: usize,
}

/// Summary for the failed deliveries queue header.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailedQueueStats {
    pub total: usize,
    pub exhausted: usize,
    pub average_attempts: f64,
    /// Failure reason with its occurrence count, most common first.
    pub by_reason: Vec<(String, usize)>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch of report {report_id} requires at least one channel")]
    EmptyChannelSet { report_id: ReportId },

    #[error("no sink registered for channel {channel}")]
    ChannelUnavailable { channel: Channel },

    #[error("report {report_id} is not known to the dispatch coordinator")]
    UnknownReport { report_id: ReportId },

    #[error("report {report_id} is not waiting for dispatch")]
    NotReady { report_id: ReportId },

    #[error("retry budget exhausted for report {report_id} on channel {channel}")]
    RetryExhausted { report_id: ReportId, channel: Channel },

    #[error("channel {channel} for report {report_id} has no failed delivery to retry")]
    NothingToRetry { report_id: ReportId, channel: Channel },

    #[error("report {report_id} was recalled, channel {channel} cannot be retried")]
    ReportRecalled { report_id: ReportId, channel: Channel },

    #[error("delivery storage unavailable: {0}")]
    StorageUnavailable(#[source] StorageError),

    #[error(transparent)]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),
}

impl From<StorageError> for DispatchError {
    fn from(e: StorageError) -> Self {
        DispatchError::StorageUnavailable(e)
    }
}

impl From<crate::audit::AuditError> for DispatchError {
    fn from(e: crate::audit::AuditError) -> Self {
        match e {
            crate::audit::AuditError::StorageUnavailable(inner) => {
                DispatchError::StorageUnavailable(inner)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_all_delivered() {
        let status = ReportDeliveryStatus::aggregate([
            ChannelResolution::Delivered,
            ChannelResolution::Delivered,
        ]);
        assert_eq!(status, ReportDeliveryStatus::Delivered);
    }

    #[test]
    fn test_aggregate_mixed_is_partial() {
        let status = ReportDeliveryStatus::aggregate([
            ChannelResolution::Delivered,
            ChannelResolution::Failed,
        ]);
        assert_eq!(status, ReportDeliveryStatus::Partial);
    }

    #[test]
    fn test_aggregate_all_failed() {
        let status = ReportDeliveryStatus::aggregate([
            ChannelResolution::Failed,
            ChannelResolution::Failed,
        ]);
        assert_eq!(status, ReportDeliveryStatus::Failed);
    }

    #[test]
    fn test_aggregate_any_unresolved_is_pending() {
        let status = ReportDeliveryStatus::aggregate([
            ChannelResolution::Delivered,
            ChannelResolution::Unresolved,
            ChannelResolution::Failed,
        ]);
        assert_eq!(status, ReportDeliveryStatus::Pending);
    }

    #[test]
    fn test_aggregate_no_channels_is_pending() {
        let status = ReportDeliveryStatus::aggregate([]);
        assert_eq!(status, ReportDeliveryStatus::Pending);
    }

    #[test]
    fn test_channel_parse_round_trip() {
        for channel in Channel::ALL {
            let parsed: Channel = channel.as_str().parse().unwrap();
            assert_eq!(parsed, channel);
        }
        assert!("fax".parse::<Channel>().is_err());
        assert_eq!("email".parse::<Channel>().unwrap(), Channel::Email);
    }
}
