//! CSV exports for compliance review: the raw audit trail and the flat
//! per-report delivery record.

use chrono::{DateTime, Utc};

use super::log::{AuditError, AuditStore};
use crate::dispatch::DeliveryOverview;

const CSV_HEADER: &str = "timestamp,subject_id,actor,from_state,to_state,note,correlation_id";

const DELIVERY_HEADER: &str = "report_id,patient,test,methods,status,dispatched_at,delivered_at";

/// Render every event with `from <= timestamp < to` as CSV, oldest first.
pub async fn export_range(
    store: &dyn AuditStore,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<String, AuditError> {
    let mut events = store.load_all().await?;
    events.retain(|e| e.timestamp >= from && e.timestamp < to);
    events.sort_by_key(|e| e.timestamp);

    let mut csv = String::with_capacity(events.len() * 96 + CSV_HEADER.len() + 1);
    csv.push_str(CSV_HEADER);
    csv.push('\n');
    for event in &events {
        csv.push_str(&csv_field(&event.timestamp.to_rfc3339()));
        csv.push(',');
        csv.push_str(&csv_field(&event.subject_id));
        csv.push(',');
        csv.push_str(&csv_field(&event.actor));
        csv.push(',');
        csv.push_str(&csv_field(event.from_state.as_deref().unwrap_or("")));
        csv.push(',');
        csv.push_str(&csv_field(&event.to_state));
        csv.push(',');
        csv.push_str(&csv_field(event.note.as_deref().unwrap_or("")));
        csv.push(',');
        csv.push_str(&csv_field(event.correlation_id.as_deref().unwrap_or("")));
        csv.push('\n');
    }
    Ok(csv)
}

/// Render one row per report dispatched with `from <= dispatched_at < to`,
/// oldest first. `delivered_at` stays blank until every channel delivered.
pub fn export_delivery_log(
    rows: &[DeliveryOverview],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> String {
    let mut rows: Vec<&DeliveryOverview> = rows
        .iter()
        .filter(|r| r.dispatched_at >= from && r.dispatched_at < to)
        .collect();
    rows.sort_by_key(|r| r.dispatched_at);

    let mut csv = String::with_capacity(rows.len() * 96 + DELIVERY_HEADER.len() + 1);
    csv.push_str(DELIVERY_HEADER);
    csv.push('\n');
    for row in rows {
        let methods: Vec<&str> = row.channels.iter().map(|c| c.as_str()).collect();
        csv.push_str(&csv_field(row.report_id.as_str()));
        csv.push(',');
        csv.push_str(&csv_field(&row.patient_name));
        csv.push(',');
        csv.push_str(&csv_field(&row.test_type));
        csv.push(',');
        csv.push_str(&csv_field(&methods.join("|")));
        csv.push(',');
        csv.push_str(&csv_field(&row.status.to_string()));
        csv.push(',');
        csv.push_str(&csv_field(&row.dispatched_at.to_rfc3339()));
        csv.push(',');
        csv.push_str(&csv_field(
            row.delivered_at
                .map(|t| t.to_rfc3339())
                .as_deref()
                .unwrap_or(""),
        ));
        csv.push('\n');
    }
    csv
}

/// Quote a field if it contains a delimiter, quote, or newline.
fn csv_field(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
