use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::ReportDeliveryStatus;
use crate::lifecycle::{
    FlagLevel, QcStatus, ReportId, ReturnInfo, Sample, SampleId, SampleStage, Urgency,
};

/// Rows per page in every worklist view.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Denormalized projection of one sample, kept current by the lifecycle
/// so list views never walk the authoritative stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorklistEntry {
    pub sample_id: SampleId,
    pub patient_id: String,
    pub patient_name: String,
    pub test_type: String,
    pub mlt_name: String,
    pub stage: SampleStage,
    pub qc_status: QcStatus,
    pub flag: FlagLevel,
    pub urgency: Urgency,
    pub returned: Option<ReturnInfo>,
    /// True once a manual intervention item has been closed out.
    pub resolved: bool,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub report_id: Option<ReportId>,
    pub delivery_status: Option<ReportDeliveryStatus>,
}

impl WorklistEntry {
    fn from_sample(sample: &Sample) -> Self {
        Self {
            sample_id: sample.sample_id.clone(),
            patient_id: sample.patient_id.clone(),
            patient_name: sample.patient_name.clone(),
            test_type: sample.test_type.clone(),
            mlt_name: sample.mlt_name.clone(),
            stage: sample.stage,
            qc_status: sample.qc_status,
            flag: sample.flag,
            urgency: sample.urgency,
            returned: sample.returned.clone(),
            resolved: sample.resolution.is_some(),
            received_at: sample.received_at,
            updated_at: sample.updated_at,
            report_id: None,
            delivery_status: None,
        }
    }

    fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.sample_id.as_str().to_lowercase().contains(&needle)
            || self.patient_name.to_lowercase().contains(&needle)
            || self.test_type.to_lowercase().contains(&needle)
            || self.mlt_name.to_lowercase().contains(&needle)
    }
}

/// Filter and pagination parameters for a worklist view.
#[derive(Debug, Clone)]
pub struct WorklistQuery {
    pub stage: Option<SampleStage>,
    pub qc_status: Option<QcStatus>,
    pub flag: Option<FlagLevel>,
    pub urgency: Option<Urgency>,
    /// Only samples bounced back by a pathologist.
    pub returned_only: bool,
    /// Case-insensitive substring over sample id, patient name, test
    /// type, and technologist name.
    pub search: Option<String>,
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
}

impl Default for WorklistQuery {
    fn default() -> Self {
        Self {
            stage: None,
            qc_status: None,
            flag: None,
            urgency: None,
            returned_only: false,
            search: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl WorklistQuery {
    pub fn for_stage(stage: SampleStage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    fn matches(&self, entry: &WorklistEntry) -> bool {
        if let Some(stage) = self.stage {
            if entry.stage != stage {
                return false;
            }
        }
        if let Some(qc) = self.qc_status {
            if entry.qc_status != qc {
                return false;
            }
        }
        if let Some(flag) = self.flag {
            if entry.flag != flag {
                return false;
            }
        }
        if let Some(urgency) = self.urgency {
            if entry.urgency != urgency {
                return false;
            }
        }
        if self.returned_only && entry.returned.is_none() {
            return false;
        }
        if let Some(search) = &self.search {
            if !search.trim().is_empty() && !entry.matches_search(search.trim()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct WorklistPage {
    pub entries: Vec<WorklistEntry>,
    /// Matches across all pages.
    pub total: usize,
    pub page: usize,
    pub page_count: usize,
}

/// Header counts for the verification worklist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationStats {
    pub total_pending: usize,
    pub stat_pending: usize,
    pub critical_flags: usize,
    pub returned: usize,
}

/// In-memory read model over the sample population. Updated inside every
/// lifecycle transition before the sample lease is released, so a reader
/// that observed a transition result sees it reflected here.
#[derive(Default)]
pub struct WorklistIndex {
    entries: RwLock<HashMap<SampleId, WorklistEntry>>,
}

impl WorklistIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh a sample's projection, preserving report linkage.
    pub fn upsert_sample(&self, sample: &Sample) {
        let mut entries = self.entries.write().unwrap();
        let mut next = WorklistEntry::from_sample(sample);
        if let Some(existing) = entries.get(&sample.sample_id) {
            next.report_id = existing.report_id.clone();
            next.delivery_status = existing.delivery_status;
        }
        entries.insert(sample.sample_id.clone(), next);
    }

    pub fn set_report(&self, sample_id: &SampleId, report_id: &ReportId) {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(sample_id) {
            entry.report_id = Some(report_id.clone());
        }
    }

    pub fn set_delivery_status(&self, sample_id: &SampleId, status: ReportDeliveryStatus) {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(sample_id) {
            entry.delivery_status = Some(status);
        }
    }

    pub fn entry(&self, sample_id: &SampleId) -> Option<WorklistEntry> {
        self.entries.read().unwrap().get(sample_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// Drop everything and reproject from a sample snapshot. Used at boot.
    pub fn rebuild(&self, samples: &[Sample]) {
        let mut entries = self.entries.write().unwrap();
        entries.clear();
        for sample in samples {
            entries.insert(sample.sample_id.clone(), WorklistEntry::from_sample(sample));
        }
    }

    /// Filtered, ordered, paginated view. STAT samples sort ahead of
    /// routine ones; within an urgency band the oldest sample comes
    /// first. Ordering is total, so pagination is stable.
    pub fn query(&self, query: &WorklistQuery) -> WorklistPage {
        let entries = self.entries.read().unwrap();
        let mut matches: Vec<WorklistEntry> = entries
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            let stat_a = a.urgency == Urgency::Stat;
            let stat_b = b.urgency == Urgency::Stat;
            stat_b
                .cmp(&stat_a)
                .then_with(|| a.received_at.cmp(&b.received_at))
                .then_with(|| a.sample_id.cmp(&b.sample_id))
        });

        let total = matches.len();
        let page_size = query.page_size.max(1);
        let page = query.page.max(1);
        let page_count = total.div_ceil(page_size);
        let entries = matches
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();
        WorklistPage {
            entries,
            total,
            page,
            page_count,
        }
    }

    /// Counts for the verification queue header cards.
    pub fn verification_stats(&self) -> VerificationStats {
        let entries = self.entries.read().unwrap();
        let mut stats = VerificationStats::default();
        for entry in entries.values() {
            if entry.stage != SampleStage::Verification {
                continue;
            }
            stats.total_pending += 1;
            if entry.urgency == Urgency::Stat {
                stats.stat_pending += 1;
            }
            if entry.flag == FlagLevel::Critical {
                stats.critical_flags += 1;
            }
            if entry.returned.is_some() {
                stats.returned += 1;
            }
        }
        stats
    }
}
