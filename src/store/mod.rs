//! Blocklist persistence.

pub mod memory;

pub use memory::MemoryStore;

use crate::model::{BlocklistEntry, ThreatRecord, ThreatType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Default page size for listings.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page size a listing will return.
pub const MAX_PAGE_SIZE: usize = 500;

/// Error from the blocklist store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend cannot serve requests.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A row violated an entry invariant.
    #[error("invalid entry for {ip}: {reason}")]
    InvalidEntry { ip: IpAddr, reason: String },
    /// Snapshot file could not be read or written.
    #[error("persistence error: {0}")]
    Io(#[from] std::io::Error),
    /// Snapshot file could not be encoded or decoded.
    #[error("snapshot format error: {0}")]
    Format(#[from] serde_json::Error),
    /// Rows were applied but a later step failed.
    #[error("{source} (after applying {} created, {} updated)", .outcome.created, .outcome.updated)]
    Partial {
        outcome: UpsertOutcome,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// Counts of rows already applied when the error was raised.
    pub fn applied(&self) -> Option<UpsertOutcome> {
        match self {
            StoreError::Partial { outcome, .. } => Some(*outcome),
            _ => None,
        }
    }
}

/// Result of a bulk upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Column to sort listings by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    LastSeen,
    IpAddress,
    ThreatType,
    Source,
    Confidence,
    TotalReports,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filters, sort and pagination for an administrative listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    /// Case-insensitive substring of the address.
    pub search: Option<String>,
    pub threat_type: Option<ThreatType>,
    pub source: Option<String>,
    pub sort_by: SortField,
    pub order: SortOrder,
    /// 1-based page number.
    pub page: usize,
    pub limit: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            search: None,
            threat_type: None,
            source: None,
            sort_by: SortField::default(),
            order: SortOrder::default(),
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ListQuery {
    /// Page and limit clamped to valid values.
    pub fn bounds(&self) -> (usize, usize) {
        (self.page.max(1), self.limit.clamp(1, MAX_PAGE_SIZE))
    }

    /// Whether an entry passes the filters.
    pub fn matches(&self, entry: &BlocklistEntry) -> bool {
        if let Some(ref search) = self.search {
            let needle = search.to_ascii_lowercase();
            if !entry.ip_address.to_string().to_ascii_lowercase().contains(&needle) {
                return false;
            }
        }
        if let Some(threat_type) = self.threat_type {
            if entry.threat_type != threat_type {
                return false;
            }
        }
        if let Some(ref source) = self.source {
            if &entry.source != source {
                return false;
            }
        }
        true
    }

    /// Order two entries by the requested field, ties broken by address.
    pub fn compare(&self, a: &BlocklistEntry, b: &BlocklistEntry) -> std::cmp::Ordering {
        let ordering = match self.sort_by {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortField::LastSeen => a.last_seen.cmp(&b.last_seen),
            SortField::IpAddress => a.ip_address.cmp(&b.ip_address),
            SortField::ThreatType => a.threat_type.as_str().cmp(b.threat_type.as_str()),
            SortField::Source => a.source.cmp(&b.source),
            SortField::Confidence => a.confidence.cmp(&b.confidence),
            SortField::TotalReports => a.total_reports.cmp(&b.total_reports),
        }
        .then_with(|| a.ip_address.cmp(&b.ip_address));

        match self.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    /// Build a page from the full, already sorted match set.
    pub fn from_sorted(all: Vec<T>, page: usize, limit: usize) -> Self {
        let total = all.len();
        let items = all
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .collect();

        Self {
            items,
            total,
            page,
            limit,
            total_pages: total.div_ceil(limit),
        }
    }
}

/// Aggregate counts over the blocklist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total: usize,
    pub created_since_day_start: usize,
    pub created_since_week_start: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub by_threat_type: BTreeMap<ThreatType, usize>,
    pub by_source: BTreeMap<String, usize>,
}

/// Storage of blocklist entries, keyed uniquely by address.
///
/// Refresh cycles are the only writers of `upsert_many`; enforcement only
/// calls `lookup`, which must stay a single keyed read.
#[async_trait]
pub trait BlocklistStore: Send + Sync {
    /// Create unseen addresses and update known ones in place.
    ///
    /// Rows applied before a failure stay applied.
    async fn upsert_many(&self, records: Vec<ThreatRecord>) -> Result<UpsertOutcome, StoreError>;

    /// Point lookup by address.
    async fn lookup(&self, ip: &IpAddr) -> Result<Option<BlocklistEntry>, StoreError>;

    /// Filtered, sorted, paginated listing.
    async fn list(&self, query: &ListQuery) -> Result<Page<BlocklistEntry>, StoreError>;

    /// Every entry, newest first.
    async fn export(&self) -> Result<Vec<BlocklistEntry>, StoreError>;

    /// Delete entries. Returns how many existed.
    async fn remove(&self, ips: &[IpAddr]) -> Result<usize, StoreError>;

    /// Aggregate counts; `day_start`/`week_start` bound the creation windows.
    async fn stats(
        &self,
        day_start: DateTime<Utc>,
        week_start: DateTime<Utc>,
    ) -> Result<StoreStats, StoreError>;
}
