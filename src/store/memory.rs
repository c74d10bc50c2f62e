//! In-process blocklist store with optional JSON snapshot persistence.

use super::{BlocklistStore, ListQuery, Page, StoreError, StoreStats, UpsertOutcome};
use crate::model::{BlocklistEntry, ThreatRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Blocklist held in a hash map keyed by canonical address.
///
/// Each row is written under its own short write lock, so lookups interleave
/// with a bulk upsert and never see a half-applied row. When a snapshot path
/// is set the whole table is rewritten atomically after every mutation.
pub struct MemoryStore {
    entries: RwLock<HashMap<IpAddr, BlocklistEntry>>,
    snapshot_path: Option<PathBuf>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty, memory-only store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            snapshot_path: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open a store backed by a snapshot file, loading it if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut entries = HashMap::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let loaded: Vec<BlocklistEntry> = serde_json::from_str(&content)?;
            for mut entry in loaded {
                entry.ip_address = entry.ip_address.to_canonical();
                entries.insert(entry.ip_address, entry);
            }
            info!(path = %path.display(), entries = entries.len(), "Blocklist snapshot loaded");
        }

        Ok(Self {
            entries: RwLock::new(entries),
            snapshot_path: Some(path),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn upsert_one(&self, mut record: ThreatRecord, now: DateTime<Utc>) -> Result<bool, StoreError> {
        if record.confidence > 100 {
            return Err(StoreError::InvalidEntry {
                ip: record.ip_address,
                reason: format!("confidence {} out of range", record.confidence),
            });
        }
        record.ip_address = record.ip_address.to_canonical();

        let mut entries = self.entries.write();
        match entries.get_mut(&record.ip_address) {
            Some(existing) => {
                existing.apply(record, now);
                Ok(false)
            }
            None => {
                entries.insert(record.ip_address, BlocklistEntry::from_record(record, now));
                Ok(true)
            }
        }
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(());
        };

        let _guard = self.persist_lock.lock().await;
        let snapshot: Vec<BlocklistEntry> = self.entries.read().values().cloned().collect();
        let data = serde_json::to_vec(&snapshot)?;

        tokio::task::spawn_blocking(move || write_atomic(&path, &data))
            .await
            .map_err(|e| StoreError::Unavailable(format!("snapshot writer failed: {}", e)))??;

        debug!(entries = snapshot.len(), "Blocklist snapshot written");
        Ok(())
    }
}

/// Write to a temp file next to `path`, then rename over it.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, data)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[async_trait]
impl BlocklistStore for MemoryStore {
    async fn upsert_many(&self, records: Vec<ThreatRecord>) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut outcome = UpsertOutcome::default();

        for record in records {
            match self.upsert_one(record, now) {
                Ok(true) => outcome.created += 1,
                Ok(false) => outcome.updated += 1,
                Err(e) => {
                    debug!(error = %e, "Rejected blocklist row");
                    outcome.failed += 1;
                }
            }
        }

        if let Err(e) = self.persist().await {
            return Err(StoreError::Partial {
                outcome,
                source: Box::new(e),
            });
        }
        Ok(outcome)
    }

    async fn lookup(&self, ip: &IpAddr) -> Result<Option<BlocklistEntry>, StoreError> {
        Ok(self.entries.read().get(&ip.to_canonical()).cloned())
    }

    async fn list(&self, query: &ListQuery) -> Result<Page<BlocklistEntry>, StoreError> {
        let (page, limit) = query.bounds();
        let mut matched: Vec<BlocklistEntry> = self
            .entries
            .read()
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| query.compare(a, b));

        Ok(Page::from_sorted(matched, page, limit))
    }

    async fn export(&self) -> Result<Vec<BlocklistEntry>, StoreError> {
        let mut all: Vec<BlocklistEntry> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| ListQuery::default().compare(a, b));
        Ok(all)
    }

    async fn remove(&self, ips: &[IpAddr]) -> Result<usize, StoreError> {
        let removed = {
            let mut entries = self.entries.write();
            ips.iter()
                .filter(|ip| entries.remove(&ip.to_canonical()).is_some())
                .count()
        };

        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn stats(
        &self,
        day_start: DateTime<Utc>,
        week_start: DateTime<Utc>,
    ) -> Result<StoreStats, StoreError> {
        let entries = self.entries.read();
        let mut stats = StoreStats {
            total: entries.len(),
            ..StoreStats::default()
        };

        for entry in entries.values() {
            if entry.created_at >= day_start {
                stats.created_since_day_start += 1;
            }
            if entry.created_at >= week_start {
                stats.created_since_week_start += 1;
            }
            if stats.last_update.map_or(true, |t| entry.updated_at > t) {
                stats.last_update = Some(entry.updated_at);
            }
            *stats.by_threat_type.entry(entry.threat_type).or_default() += 1;
            *stats.by_source.entry(entry.source.clone()).or_default() += 1;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::record;
    use crate::model::ThreatType;
    use crate::store::{SortField, SortOrder};

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let store = MemoryStore::new();

        let outcome = store
            .upsert_many(vec![
                record("203.0.113.9", ThreatType::Botnet, 80, "AbuseIPDB"),
                record("198.51.100.7", ThreatType::Spam, 75, "spam"),
            ])
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome { created: 2, updated: 0, failed: 0 });

        let before = store.lookup(&"203.0.113.9".parse().unwrap()).await.unwrap().unwrap();

        let outcome = store
            .upsert_many(vec![record("203.0.113.9", ThreatType::MalwareC2, 95, "AbuseIPDB")])
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome { created: 0, updated: 1, failed: 0 });
        assert_eq!(store.len(), 2);

        let after = store.lookup(&"203.0.113.9".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(after.threat_type, ThreatType::MalwareC2);
        assert_eq!(after.confidence, 95);
        assert_eq!(after.created_at, before.created_at);
    }

    #[tokio::test]
    async fn test_upsert_rejects_out_of_range_confidence() {
        let store = MemoryStore::new();
        let outcome = store
            .upsert_many(vec![
                record("203.0.113.9", ThreatType::Botnet, 101, "x"),
                record("203.0.113.10", ThreatType::Botnet, 80, "x"),
            ])
            .await
            .unwrap();

        assert_eq!(outcome, UpsertOutcome { created: 1, updated: 0, failed: 1 });
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_folds_mapped_ipv4() {
        let store = MemoryStore::new();
        store
            .upsert_many(vec![record("203.0.113.9", ThreatType::Botnet, 80, "x")])
            .await
            .unwrap();

        let mapped: IpAddr = "::ffff:203.0.113.9".parse().unwrap();
        assert!(store.lookup(&mapped).await.unwrap().is_some());
        assert!(store.lookup(&"203.0.113.10".parse().unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_and_sorts() {
        let store = MemoryStore::new();
        store
            .upsert_many(vec![
                record("203.0.113.9", ThreatType::Botnet, 80, "AbuseIPDB"),
                record("203.0.113.10", ThreatType::Spam, 75, "spam"),
                record("198.51.100.7", ThreatType::Botnet, 90, "AbuseIPDB"),
            ])
            .await
            .unwrap();

        let query = ListQuery {
            threat_type: Some(ThreatType::Botnet),
            sort_by: SortField::Confidence,
            order: SortOrder::Desc,
            ..ListQuery::default()
        };
        let page = store.list(&query).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].ip_address.to_string(), "198.51.100.7");

        let query = ListQuery {
            search: Some("203.0.113".to_string()),
            source: Some("spam".to_string()),
            ..ListQuery::default()
        };
        let page = store.list(&query).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].ip_address.to_string(), "203.0.113.10");

        let query = ListQuery {
            sort_by: SortField::IpAddress,
            order: SortOrder::Asc,
            limit: 2,
            page: 2,
            ..ListQuery::default()
        };
        let page = store.list(&query).await.unwrap();
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].ip_address.to_string(), "203.0.113.10");
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryStore::new();
        store
            .upsert_many(vec![record("203.0.113.9", ThreatType::Botnet, 80, "x")])
            .await
            .unwrap();

        let removed = store
            .remove(&["203.0.113.9".parse().unwrap(), "203.0.113.10".parse().unwrap()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = MemoryStore::new();
        store
            .upsert_many(vec![
                record("203.0.113.9", ThreatType::Botnet, 80, "AbuseIPDB"),
                record("203.0.113.10", ThreatType::Botnet, 75, "AbuseIPDB"),
                record("198.51.100.7", ThreatType::Spam, 75, "spam"),
            ])
            .await
            .unwrap();

        let now = Utc::now();
        let stats = store
            .stats(now - chrono::Duration::hours(1), now - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.created_since_day_start, 3);
        assert_eq!(stats.by_threat_type[&ThreatType::Botnet], 2);
        assert_eq!(stats.by_source["spam"], 1);
        assert!(stats.last_update.is_some());

        let later = now + chrono::Duration::hours(1);
        let stats = store.stats(later, later).await.unwrap();
        assert_eq!(stats.created_since_week_start, 0);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("blocklist.json");

        let store = MemoryStore::open(&path).unwrap();
        store
            .upsert_many(vec![record("203.0.113.9", ThreatType::Botnet, 80, "x")])
            .await
            .unwrap();
        assert!(path.exists());

        let reopened = MemoryStore::open(&path).unwrap();
        let entry = reopened.lookup(&"203.0.113.9".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(entry.threat_type, ThreatType::Botnet);
        assert_eq!(entry.confidence, 80);
    }

    #[tokio::test]
    async fn test_failed_snapshot_keeps_applied_counts() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().join("blocklist.json");

        let store = MemoryStore::open(&path).unwrap();
        let err = store
            .upsert_many(vec![
                record("203.0.113.9", ThreatType::Botnet, 80, "x"),
                record("203.0.113.10", ThreatType::Spam, 75, "x"),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Partial { .. }));
        assert_eq!(
            err.applied(),
            Some(UpsertOutcome { created: 2, updated: 0, failed: 0 })
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_open_rejects_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklist.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(MemoryStore::open(&path), Err(StoreError::Format(_))));
    }
}
