//! One fetch → normalize → merge → store pass, guarded to run one at a time.

use crate::audit::{
    ActivityEvent, ActivityLogEntry, ActivityStatus, AuditError, AuditSink, Notification,
};
use crate::classify::normalize_all;
use crate::feeds::{FeedError, FeedFetcher, RawThreatRecord};
use crate::merge::{merge, SourceBatch};
use crate::model::Severity;
use crate::store::{BlocklistStore, UpsertOutcome};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Longest a cycle waits on one audit write before moving on.
pub const AUDIT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-source result of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceOutcome {
    pub name: String,
    /// Records returned by the fetcher.
    pub fetched: usize,
    /// Records that survived normalization.
    pub accepted: usize,
    pub error: Option<String>,
}

/// Result of one refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleOutcome {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceOutcome>,
    /// Distinct addresses after merging.
    pub merged: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub store_error: Option<String>,
}

impl CycleOutcome {
    /// Overall status for the activity trail.
    pub fn status(&self) -> ActivityStatus {
        let source_errors = self.sources.iter().filter(|s| s.error.is_some()).count();
        if self.store_error.is_some()
            || (!self.sources.is_empty() && source_errors == self.sources.len())
        {
            ActivityStatus::Failed
        } else if source_errors > 0 || self.failed > 0 {
            ActivityStatus::PartialSuccess
        } else {
            ActivityStatus::Success
        }
    }

    fn describe(&self) -> String {
        let mut description = format!(
            "Blocklist updated: {} new IPs added, {} IPs updated",
            self.created, self.updated
        );
        if self.failed > 0 {
            description.push_str(&format!(", {} rows failed", self.failed));
        }
        for source in &self.sources {
            if let Some(ref error) = source.error {
                description.push_str(&format!("; {} failed: {}", source.name, error));
            }
        }
        if let Some(ref error) = self.store_error {
            description.push_str(&format!("; store failed: {}", error));
        }
        description
    }
}

/// Runs refresh cycles against a fixed set of fetchers.
pub struct Refresher {
    fetchers: Vec<Arc<dyn FeedFetcher>>,
    store: Arc<dyn BlocklistStore>,
    audit: Arc<dyn AuditSink>,
    notifications_enabled: AtomicBool,
    notify_threshold: usize,
    running: AtomicBool,
    completed: AtomicU64,
    skipped: AtomicU64,
    last_outcome: RwLock<Option<CycleOutcome>>,
}

/// Clears the running flag when a cycle ends, including on panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Refresher {
    pub fn new(
        fetchers: Vec<Arc<dyn FeedFetcher>>,
        store: Arc<dyn BlocklistStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            fetchers,
            store,
            audit,
            notifications_enabled: AtomicBool::new(true),
            notify_threshold: 100,
            running: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            last_outcome: RwLock::new(None),
        }
    }

    /// Notify when a cycle creates more than `threshold` entries.
    pub fn with_notify_threshold(mut self, threshold: usize) -> Self {
        self.notify_threshold = threshold;
        self
    }

    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.notifications_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifications_enabled.load(Ordering::Relaxed)
    }

    /// Whether a cycle is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of cycles that ran to completion.
    pub fn completed_cycles(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Number of requests that found a cycle already running.
    pub fn skipped_cycles(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Outcome of the most recent completed cycle.
    pub fn last_outcome(&self) -> Option<CycleOutcome> {
        self.last_outcome.read().clone()
    }

    /// Names of the registered sources.
    pub fn source_names(&self) -> Vec<String> {
        self.fetchers.iter().map(|f| f.name().to_string()).collect()
    }

    /// Run a cycle unless one is already running.
    ///
    /// Returns `None` when skipped; there is no queueing.
    pub async fn run_if_idle(&self) -> Option<CycleOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Refresh cycle already running, skipping");
            return None;
        }
        let _guard = RunningGuard(&self.running);

        let outcome = self.run_cycle().await;
        *self.last_outcome.write() = Some(outcome.clone());
        self.completed.fetch_add(1, Ordering::Relaxed);
        Some(outcome)
    }

    async fn fetch_all(&self) -> Vec<(Arc<dyn FeedFetcher>, Result<Vec<RawThreatRecord>, FeedError>)> {
        let enabled: Vec<Arc<dyn FeedFetcher>> = self
            .fetchers
            .iter()
            .filter(|f| f.is_enabled())
            .cloned()
            .collect();

        let mut tasks = JoinSet::new();
        for (index, fetcher) in enabled.iter().enumerate() {
            let fetcher = Arc::clone(fetcher);
            tasks.spawn(async move {
                let result = match tokio::time::timeout(fetcher.timeout(), fetcher.fetch()).await {
                    Ok(result) => result,
                    Err(_) => Err(FeedError::Timeout),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<Vec<RawThreatRecord>, FeedError>>> =
            enabled.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!(error = %e, "Feed fetch task failed"),
            }
        }

        enabled
            .into_iter()
            .zip(results)
            .map(|(fetcher, result)| {
                let result = result
                    .unwrap_or_else(|| Err(FeedError::Other("fetch task aborted".to_string())));
                (fetcher, result)
            })
            .collect()
    }

    async fn run_cycle(&self) -> CycleOutcome {
        let started_at = Utc::now();
        info!(sources = self.fetchers.len(), "Starting blocklist refresh");

        let mut sources = Vec::new();
        let mut batches = Vec::new();
        for (fetcher, result) in self.fetch_all().await {
            match result {
                Ok(raw) => {
                    let fetched = raw.len();
                    let records = normalize_all(raw, started_at);
                    debug!(
                        source = %fetcher.name(),
                        fetched,
                        accepted = records.len(),
                        "Source fetched"
                    );
                    sources.push(SourceOutcome {
                        name: fetcher.name().to_string(),
                        fetched,
                        accepted: records.len(),
                        error: None,
                    });
                    batches.push(SourceBatch::new(fetcher.kind(), records));
                }
                Err(e) => {
                    warn!(source = %fetcher.name(), error = %e, "Source fetch failed");
                    sources.push(SourceOutcome {
                        name: fetcher.name().to_string(),
                        fetched: 0,
                        accepted: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let merged = merge(batches);
        let merged_count = merged.len();

        let (upsert, store_error) = if merged.is_empty() {
            (UpsertOutcome::default(), None)
        } else {
            match self.store.upsert_many(merged).await {
                Ok(upsert) => (upsert, None),
                Err(e) => {
                    warn!(error = %e, "Blocklist upsert failed");
                    (e.applied().unwrap_or_default(), Some(e.to_string()))
                }
            }
        };

        let outcome = CycleOutcome {
            started_at,
            finished_at: Utc::now(),
            sources,
            merged: merged_count,
            created: upsert.created,
            updated: upsert.updated,
            failed: upsert.failed,
            store_error,
        };

        info!(
            created = outcome.created,
            updated = outcome.updated,
            failed = outcome.failed,
            merged = outcome.merged,
            status = ?outcome.status(),
            "Blocklist refresh completed"
        );

        self.record_side_effects(&outcome).await;
        outcome
    }

    async fn record_side_effects(&self, outcome: &CycleOutcome) {
        let status = outcome.status();
        let activity = ActivityLogEntry {
            event_type: ActivityEvent::BlocklistUpdate,
            description: outcome.describe(),
            status,
            severity: if status == ActivityStatus::Failed {
                Severity::Critical
            } else {
                Severity::Info
            },
            source_ip: None,
            user_id: None,
            blocklist_ip: None,
            metadata: serde_json::json!({
                "addedCount": outcome.created,
                "updatedCount": outcome.updated,
                "errorCount": outcome.failed,
                "totalFetched": outcome.sources.iter().map(|s| s.fetched).sum::<usize>(),
            }),
            created_at: outcome.finished_at,
        };
        bounded_write("refresh activity", self.audit.record_activity(activity)).await;

        if self.notifications_enabled() && outcome.created > self.notify_threshold {
            let notification = Notification {
                title: "Blocklist Updated Automatically".to_string(),
                message: format!("{} new threats added to blocklist", outcome.created),
                event_type: "blocklist_updated".to_string(),
                severity: Severity::Info,
            };
            bounded_write("refresh notification", self.audit.notify(notification)).await;
        }
    }
}

/// Await an audit write for at most `AUDIT_WRITE_TIMEOUT`; failures are logged.
async fn bounded_write(what: &str, write: impl Future<Output = Result<(), AuditError>>) {
    match tokio::time::timeout(AUDIT_WRITE_TIMEOUT, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to record {}", what),
        Err(_) => warn!("Timed out recording {}", what),
    }
}
