//! Administrative control surface.

use crate::enforcement::Enforcer;
use crate::model::BlocklistEntry;
use crate::refresh::CycleOutcome;
use crate::scheduler::{Cadence, Scheduler, SchedulerState, UnknownCadence};
use crate::store::{BlocklistStore, ListQuery, Page, StoreError, StoreStats};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Error returned to administrative callers.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// Rejected before any state changed.
    #[error(transparent)]
    InvalidCadence(#[from] UnknownCadence),
    #[error("unsupported export format '{0}' (expected csv or json)")]
    InvalidFormat(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Export encodings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = AdminError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            _ => Err(AdminError::InvalidFormat(s.to_string())),
        }
    }
}

/// Rendered export body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub format: ExportFormat,
    pub body: String,
}

impl Export {
    pub fn content_type(&self) -> &'static str {
        match self.format {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Json => "application/json",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self.format {
            ExportFormat::Csv => "blocklist.csv",
            ExportFormat::Json => "blocklist.json",
        }
    }
}

/// Partial settings change. Absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    #[serde(alias = "updateFrequency")]
    pub cadence: Option<String>,
    pub enabled: Option<bool>,
    pub notifications_enabled: Option<bool>,
}

/// Current settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    pub cadence: Cadence,
    pub enabled: bool,
    pub notifications_enabled: bool,
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub enabled: bool,
    pub cadence: Cadence,
    pub scheduler_state: SchedulerState,
    pub notifications_enabled: bool,
    pub total_entries: usize,
    pub added_today: usize,
    pub added_this_week: usize,
    pub last_update: Option<DateTime<Utc>>,
    /// Distinct sources present in the blocklist.
    pub sources: Vec<String>,
    /// Registered feed names.
    pub feeds: Vec<String>,
    pub completed_cycles: u64,
    pub skipped_cycles: u64,
    pub last_outcome: Option<CycleOutcome>,
}

/// Start of the current UTC day and the same time seven days earlier.
fn creation_windows(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let day_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now);
    (day_start, day_start - Duration::days(7))
}

fn csv_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Render entries as CSV, one row per entry in the given order.
pub fn render_csv(entries: &[BlocklistEntry]) -> String {
    let mut out =
        String::from("IP Address,Threat Type,Source,Confidence,Country,Last Seen,Total Reports\n");
    for entry in entries {
        out.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            csv_field(&entry.ip_address.to_string()),
            csv_field(entry.threat_type.as_str()),
            csv_field(&entry.source),
            entry.confidence,
            csv_field(entry.country.as_deref().unwrap_or("")),
            csv_field(&entry.last_seen.to_rfc3339()),
            entry.total_reports,
        ));
    }
    out
}

/// Operations behind the admin endpoints.
pub struct AdminService {
    scheduler: Arc<Scheduler>,
    enforcer: Arc<Enforcer>,
    store: Arc<dyn BlocklistStore>,
}

impl AdminService {
    pub fn new(
        scheduler: Arc<Scheduler>,
        enforcer: Arc<Enforcer>,
        store: Arc<dyn BlocklistStore>,
    ) -> Self {
        Self {
            scheduler,
            enforcer,
            store,
        }
    }

    /// Run a cycle now. `None` when one is already running.
    pub async fn trigger_refresh(&self) -> Option<CycleOutcome> {
        info!("Manual blocklist refresh requested");
        self.scheduler.refresher().run_if_idle().await
    }

    pub fn settings(&self) -> SettingsView {
        SettingsView {
            cadence: self.scheduler.cadence(),
            enabled: self.enforcer.is_enabled(),
            notifications_enabled: self.scheduler.refresher().notifications_enabled(),
        }
    }

    /// Apply a settings change.
    ///
    /// Disabling stops the scheduler and lets every request through.
    /// Enabling, or changing the cadence while enabled, restarts the
    /// scheduler with the resulting cadence.
    pub fn update_settings(&self, update: SettingsUpdate) -> Result<SettingsView, AdminError> {
        let cadence = update
            .cadence
            .as_deref()
            .map(Cadence::from_str)
            .transpose()?;

        if let Some(notifications_enabled) = update.notifications_enabled {
            self.scheduler
                .refresher()
                .set_notifications_enabled(notifications_enabled);
        }

        let was_enabled = self.enforcer.is_enabled();
        let enabled = update.enabled.unwrap_or(was_enabled);
        let cadence_changed = cadence.is_some_and(|c| c != self.scheduler.cadence());
        if let Some(cadence) = cadence {
            self.scheduler.set_cadence(cadence);
        }

        self.enforcer.set_enabled(enabled);
        if !enabled {
            self.scheduler.stop();
        } else if !was_enabled || cadence_changed {
            self.scheduler.reconfigure(self.scheduler.cadence());
        }

        let view = self.settings();
        info!(
            cadence = %view.cadence,
            enabled = view.enabled,
            notifications_enabled = view.notifications_enabled,
            "Threat blocker settings updated"
        );
        Ok(view)
    }

    pub async fn stats(&self) -> Result<StoreStats, AdminError> {
        let (day_start, week_start) = creation_windows(Utc::now());
        Ok(self.store.stats(day_start, week_start).await?)
    }

    pub async fn status(&self) -> Result<StatusReport, AdminError> {
        let stats = self.stats().await?;
        let refresher = self.scheduler.refresher();

        Ok(StatusReport {
            enabled: self.enforcer.is_enabled(),
            cadence: self.scheduler.cadence(),
            scheduler_state: self.scheduler.state(),
            notifications_enabled: refresher.notifications_enabled(),
            total_entries: stats.total,
            added_today: stats.created_since_day_start,
            added_this_week: stats.created_since_week_start,
            last_update: stats.last_update,
            sources: stats.by_source.into_keys().collect(),
            feeds: refresher.source_names(),
            completed_cycles: refresher.completed_cycles(),
            skipped_cycles: refresher.skipped_cycles(),
            last_outcome: refresher.last_outcome(),
        })
    }

    pub async fn list(&self, query: &ListQuery) -> Result<Page<BlocklistEntry>, AdminError> {
        Ok(self.store.list(query).await?)
    }

    /// Every entry, newest first.
    pub async fn export(&self, format: ExportFormat) -> Result<Export, AdminError> {
        let entries = self.store.export().await?;
        let body = match format {
            ExportFormat::Csv => render_csv(&entries),
            ExportFormat::Json => serde_json::to_string(&entries).map_err(StoreError::from)?,
        };
        Ok(Export { format, body })
    }

    pub async fn remove(&self, ips: &[IpAddr]) -> Result<usize, AdminError> {
        let removed = self.store.remove(ips).await?;
        info!(requested = ips.len(), removed, "Removed blocklist entries");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::{EnforcementConfig, IpExtractionConfig};
    use crate::model::fixtures::record;
    use crate::model::ThreatType;
    use crate::refresh::Refresher;
    use crate::store::MemoryStore;

    async fn service() -> (AdminService, Arc<Scheduler>) {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_many(vec![
                record("203.0.113.9", ThreatType::Botnet, 80, "AbuseIPDB"),
                record("198.51.100.4", ThreatType::Spam, 75, "Blocklist.de"),
            ])
            .await
            .unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let refresher = Arc::new(Refresher::new(Vec::new(), store.clone(), audit.clone()));
        let scheduler = Arc::new(Scheduler::new(refresher, Cadence::Daily));
        let enforcer = Arc::new(Enforcer::new(
            store.clone(),
            audit,
            IpExtractionConfig::default(),
            EnforcementConfig::default(),
        ));
        (
            AdminService::new(scheduler.clone(), enforcer, store),
            scheduler,
        )
    }

    #[test]
    fn test_creation_windows() {
        let now: DateTime<Utc> = "2025-03-10T15:30:00Z".parse().unwrap();
        let (day, week) = creation_windows(now);
        assert_eq!(day.to_rfc3339(), "2025-03-10T00:00:00+00:00");
        assert_eq!(week.to_rfc3339(), "2025-03-03T00:00:00+00:00");
    }

    #[test]
    fn test_export_format_parse() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!(matches!(
            "xml".parse::<ExportFormat>(),
            Err(AdminError::InvalidFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_cadence_changes_nothing() {
        let (admin, scheduler) = service().await;
        let result = admin.update_settings(SettingsUpdate {
            cadence: Some("weekly".to_string()),
            enabled: Some(false),
            notifications_enabled: Some(false),
        });

        assert!(matches!(result, Err(AdminError::InvalidCadence(_))));
        let view = admin.settings();
        assert_eq!(view.cadence, Cadence::Daily);
        assert!(view.enabled);
        assert!(view.notifications_enabled);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_disable_and_enable() {
        let (admin, scheduler) = service().await;
        scheduler.start(Cadence::Daily);

        let view = admin
            .update_settings(SettingsUpdate {
                enabled: Some(false),
                ..SettingsUpdate::default()
            })
            .unwrap();
        assert!(!view.enabled);
        assert!(!scheduler.is_started());

        let view = admin
            .update_settings(SettingsUpdate {
                cadence: Some("hourly".to_string()),
                enabled: Some(true),
                ..SettingsUpdate::default()
            })
            .unwrap();
        assert!(view.enabled);
        assert_eq!(view.cadence, Cadence::Hourly);
        assert!(scheduler.is_started());
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_status_counts() {
        let (admin, _) = service().await;
        let status = admin.status().await.unwrap();

        assert_eq!(status.total_entries, 2);
        assert_eq!(status.added_today, 2);
        assert_eq!(status.added_this_week, 2);
        assert_eq!(status.sources, vec!["AbuseIPDB", "Blocklist.de"]);
        assert_eq!(status.scheduler_state, SchedulerState::Stopped);
        assert!(status.last_outcome.is_none());
    }

    #[tokio::test]
    async fn test_csv_export() {
        let (admin, _) = service().await;
        let export = admin.export(ExportFormat::Csv).await.unwrap();

        let mut lines = export.body.lines();
        assert_eq!(
            lines.next(),
            Some("IP Address,Threat Type,Source,Confidence,Country,Last Seen,Total Reports")
        );
        assert_eq!(export.body.lines().count(), 3);
        assert!(export.body.contains("\"203.0.113.9\",\"Botnet\",\"AbuseIPDB\",80,"));
        assert_eq!(export.content_type(), "text/csv");
    }

    #[test]
    fn test_render_csv_quotes_fields() {
        let mut rec = record("203.0.113.9", ThreatType::Botnet, 80, "feed \"a\", b");
        rec.country = Some("NL".to_string());
        rec.total_reports = 3;
        let entry = BlocklistEntry::from_record(rec, Utc::now());

        let csv = render_csv(&[entry]);
        let row = csv.lines().nth(1).unwrap();
        assert_eq!(
            row,
            "\"203.0.113.9\",\"Botnet\",\"feed \"\"a\"\", b\",80,\"NL\",\"2025-01-01T00:00:00+00:00\",3"
        );
        assert!(csv.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_remove() {
        let (admin, _) = service().await;
        let removed = admin
            .remove(&["203.0.113.9".parse().unwrap(), "192.0.2.1".parse().unwrap()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(admin.status().await.unwrap().total_entries, 1);
    }
}
