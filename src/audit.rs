//! Side-effect records written for external collaborators.
//!
//! The core only appends to these; nothing here is ever read back by the
//! enforcement or refresh paths.

use crate::model::{BlocklistEntry, Severity, ThreatCategory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::IpAddr;
use tracing::info;

/// Activity log event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActivityEvent {
    #[serde(rename = "Blocked Threat")]
    BlockedThreat,
    #[serde(rename = "Blocklist Update")]
    BlocklistUpdate,
}

/// Outcome recorded on an activity entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActivityStatus {
    Blocked,
    Success,
    #[serde(rename = "Partial Success")]
    PartialSuccess,
    Failed,
}

/// One audit/activity trail entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLogEntry {
    pub event_type: ActivityEvent,
    pub description: String,
    pub status: ActivityStatus,
    pub severity: Severity,
    pub source_ip: Option<IpAddr>,
    pub user_id: Option<String>,
    /// Key of the matched blocklist entry.
    pub blocklist_ip: Option<IpAddr>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ActivityLogEntry {
    /// Entry for a denied request.
    pub fn blocked(entry: &BlocklistEntry, source_ip: IpAddr, user_id: Option<String>) -> Self {
        Self {
            event_type: ActivityEvent::BlockedThreat,
            description: format!(
                "Blocked request from threat IP: {} ({})",
                source_ip, entry.threat_type
            ),
            status: ActivityStatus::Blocked,
            severity: Severity::Critical,
            source_ip: Some(source_ip),
            user_id,
            blocklist_ip: Some(entry.ip_address),
            metadata: serde_json::json!({
                "threatType": entry.threat_type,
                "source": entry.source,
                "confidence": entry.confidence,
            }),
            created_at: Utc::now(),
        }
    }
}

/// Per-user threat record used by reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatReport {
    pub category: ThreatCategory,
    pub source_ip: IpAddr,
    pub description: String,
    pub severity: Severity,
    pub blocked: bool,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl ThreatReport {
    /// Report for a principal whose request matched `entry`.
    pub fn blocked(entry: &BlocklistEntry, source_ip: IpAddr, user_id: String) -> Self {
        Self {
            category: entry.threat_type.category(),
            source_ip,
            description: format!(
                "Blocked threat IP: {} ({}) from {}",
                source_ip, entry.threat_type, entry.source
            ),
            severity: Severity::from_confidence(entry.confidence),
            blocked: true,
            user_id,
            created_at: Utc::now(),
        }
    }
}

/// Informational notice for administrators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub event_type: String,
    pub severity: Severity,
}

/// Error from an audit sink.
#[derive(Debug, thiserror::Error)]
#[error("audit sink error: {0}")]
pub struct AuditError(pub String);

/// Destination for side-effect records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_activity(&self, entry: ActivityLogEntry) -> Result<(), AuditError>;

    async fn record_threat(&self, report: ThreatReport) -> Result<(), AuditError>;

    async fn notify(&self, notification: Notification) -> Result<(), AuditError>;
}

/// Sink that emits records as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record_activity(&self, entry: ActivityLogEntry) -> Result<(), AuditError> {
        info!(
            target: "threat_blocker::audit",
            event = ?entry.event_type,
            status = ?entry.status,
            severity = ?entry.severity,
            source_ip = ?entry.source_ip,
            user_id = ?entry.user_id,
            "{}",
            entry.description
        );
        Ok(())
    }

    async fn record_threat(&self, report: ThreatReport) -> Result<(), AuditError> {
        info!(
            target: "threat_blocker::audit",
            category = ?report.category,
            severity = ?report.severity,
            source_ip = %report.source_ip,
            user_id = %report.user_id,
            "{}",
            report.description
        );
        Ok(())
    }

    async fn notify(&self, notification: Notification) -> Result<(), AuditError> {
        info!(
            target: "threat_blocker::audit",
            event = %notification.event_type,
            title = %notification.title,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// Sink that keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    activities: Mutex<Vec<ActivityLogEntry>>,
    threats: Mutex<Vec<ThreatReport>>,
    notifications: Mutex<Vec<Notification>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activities(&self) -> Vec<ActivityLogEntry> {
        self.activities.lock().clone()
    }

    pub fn threats(&self) -> Vec<ThreatReport> {
        self.threats.lock().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record_activity(&self, entry: ActivityLogEntry) -> Result<(), AuditError> {
        self.activities.lock().push(entry);
        Ok(())
    }

    async fn record_threat(&self, report: ThreatReport) -> Result<(), AuditError> {
        self.threats.lock().push(report);
        Ok(())
    }

    async fn notify(&self, notification: Notification) -> Result<(), AuditError> {
        self.notifications.lock().push(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::record;
    use crate::model::ThreatType;

    fn entry(confidence: u8) -> BlocklistEntry {
        BlocklistEntry::from_record(
            record("203.0.113.9", ThreatType::Botnet, confidence, "AbuseIPDB"),
            Utc::now(),
        )
    }

    #[test]
    fn test_blocked_activity_entry() {
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let activity = ActivityLogEntry::blocked(&entry(80), ip, None);

        assert_eq!(activity.event_type, ActivityEvent::BlockedThreat);
        assert_eq!(activity.status, ActivityStatus::Blocked);
        assert_eq!(activity.blocklist_ip, Some(ip));
        assert_eq!(activity.metadata["threatType"], "Botnet");
        assert!(activity.description.contains("203.0.113.9 (Botnet)"));
    }

    #[test]
    fn test_threat_report_severity() {
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        assert_eq!(
            ThreatReport::blocked(&entry(95), ip, "u1".into()).severity,
            Severity::Critical
        );
        assert_eq!(
            ThreatReport::blocked(&entry(60), ip, "u1".into()).severity,
            Severity::Medium
        );
        assert_eq!(
            ThreatReport::blocked(&entry(60), ip, "u1".into()).category,
            ThreatCategory::Malware
        );
    }

    #[tokio::test]
    async fn test_memory_sink_collects() {
        let sink = MemoryAuditSink::new();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        sink.record_activity(ActivityLogEntry::blocked(&entry(80), ip, None))
            .await
            .unwrap();
        sink.record_threat(ThreatReport::blocked(&entry(80), ip, "u1".into()))
            .await
            .unwrap();

        assert_eq!(sink.activities().len(), 1);
        assert_eq!(sink.threats().len(), 1);
        assert!(sink.notifications().is_empty());
    }
}
