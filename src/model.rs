//! Core data types shared by the ingestion and enforcement paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Classification of a blocklisted address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThreatType {
    #[serde(rename = "Malware C&C")]
    MalwareC2,
    #[serde(rename = "Botnet")]
    Botnet,
    #[serde(rename = "Brute Force")]
    BruteForce,
    #[serde(rename = "Malware Host")]
    MalwareHost,
    #[serde(rename = "Phishing")]
    Phishing,
    #[serde(rename = "DDoS")]
    DDoS,
    #[serde(rename = "Spam")]
    Spam,
    #[serde(rename = "Exploit")]
    Exploit,
    #[serde(rename = "Suspicious")]
    Suspicious,
    #[serde(rename = "Other")]
    Other,
}

impl ThreatType {
    pub const ALL: [ThreatType; 10] = [
        ThreatType::MalwareC2,
        ThreatType::Botnet,
        ThreatType::BruteForce,
        ThreatType::MalwareHost,
        ThreatType::Phishing,
        ThreatType::DDoS,
        ThreatType::Spam,
        ThreatType::Exploit,
        ThreatType::Suspicious,
        ThreatType::Other,
    ];

    /// Human-readable name, also used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatType::MalwareC2 => "Malware C&C",
            ThreatType::Botnet => "Botnet",
            ThreatType::BruteForce => "Brute Force",
            ThreatType::MalwareHost => "Malware Host",
            ThreatType::Phishing => "Phishing",
            ThreatType::DDoS => "DDoS",
            ThreatType::Spam => "Spam",
            ThreatType::Exploit => "Exploit",
            ThreatType::Suspicious => "Suspicious",
            ThreatType::Other => "Other",
        }
    }

    /// `Suspicious` and `Other` carry no real classification.
    pub fn is_generic(&self) -> bool {
        matches!(self, ThreatType::Suspicious | ThreatType::Other)
    }

    /// Category used by per-user threat reporting.
    pub fn category(&self) -> ThreatCategory {
        match self {
            ThreatType::MalwareC2 | ThreatType::Botnet | ThreatType::MalwareHost => {
                ThreatCategory::Malware
            }
            ThreatType::BruteForce | ThreatType::Exploit => ThreatCategory::Intrusion,
            ThreatType::Phishing => ThreatCategory::Phishing,
            ThreatType::DDoS => ThreatCategory::Ddos,
            ThreatType::Spam | ThreatType::Suspicious => ThreatCategory::Suspicious,
            ThreatType::Other => ThreatCategory::Other,
        }
    }
}

impl fmt::Display for ThreatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown threat type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown threat type: {0}")]
pub struct UnknownThreatType(pub String);

impl FromStr for ThreatType {
    type Err = UnknownThreatType;

    /// Accepts the display name or a compact form (`malware_c2`, `brute-force`, `ddos`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        let threat = match key.as_str() {
            "malwarecc" | "malwarec2" => ThreatType::MalwareC2,
            "botnet" => ThreatType::Botnet,
            "bruteforce" => ThreatType::BruteForce,
            "malwarehost" => ThreatType::MalwareHost,
            "phishing" => ThreatType::Phishing,
            "ddos" => ThreatType::DDoS,
            "spam" => ThreatType::Spam,
            "exploit" => ThreatType::Exploit,
            "suspicious" => ThreatType::Suspicious,
            "other" => ThreatType::Other,
            _ => return Err(UnknownThreatType(s.to_string())),
        };
        Ok(threat)
    }
}

/// Threat category recorded for a user's reporting view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatCategory {
    Malware,
    Intrusion,
    Phishing,
    Ddos,
    Suspicious,
    Other,
}

/// Severity attached to activity and threat records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity of a blocklist match, derived from its confidence.
    pub fn from_confidence(confidence: u8) -> Self {
        match confidence {
            90.. => Severity::Critical,
            75..=89 => Severity::High,
            50..=74 => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

/// A normalized record produced from one feed sighting.
///
/// The address is already validated and canonical; confidence is 0-100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatRecord {
    pub ip_address: IpAddr,
    pub threat_type: ThreatType,
    pub source: String,
    pub confidence: u8,
    pub country: Option<String>,
    pub isp: Option<String>,
    pub domain: Option<String>,
    pub usage_type: Option<String>,
    pub hostnames: Vec<String>,
    pub total_reports: u32,
    pub num_distinct_users: u32,
    pub last_seen: DateTime<Utc>,
}

/// The durable record of a known-bad address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlocklistEntry {
    pub ip_address: IpAddr,
    pub threat_type: ThreatType,
    pub source: String,
    pub confidence: u8,
    pub country: Option<String>,
    pub isp: Option<String>,
    pub domain: Option<String>,
    pub usage_type: Option<String>,
    #[serde(default)]
    pub hostnames: Vec<String>,
    pub total_reports: u32,
    pub num_distinct_users: u32,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlocklistEntry {
    /// Create an entry from a first sighting.
    pub fn from_record(record: ThreatRecord, now: DateTime<Utc>) -> Self {
        Self {
            ip_address: record.ip_address,
            threat_type: record.threat_type,
            source: record.source,
            confidence: record.confidence,
            country: record.country,
            isp: record.isp,
            domain: record.domain,
            usage_type: record.usage_type,
            hostnames: record.hostnames,
            total_reports: record.total_reports,
            num_distinct_users: record.num_distinct_users,
            last_seen: record.last_seen,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite every mutable field from a later sighting.
    ///
    /// Returns false (and leaves `updated_at` alone) when nothing changed.
    pub fn apply(&mut self, record: ThreatRecord, now: DateTime<Utc>) -> bool {
        let changed = self.threat_type != record.threat_type
            || self.source != record.source
            || self.confidence != record.confidence
            || self.country != record.country
            || self.isp != record.isp
            || self.domain != record.domain
            || self.usage_type != record.usage_type
            || self.hostnames != record.hostnames
            || self.total_reports != record.total_reports
            || self.num_distinct_users != record.num_distinct_users
            || self.last_seen != record.last_seen;

        if !changed {
            return false;
        }

        self.threat_type = record.threat_type;
        self.source = record.source;
        self.confidence = record.confidence;
        self.country = record.country;
        self.isp = record.isp;
        self.domain = record.domain;
        self.usage_type = record.usage_type;
        self.hostnames = record.hostnames;
        self.total_reports = record.total_reports;
        self.num_distinct_users = record.num_distinct_users;
        self.last_seen = record.last_seen;
        self.updated_at = now;
        true
    }
}
