//! Maps source-native signals onto the common threat taxonomy.

use crate::feeds::{RawSignal, RawThreatRecord};
use crate::model::{ThreatRecord, ThreatType};
use chrono::{DateTime, Utc};
use std::net::IpAddr;

/// Normalized classification of one sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub threat_type: ThreatType,
    pub confidence: u8,
}

/// Classify a numeric reputation score.
///
/// Hosting providers in the 75-89 band are treated as malware hosts.
pub fn classify_score(score: i64, usage_type: Option<&str>) -> Classification {
    let confidence = score.clamp(0, 100) as u8;
    let threat_type = match confidence {
        90.. => ThreatType::MalwareC2,
        75..=89 if is_hosting(usage_type) => ThreatType::MalwareHost,
        75..=89 => ThreatType::Botnet,
        50..=74 => ThreatType::Suspicious,
        _ => ThreatType::Other,
    };

    Classification {
        threat_type,
        confidence,
    }
}

fn is_hosting(usage_type: Option<&str>) -> bool {
    usage_type
        .map(|u| u.to_ascii_lowercase().contains("hosting"))
        .unwrap_or(false)
}

/// Classify any raw signal.
pub fn classify(signal: RawSignal, usage_type: Option<&str>) -> Classification {
    match signal {
        RawSignal::Score(score) => classify_score(score, usage_type),
        RawSignal::Listed {
            threat_type,
            confidence,
        } => Classification {
            threat_type,
            confidence: confidence.min(100),
        },
    }
}

/// Parse and canonicalize an address; IPv4-mapped IPv6 becomes plain IPv4.
pub fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
}

/// Normalize one raw record. Records with an invalid address yield `None`.
///
/// `observed_at` stands in for sources that do not report a last-seen time.
pub fn normalize(raw: RawThreatRecord, observed_at: DateTime<Utc>) -> Option<ThreatRecord> {
    let ip_address = parse_ip(&raw.ip_address)?;
    let classification = classify(raw.signal, raw.usage_type.as_deref());

    Some(ThreatRecord {
        ip_address,
        threat_type: classification.threat_type,
        source: raw.source,
        confidence: classification.confidence,
        country: raw.country,
        isp: raw.isp,
        domain: raw.domain,
        usage_type: raw.usage_type,
        hostnames: raw.hostnames,
        total_reports: raw.total_reports,
        num_distinct_users: raw.num_distinct_users,
        last_seen: raw.last_seen.unwrap_or(observed_at),
    })
}

/// Normalize a whole batch, silently dropping malformed records.
pub fn normalize_all(
    records: Vec<RawThreatRecord>,
    observed_at: DateTime<Utc>,
) -> Vec<ThreatRecord> {
    records
        .into_iter()
        .filter_map(|r| normalize(r, observed_at))
        .collect()
}
