//! Merges per-source record lists into one record per address.

use crate::feeds::FeedKind;
use crate::model::ThreatRecord;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Normalized records from one fetcher in the current cycle.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub kind: FeedKind,
    pub records: Vec<ThreatRecord>,
}

impl SourceBatch {
    pub fn new(kind: FeedKind, records: Vec<ThreatRecord>) -> Self {
        Self { kind, records }
    }
}

/// Whether `candidate` replaces `current` for the same address.
///
/// Batches are visited in precedence order, so a candidate always comes from
/// the same or a higher-precedence source than `current`.
fn supersedes(candidate: &ThreatRecord, current: &ThreatRecord) -> bool {
    !candidate.threat_type.is_generic() || current.threat_type.is_generic()
}

/// Merge all batches of a cycle.
///
/// A specific classification always beats `Suspicious`/`Other`. Otherwise the
/// record from the higher-precedence source (reputation over community) wins,
/// and within equal precedence the later record wins. Batches of equal
/// precedence keep their given order. Output is sorted by address.
pub fn merge(mut batches: Vec<SourceBatch>) -> Vec<ThreatRecord> {
    batches.sort_by_key(|b| b.kind);

    let mut merged: BTreeMap<IpAddr, ThreatRecord> = BTreeMap::new();
    for record in batches.into_iter().flat_map(|b| b.records) {
        match merged.get_mut(&record.ip_address) {
            Some(current) => {
                if supersedes(&record, current) {
                    *current = record;
                }
            }
            None => {
                merged.insert(record.ip_address, record);
            }
        }
    }

    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::record;
    use crate::model::ThreatType;

    #[test]
    fn test_specific_beats_generic_regardless_of_order() {
        let a = SourceBatch::new(
            FeedKind::Community,
            vec![record("1.2.3.4", ThreatType::Suspicious, 75, "A")],
        );
        let b = SourceBatch::new(
            FeedKind::Community,
            vec![record("1.2.3.4", ThreatType::BruteForce, 75, "B")],
        );

        let merged = merge(vec![a.clone(), b.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].threat_type, ThreatType::BruteForce);
        assert_eq!(merged[0].source, "B");

        let merged = merge(vec![b, a]);
        assert_eq!(merged[0].threat_type, ThreatType::BruteForce);
    }

    #[test]
    fn test_specific_community_beats_generic_reputation() {
        let community = SourceBatch::new(
            FeedKind::Community,
            vec![record("1.2.3.4", ThreatType::Spam, 75, "spam-list")],
        );
        let reputation = SourceBatch::new(
            FeedKind::Reputation,
            vec![record("1.2.3.4", ThreatType::Suspicious, 60, "AbuseIPDB")],
        );

        let merged = merge(vec![reputation, community]);
        assert_eq!(merged[0].threat_type, ThreatType::Spam);
    }

    #[test]
    fn test_reputation_wins_between_specific() {
        let community = SourceBatch::new(
            FeedKind::Community,
            vec![record("1.2.3.4", ThreatType::BruteForce, 75, "ssh")],
        );
        let reputation = SourceBatch::new(
            FeedKind::Reputation,
            vec![record("1.2.3.4", ThreatType::MalwareC2, 98, "AbuseIPDB")],
        );

        let merged = merge(vec![reputation.clone(), community.clone()]);
        assert_eq!(merged[0].threat_type, ThreatType::MalwareC2);
        assert_eq!(merged[0].source, "AbuseIPDB");

        let merged = merge(vec![community, reputation]);
        assert_eq!(merged[0].threat_type, ThreatType::MalwareC2);
    }

    #[test]
    fn test_later_duplicate_within_source_wins() {
        let batch = SourceBatch::new(
            FeedKind::Community,
            vec![
                record("1.2.3.4", ThreatType::Spam, 70, "list"),
                record("1.2.3.4", ThreatType::Spam, 80, "list"),
            ],
        );

        let merged = merge(vec![batch]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].confidence, 80);
    }

    #[test]
    fn test_distinct_addresses_are_kept_sorted() {
        let batch = SourceBatch::new(
            FeedKind::Community,
            vec![
                record("198.51.100.7", ThreatType::Spam, 75, "list"),
                record("1.2.3.4", ThreatType::Spam, 75, "list"),
            ],
        );

        let merged = merge(vec![batch]);
        let ips: Vec<String> = merged.iter().map(|r| r.ip_address.to_string()).collect();
        assert_eq!(ips, vec!["1.2.3.4", "198.51.100.7"]);
    }
}
