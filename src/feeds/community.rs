//! Plaintext community blocklists (Blocklist.de, Tor exit addresses, ...).

use super::{http_client, FeedError, FeedFetcher, FeedKind, RawThreatRecord};
use crate::config::{CommunityListConfig, ListFormat};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Fetcher for one line-delimited list.
///
/// Every address on the list gets the configured threat type and confidence.
pub struct CommunityListFetcher {
    config: CommunityListConfig,
    client: Client,
}

impl CommunityListFetcher {
    /// Create a new community list fetcher.
    pub fn new(config: CommunityListConfig) -> Result<Self, FeedError> {
        let client = http_client(Duration::from_millis(config.timeout_ms))?;
        Ok(Self { config, client })
    }

    fn to_records(&self, content: &str) -> Vec<RawThreatRecord> {
        parse_list(content, self.config.format)
            .into_iter()
            .map(|ip| {
                RawThreatRecord::listed(
                    ip,
                    &self.config.name,
                    self.config.threat_type,
                    self.config.confidence,
                )
            })
            .collect()
    }
}

/// Extract candidate addresses from a list document.
///
/// Candidates are not validated here.
pub fn parse_list(content: &str, format: ListFormat) -> Vec<&str> {
    match format {
        ListFormat::Plain => parse_plain(content),
        ListFormat::ExitAddresses => parse_exit_addresses(content),
    }
}

/// One address per line; blank lines and `#` comments are skipped.
fn parse_plain(content: &str) -> Vec<&str> {
    content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .collect()
}

/// `ExitAddress <ip> <date> <time>` lines of a Tor exit-addresses document.
fn parse_exit_addresses(content: &str) -> Vec<&str> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("ExitAddress") => parts.next(),
                _ => None,
            }
        })
        .collect()
}

#[async_trait]
impl FeedFetcher for CommunityListFetcher {
    async fn fetch(&self) -> Result<Vec<RawThreatRecord>, FeedError> {
        debug!(list = %self.config.name, url = %self.config.url, "Fetching community list");

        let response = self.client.get(&self.config.url).send().await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FeedError::RateLimited);
        }

        if !response.status().is_success() {
            let status = response.status();
            return Err(FeedError::InvalidResponse(format!("HTTP {}", status)));
        }

        let content = response.text().await.map_err(|e| {
            FeedError::InvalidResponse(format!("Failed to read response: {}", e))
        })?;

        let records = self.to_records(&content);
        debug!(list = %self.config.name, records = records.len(), "Community list fetched");

        Ok(records)
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> FeedKind {
        FeedKind::Community
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::RawSignal;
    use crate::model::ThreatType;

    fn create_test_config(format: ListFormat) -> CommunityListConfig {
        CommunityListConfig {
            name: "ssh".to_string(),
            enabled: true,
            url: "https://lists.blocklist.de/lists/ssh.txt".to_string(),
            format,
            threat_type: ThreatType::BruteForce,
            confidence: 75,
            timeout_ms: 30_000,
        }
    }

    #[test]
    fn test_parse_plain() {
        let content = r#"
# Comment
203.0.113.9
  198.51.100.7

# Another comment
2001:db8::1
"#;
        assert_eq!(
            parse_list(content, ListFormat::Plain),
            vec!["203.0.113.9", "198.51.100.7", "2001:db8::1"]
        );
    }

    #[test]
    fn test_parse_plain_keeps_malformed_for_classifier() {
        let entries = parse_list("not-an-ip\n1.2.3.4\n", ListFormat::Plain);
        assert_eq!(entries, vec!["not-an-ip", "1.2.3.4"]);
    }

    #[test]
    fn test_parse_exit_addresses() {
        let content = "\
ExitNode 0011BD2485AD45D984EC4159C88FC066E5E3300E
Published 2025-01-01 08:00:00
LastStatus 2025-01-01 09:00:00
ExitAddress 162.247.74.201 2025-01-01 09:05:10
ExitNode 0111BA9B604669E636FFD5B503F382A4B7AD6E80
ExitAddress 185.220.101.4 2025-01-01 09:10:02
";
        assert_eq!(
            parse_list(content, ListFormat::ExitAddresses),
            vec!["162.247.74.201", "185.220.101.4"]
        );
    }

    #[test]
    fn test_records_carry_list_classification() {
        let fetcher = CommunityListFetcher::new(create_test_config(ListFormat::Plain)).unwrap();
        let records = fetcher.to_records("203.0.113.9\n");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, "ssh");
        assert_eq!(
            records[0].signal,
            RawSignal::Listed {
                threat_type: ThreatType::BruteForce,
                confidence: 75
            }
        );
    }

    #[test]
    fn test_fetcher_identity() {
        let mut config = create_test_config(ListFormat::Plain);
        config.enabled = false;
        let fetcher = CommunityListFetcher::new(config).unwrap();

        assert_eq!(fetcher.name(), "ssh");
        assert_eq!(fetcher.kind(), FeedKind::Community);
        assert!(!fetcher.is_enabled());
    }
}
