//! AbuseIPDB blacklist feed.

use super::{http_client, FeedError, FeedFetcher, FeedKind, RawThreatRecord, RawSignal};
use crate::config::AbuseIPDBConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const BLACKLIST_URL: &str = "https://api.abuseipdb.com/api/v2/blacklist";

/// Source name recorded on entries from this feed.
pub const SOURCE_NAME: &str = "AbuseIPDB";

/// AbuseIPDB blacklist response.
#[derive(Debug, Deserialize)]
struct BlacklistResponse {
    #[serde(default)]
    data: Vec<BlacklistEntry>,
}

/// One listed address.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlacklistEntry {
    ip_address: String,

    /// Abuse confidence score (0-100).
    #[serde(default)]
    abuse_confidence_score: Option<i64>,

    #[serde(default)]
    last_reported_at: Option<DateTime<Utc>>,

    #[serde(default)]
    country_code: Option<String>,

    /// Usage type (e.g., "Data Center/Web Hosting/Transit").
    #[serde(default)]
    usage_type: Option<String>,

    #[serde(default)]
    isp: Option<String>,

    #[serde(default)]
    domain: Option<String>,

    #[serde(default)]
    hostnames: Option<Vec<String>>,

    #[serde(default)]
    total_reports: Option<u32>,

    #[serde(default)]
    num_distinct_users: Option<u32>,
}

impl BlacklistEntry {
    /// A missing score falls back to `minimum_score`, the floor the listing
    /// was requested with.
    fn into_raw(self, minimum_score: u8) -> RawThreatRecord {
        RawThreatRecord {
            ip_address: self.ip_address,
            source: SOURCE_NAME.to_string(),
            signal: RawSignal::Score(
                self.abuse_confidence_score.unwrap_or(i64::from(minimum_score)),
            ),
            country: self.country_code,
            isp: self.isp,
            domain: self.domain,
            usage_type: self.usage_type,
            hostnames: self.hostnames.unwrap_or_default(),
            total_reports: self.total_reports.unwrap_or(0),
            num_distinct_users: self.num_distinct_users.unwrap_or(0),
            last_seen: self.last_reported_at,
        }
    }
}

/// AbuseIPDB reputation feed.
pub struct AbuseIPDBFetcher {
    config: AbuseIPDBConfig,
    client: Client,
}

impl AbuseIPDBFetcher {
    /// Create a new AbuseIPDB fetcher.
    pub fn new(config: AbuseIPDBConfig) -> Result<Self, FeedError> {
        let client = http_client(Duration::from_millis(config.timeout_ms))?;
        Ok(Self { config, client })
    }

    fn request_url(&self) -> String {
        format!(
            "{}?limit={}&maxAgeInDays={}&confidenceMinimum={}",
            BLACKLIST_URL, self.config.limit, self.config.max_age_days, self.config.confidence_minimum
        )
    }
}

/// Parse a blacklist response body.
fn parse_blacklist(body: &str, minimum_score: u8) -> Result<Vec<RawThreatRecord>, FeedError> {
    let response: BlacklistResponse = serde_json::from_str(body).map_err(|e| {
        FeedError::InvalidResponse(format!("Failed to parse response: {}", e))
    })?;

    Ok(response
        .data
        .into_iter()
        .map(|entry| entry.into_raw(minimum_score))
        .collect())
}

#[async_trait]
impl FeedFetcher for AbuseIPDBFetcher {
    async fn fetch(&self) -> Result<Vec<RawThreatRecord>, FeedError> {
        if self.config.api_key.trim().is_empty() {
            return Err(FeedError::Unavailable("AbuseIPDB API key not configured".to_string()));
        }

        debug!(
            limit = self.config.limit,
            max_age_days = self.config.max_age_days,
            confidence_minimum = self.config.confidence_minimum,
            "Fetching AbuseIPDB blacklist"
        );

        let response = self
            .client
            .get(self.request_url())
            .header("Key", &self.config.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("AbuseIPDB rate limit exceeded");
            return Err(FeedError::RateLimited);
        }

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(FeedError::Unavailable(format!(
                "AbuseIPDB rejected the API key (HTTP {})",
                response.status()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::InvalidResponse(format!("HTTP {}: {}", status, body)));
        }

        let body = response.text().await?;
        let records = parse_blacklist(&body, self.config.confidence_minimum)?;

        debug!(records = records.len(), "AbuseIPDB blacklist fetched");

        Ok(records)
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn kind(&self) -> FeedKind {
        FeedKind::Reputation
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}
