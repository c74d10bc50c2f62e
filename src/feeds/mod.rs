//! Threat intelligence feed fetchers.

pub mod abuseipdb;
pub mod community;

use crate::model::ThreatType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// One sighting as delivered by a feed, before normalization.
///
/// The address is kept as the raw string; validation happens in the
/// classifier so that every source drops malformed lines the same way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawThreatRecord {
    pub ip_address: String,
    pub source: String,
    pub signal: RawSignal,
    pub country: Option<String>,
    pub isp: Option<String>,
    pub domain: Option<String>,
    pub usage_type: Option<String>,
    pub hostnames: Vec<String>,
    pub total_reports: u32,
    pub num_distinct_users: u32,
    pub last_seen: Option<DateTime<Utc>>,
}

impl RawThreatRecord {
    /// Record from a pre-categorized list.
    pub fn listed(ip: &str, source: &str, threat_type: ThreatType, confidence: u8) -> Self {
        Self {
            ip_address: ip.to_string(),
            source: source.to_string(),
            signal: RawSignal::Listed {
                threat_type,
                confidence,
            },
            country: None,
            isp: None,
            domain: None,
            usage_type: None,
            hostnames: Vec::new(),
            total_reports: 0,
            num_distinct_users: 0,
            last_seen: None,
        }
    }

    /// Record carrying a numeric reputation score.
    pub fn scored(ip: &str, source: &str, score: i64) -> Self {
        Self {
            signal: RawSignal::Score(score),
            ..Self::listed(ip, source, ThreatType::Other, 0)
        }
    }
}

/// Source-native classification data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawSignal {
    /// Reputation score as reported by the source (expected 0-100).
    Score(i64),
    /// The source already categorized the address.
    Listed {
        threat_type: ThreatType,
        confidence: u8,
    },
}

/// Where a fetcher sits in merge precedence. Later variants win collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FeedKind {
    /// Plaintext community list.
    Community,
    /// Scored reputation API.
    Reputation,
}

/// Error from a feed fetcher.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[source] reqwest::Error),
    /// Timeout.
    #[error("Request timed out")]
    Timeout,
    /// Rate limited.
    #[error("Rate limited")]
    RateLimited,
    /// Invalid response.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    /// The fetcher cannot run, e.g. a required credential is missing.
    #[error("Source unavailable: {0}")]
    Unavailable(String),
    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FeedError::Timeout
        } else {
            FeedError::Http(e)
        }
    }
}

/// A source of threat intelligence.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Fetch the current list of sightings.
    async fn fetch(&self) -> Result<Vec<RawThreatRecord>, FeedError>;

    /// Source name for logging and outcome reporting.
    fn name(&self) -> &str;

    /// Merge precedence of this source.
    fn kind(&self) -> FeedKind;

    /// Upper bound for one `fetch` call.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Whether this fetcher is enabled.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Build an HTTP client for feed requests.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, FeedError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("threat-blocker/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| FeedError::Other(format!("Failed to create HTTP client: {}", e)))
}
