//! Configuration types for the threat blocker.

use crate::model::ThreatType;
use crate::scheduler::Cadence;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// IP extraction configuration.
    #[serde(default)]
    pub ip_extraction: IpExtractionConfig,

    /// Request enforcement configuration.
    #[serde(default)]
    pub enforcement: EnforcementConfig,

    /// AbuseIPDB feed configuration.
    #[serde(default)]
    pub abuseipdb: Option<AbuseIPDBConfig>,

    /// Plaintext community lists.
    #[serde(default = "default_community_lists")]
    pub community_lists: Vec<CommunityListConfig>,

    /// Blocklist persistence.
    #[serde(default)]
    pub store: StoreConfig,

    /// HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            ip_extraction: IpExtractionConfig::default(),
            enforcement: EnforcementConfig::default(),
            abuseipdb: None,
            community_lists: default_community_lists(),
            store: StoreConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Master enable/disable switch for refresh and enforcement.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the refresh cycle runs.
    #[serde(default)]
    pub cadence: Cadence,

    /// Log blocked requests.
    #[serde(default = "default_true")]
    pub log_blocked: bool,

    /// Send an admin notification after large refreshes.
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,

    /// Notify when a cycle creates more than this many entries.
    #[serde(default = "default_notify_threshold")]
    pub notify_threshold: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            cadence: Cadence::default(),
            log_blocked: true,
            notifications_enabled: true,
            notify_threshold: default_notify_threshold(),
        }
    }
}

fn default_notify_threshold() -> usize {
    100
}

/// IP extraction configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpExtractionConfig {
    /// Headers to check for client IP, in order of preference.
    #[serde(default = "default_ip_headers")]
    pub headers: Vec<String>,

    /// Use first IP from X-Forwarded-For (true) or last IP (false).
    #[serde(default = "default_true")]
    pub use_first_ip: bool,
}

impl Default for IpExtractionConfig {
    fn default() -> Self {
        Self {
            headers: default_ip_headers(),
            use_first_ip: true,
        }
    }
}

fn default_ip_headers() -> Vec<String> {
    vec!["x-forwarded-for".to_string(), "x-real-ip".to_string()]
}

/// Request enforcement configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnforcementConfig {
    /// Path prefixes that are never checked.
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            exempt_paths: default_exempt_paths(),
        }
    }
}

fn default_exempt_paths() -> Vec<String> {
    vec![
        "/api/health".to_string(),
        "/api/auth/login".to_string(),
        "/api/auth/register".to_string(),
        "/api/threat-blocker".to_string(),
    ]
}

/// AbuseIPDB feed configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AbuseIPDBConfig {
    /// Enable the AbuseIPDB feed.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API key (supports ${ENV_VAR} syntax). Empty means the feed reports unavailable.
    #[serde(default)]
    pub api_key: String,

    /// Only consider reports from the last N days.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    /// Minimum abuse confidence score to include.
    #[serde(default = "default_confidence_minimum")]
    pub confidence_minimum: u8,

    /// Maximum number of addresses to fetch.
    #[serde(default = "default_limit")]
    pub limit: u32,

    /// API request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl Default for AbuseIPDBConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            max_age_days: default_max_age_days(),
            confidence_minimum: default_confidence_minimum(),
            limit: default_limit(),
            timeout_ms: default_timeout(),
        }
    }
}

fn default_max_age_days() -> u32 {
    90
}

fn default_confidence_minimum() -> u8 {
    75
}

fn default_limit() -> u32 {
    10_000
}

fn default_timeout() -> u64 {
    30_000
}

/// Plaintext community list configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommunityListConfig {
    /// Name recorded as the entry source.
    pub name: String,

    /// Enable this list.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// URL of the list.
    pub url: String,

    /// Line format.
    #[serde(default)]
    pub format: ListFormat,

    /// Threat type assigned to every listed address.
    #[serde(default = "default_list_threat_type")]
    pub threat_type: ThreatType,

    /// Confidence assigned to every listed address.
    #[serde(default = "default_list_confidence")]
    pub confidence: u8,

    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

fn default_list_threat_type() -> ThreatType {
    ThreatType::Suspicious
}

fn default_list_confidence() -> u8 {
    75
}

fn default_community_lists() -> Vec<CommunityListConfig> {
    vec![CommunityListConfig {
        name: "Blocklist.de".to_string(),
        enabled: true,
        url: "https://lists.blocklist.de/lists/all.txt".to_string(),
        format: ListFormat::Plain,
        threat_type: default_list_threat_type(),
        confidence: default_list_confidence(),
        timeout_ms: default_timeout(),
    }]
}

/// Community list line format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListFormat {
    /// One address per line, `#` comments.
    #[default]
    Plain,
    /// Tor `exit-addresses` document (`ExitAddress <ip> <date> <time>`).
    ExitAddresses,
}

/// Blocklist persistence configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    /// JSON snapshot file. Without it the blocklist lives in memory only.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content)?;
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.settings.notify_threshold == 0 {
            anyhow::bail!("notify_threshold must be greater than 0");
        }

        if self.ip_extraction.headers.iter().any(|h| h.trim().is_empty()) {
            anyhow::bail!("ip_extraction.headers must not contain empty names");
        }

        if self.enforcement.exempt_paths.iter().any(|p| p.trim().is_empty()) {
            anyhow::bail!("enforcement.exempt_paths must not contain empty entries");
        }

        if let Some(ref abuseipdb) = self.abuseipdb {
            if abuseipdb.confidence_minimum > 100 {
                anyhow::bail!(
                    "abuseipdb.confidence_minimum ({}) must be <= 100",
                    abuseipdb.confidence_minimum
                );
            }
            if abuseipdb.limit == 0 {
                anyhow::bail!("abuseipdb.limit must be greater than 0");
            }
        }

        let mut names = HashSet::new();
        for list in &self.community_lists {
            if list.name.trim().is_empty() {
                anyhow::bail!("Community list name must not be empty");
            }
            if !names.insert(list.name.as_str()) {
                anyhow::bail!("Duplicate community list name: {}", list.name);
            }
            if list.url.trim().is_empty() {
                anyhow::bail!("Community list '{}' has an empty url", list.name);
            }
            if list.confidence > 100 {
                anyhow::bail!(
                    "Community list '{}' confidence ({}) must be <= 100",
                    list.name,
                    list.confidence
                );
            }
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# Threat Blocker Configuration

settings:
  enabled: true
  cadence: daily               # realtime (5m), hourly, 6hours, daily
  log_blocked: true
  notifications_enabled: true
  notify_threshold: 100        # notify admins when a refresh adds more than this

# Client IP extraction from request headers
ip_extraction:
  headers:
    - "x-forwarded-for"
    - "x-real-ip"
  use_first_ip: true           # Use first IP from X-Forwarded-For

# Paths that are never checked against the blocklist
enforcement:
  exempt_paths:
    - "/api/health"
    - "/api/auth/login"
    - "/api/auth/register"
    - "/api/threat-blocker"

# AbuseIPDB reputation feed (optional)
abuseipdb:
  enabled: true
  api_key: "${ABUSEIPDB_API_KEY}"  # Use environment variable
  max_age_days: 90
  confidence_minimum: 75
  limit: 10000
  timeout_ms: 30000

# Plaintext community lists, no credentials required
community_lists:
  - name: "Blocklist.de"
    url: "https://lists.blocklist.de/lists/all.txt"
    format: plain
    threat_type: "Suspicious"
    confidence: 75
  - name: "Tor Exit Nodes"
    enabled: false
    url: "https://check.torproject.org/exit-addresses"
    format: exit_addresses
    threat_type: "Suspicious"
    confidence: 50

store:
  snapshot_path: "/var/lib/threat-blocker/blocklist.json"

server:
  listen: "0.0.0.0:8080"
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> anyhow::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;
    let expanded = re.replace_all(content, |cap: &regex::Captures| {
        std::env::var(&cap[1]).unwrap_or_default()
    });
    Ok(expanded.into_owned())
}
