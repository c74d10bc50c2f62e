//! Per-request blocking decision.
//!
//! A store failure during lookup allows the request. This is deliberate:
//! an unavailable blocklist must not take the whole service down with it.

use crate::audit::{ActivityLogEntry, AuditSink, ThreatReport};
use crate::classify::parse_ip;
use crate::config::{EnforcementConfig, IpExtractionConfig};
use crate::model::{BlocklistEntry, ThreatType};
use crate::store::BlocklistStore;
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Ranges never checked against the blocklist.
const NON_PUBLIC_RANGES: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "::/128",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// Authenticated requester, when the pipeline knows one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
}

/// What the enforcement check needs to know about a request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub path: String,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    /// Transport-level peer address.
    pub peer_addr: Option<IpAddr>,
    pub principal: Option<Principal>,
}

impl RequestContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn with_peer(mut self, peer: IpAddr) -> Self {
        self.peer_addr = Some(peer);
        self
    }

    pub fn with_principal(mut self, user_id: impl Into<String>) -> Self {
        self.principal = Some(Principal {
            user_id: user_id.into(),
        });
        self
    }
}

/// Why a request was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    Disabled,
    Exempt,
    Unresolvable,
    NonPublic,
    NotListed,
    LookupFailed,
}

impl AllowReason {
    pub fn tag(self) -> &'static str {
        match self {
            AllowReason::Disabled => "threat-blocker:disabled",
            AllowReason::Exempt => "threat-blocker:exempt",
            AllowReason::Unresolvable => "threat-blocker:no-ip",
            AllowReason::NonPublic => "threat-blocker:non-public",
            AllowReason::NotListed => "threat-blocker:clean",
            AllowReason::LookupFailed => "threat-blocker:lookup-failed:allowed",
        }
    }
}

/// Details of a denied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub ip: IpAddr,
    pub threat_type: ThreatType,
    pub confidence: u8,
    pub source: String,
}

/// Outcome of the enforcement check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(AllowReason),
    Deny(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Decision::Allow(reason) => reason.tag(),
            Decision::Deny(_) => "threat-blocker:blocked",
        }
    }
}

/// Extract the client address from the configured headers, in order.
///
/// With `use_first_ip` the leftmost address of a comma-separated chain is
/// used, otherwise the rightmost. Unparseable values fall through to the
/// next header.
pub fn extract_client_ip(
    headers: &HashMap<String, String>,
    config: &IpExtractionConfig,
) -> Option<IpAddr> {
    for header_name in &config.headers {
        let Some(value) = headers.get(&header_name.to_lowercase()) else {
            continue;
        };
        let candidate = if config.use_first_ip {
            // X-Forwarded-For: client, proxy1, proxy2
            value.split(',').next()
        } else {
            value.split(',').last()
        };
        if let Some(ip) = candidate.and_then(parse_ip) {
            return Some(ip);
        }
    }
    None
}

/// Whether `path` equals an exempt prefix or lies beneath it.
fn path_is_exempt(path: &str, exempt_paths: &[String]) -> bool {
    exempt_paths.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
            None => false,
        }
    })
}

/// The per-request check.
pub struct Enforcer {
    store: Arc<dyn BlocklistStore>,
    audit: Arc<dyn AuditSink>,
    ip_extraction: IpExtractionConfig,
    exempt_paths: Vec<String>,
    non_public: Vec<IpNet>,
    enabled: AtomicBool,
    log_blocked: bool,
}

impl Enforcer {
    pub fn new(
        store: Arc<dyn BlocklistStore>,
        audit: Arc<dyn AuditSink>,
        ip_extraction: IpExtractionConfig,
        enforcement: EnforcementConfig,
    ) -> Self {
        let non_public = NON_PUBLIC_RANGES
            .iter()
            .filter_map(|range| range.parse().ok())
            .collect();

        Self {
            store,
            audit,
            ip_extraction,
            exempt_paths: enforcement.exempt_paths,
            non_public,
            enabled: AtomicBool::new(true),
            log_blocked: true,
        }
    }

    pub fn with_log_blocked(mut self, log_blocked: bool) -> Self {
        self.log_blocked = log_blocked;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// When disabled every request is allowed.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Address the request is evaluated against: configured headers first,
    /// then the peer address.
    pub fn resolve_ip(&self, ctx: &RequestContext) -> Option<IpAddr> {
        extract_client_ip(&ctx.headers, &self.ip_extraction)
            .or_else(|| ctx.peer_addr.map(|ip| ip.to_canonical()))
    }

    /// Loopback, private, link-local and unspecified addresses.
    pub fn is_non_public(&self, ip: &IpAddr) -> bool {
        self.non_public.iter().any(|net| net.contains(ip))
    }

    /// Decide whether the request may proceed.
    ///
    /// Never fails: lookup errors are logged and the request is allowed.
    /// Side-effect records for a denial are written on a background task.
    pub async fn check(&self, ctx: &RequestContext) -> Decision {
        if !self.is_enabled() {
            return Decision::Allow(AllowReason::Disabled);
        }

        if path_is_exempt(&ctx.path, &self.exempt_paths) {
            debug!(path = %ctx.path, "Path exempt from threat blocking");
            return Decision::Allow(AllowReason::Exempt);
        }

        let ip = match self.resolve_ip(ctx) {
            Some(ip) => ip,
            None => {
                debug!(path = %ctx.path, "No client IP found for request");
                return Decision::Allow(AllowReason::Unresolvable);
            }
        };

        if self.is_non_public(&ip) {
            return Decision::Allow(AllowReason::NonPublic);
        }

        let entry = match self.store.lookup(&ip).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Decision::Allow(AllowReason::NotListed),
            Err(e) => {
                error!(ip = %ip, error = %e, "Blocklist lookup failed, allowing request");
                return Decision::Allow(AllowReason::LookupFailed);
            }
        };

        if self.log_blocked {
            info!(
                ip = %ip,
                threat_type = %entry.threat_type,
                confidence = entry.confidence,
                source = %entry.source,
                path = %ctx.path,
                "Blocking request from listed IP"
            );
        }

        let denial = Denial {
            ip,
            threat_type: entry.threat_type,
            confidence: entry.confidence,
            source: entry.source.clone(),
        };
        self.record_block(entry, ip, ctx.principal.clone());
        Decision::Deny(denial)
    }

    fn record_block(&self, entry: BlocklistEntry, ip: IpAddr, principal: Option<Principal>) {
        let audit = Arc::clone(&self.audit);
        tokio::spawn(async move {
            let user_id = principal.map(|p| p.user_id);
            let activity = ActivityLogEntry::blocked(&entry, ip, user_id.clone());
            if let Err(e) = audit.record_activity(activity).await {
                warn!(ip = %ip, error = %e, "Failed to record block activity");
            }

            if let Some(user_id) = user_id {
                let report = ThreatReport::blocked(&entry, ip, user_id);
                if let Err(e) = audit.record_threat(report).await {
                    warn!(ip = %ip, error = %e, "Failed to record threat report");
                }
            }
        });
    }
}
