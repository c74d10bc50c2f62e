//! Threat blocker.
//!
//! Blocks inbound requests from addresses listed by threat intelligence
//! feeds, and keeps that list fresh by polling the feeds in the background.
//!
//! # Features
//!
//! - **AbuseIPDB Integration** - Pull the AbuseIPDB blacklist and classify scores
//! - **Community Lists** - Plaintext and Tor exit-address lists, pre-categorized
//! - **Deterministic Merge** - Specific classifications beat generic ones, reputation beats community
//! - **Single-Flight Refresh** - One refresh cycle at a time on a configurable cadence
//! - **Request Enforcement** - axum middleware returning a fixed 403 for listed addresses
//! - **Admin Surface** - Status, statistics, settings, listing, export and removal
//!
//! # Failure policy
//!
//! Enforcement fails open: when the blocklist lookup errors, the request is
//! allowed and the error is logged. This trades security for availability on
//! purpose; an outage of the blocklist store never becomes an outage of the
//! protected service. Feed failures are isolated per source and never abort
//! a refresh cycle.
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   enabled: true
//!   cadence: daily
//!
//! abuseipdb:
//!   enabled: true
//!   api_key: "${ABUSEIPDB_API_KEY}"
//!   confidence_minimum: 75
//!
//! community_lists:
//!   - name: "Blocklist.de SSH"
//!     url: "https://lists.blocklist.de/lists/ssh.txt"
//!     threat_type: "Brute Force"
//! ```

pub mod admin;
pub mod audit;
pub mod blocker;
pub mod classify;
pub mod config;
pub mod enforcement;
pub mod feeds;
pub mod http;
pub mod merge;
pub mod model;
pub mod refresh;
pub mod scheduler;
pub mod store;

pub use blocker::ThreatBlocker;
pub use config::Config;
pub use enforcement::{Decision, Enforcer, RequestContext};
pub use model::{BlocklistEntry, ThreatType};
pub use scheduler::{Cadence, Scheduler};
