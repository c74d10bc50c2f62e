//! Wires feeds, store, scheduler and enforcement together from configuration.

use crate::admin::AdminService;
use crate::audit::{AuditSink, TracingAuditSink};
use crate::config::Config;
use crate::enforcement::Enforcer;
use crate::feeds::abuseipdb::AbuseIPDBFetcher;
use crate::feeds::community::CommunityListFetcher;
use crate::feeds::FeedFetcher;
use crate::http::{self, AppState};
use crate::refresh::Refresher;
use crate::scheduler::Scheduler;
use crate::store::{BlocklistStore, MemoryStore};
use axum::Router;
use std::sync::Arc;
use tracing::{info, warn};

/// A fully assembled threat blocker.
pub struct ThreatBlocker {
    config: Arc<Config>,
    scheduler: Arc<Scheduler>,
    enforcer: Arc<Enforcer>,
    admin: Arc<AdminService>,
}

/// Build the fetchers enabled in `config`.
///
/// A fetcher that cannot be constructed is logged and left out.
pub fn build_fetchers(config: &Config) -> Vec<Arc<dyn FeedFetcher>> {
    let mut fetchers: Vec<Arc<dyn FeedFetcher>> = Vec::new();

    if let Some(ref abuseipdb) = config.abuseipdb {
        if abuseipdb.enabled {
            match AbuseIPDBFetcher::new(abuseipdb.clone()) {
                Ok(fetcher) => {
                    info!("AbuseIPDB feed enabled");
                    fetchers.push(Arc::new(fetcher));
                }
                Err(e) => warn!(error = %e, "Failed to create AbuseIPDB feed"),
            }
        }
    }

    for list in &config.community_lists {
        if !list.enabled {
            continue;
        }
        match CommunityListFetcher::new(list.clone()) {
            Ok(fetcher) => {
                info!(name = %list.name, url = %list.url, "Community list enabled");
                fetchers.push(Arc::new(fetcher));
            }
            Err(e) => warn!(name = %list.name, error = %e, "Failed to create community list feed"),
        }
    }

    fetchers
}

impl ThreatBlocker {
    /// Assemble from configuration with log-backed audit records.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn BlocklistStore> = match config.store.snapshot_path {
            Some(ref path) => {
                let store = MemoryStore::open(path)?;
                info!(path = %path.display(), entries = store.len(), "Loaded blocklist snapshot");
                Arc::new(store)
            }
            None => Arc::new(MemoryStore::new()),
        };
        let fetchers = build_fetchers(&config);
        Ok(Self::with_parts(config, fetchers, store, Arc::new(TracingAuditSink)))
    }

    /// Assemble from explicit collaborators.
    pub fn with_parts(
        config: Config,
        fetchers: Vec<Arc<dyn FeedFetcher>>,
        store: Arc<dyn BlocklistStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let settings = &config.settings;

        let refresher = Refresher::new(fetchers, Arc::clone(&store), Arc::clone(&audit))
            .with_notify_threshold(settings.notify_threshold);
        refresher.set_notifications_enabled(settings.notifications_enabled);
        let scheduler = Arc::new(Scheduler::new(Arc::new(refresher), settings.cadence));

        let enforcer = Enforcer::new(
            Arc::clone(&store),
            audit,
            config.ip_extraction.clone(),
            config.enforcement.clone(),
        )
        .with_log_blocked(settings.log_blocked);
        enforcer.set_enabled(settings.enabled);
        let enforcer = Arc::new(enforcer);

        let admin = Arc::new(AdminService::new(
            Arc::clone(&scheduler),
            Arc::clone(&enforcer),
            store,
        ));

        info!(
            feeds = scheduler.refresher().source_names().len(),
            cadence = %settings.cadence,
            enabled = settings.enabled,
            "Threat blocker initialized"
        );

        Self {
            config: Arc::new(config),
            scheduler,
            enforcer,
            admin,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.enforcer
    }

    pub fn admin(&self) -> &Arc<AdminService> {
        &self.admin
    }

    /// Start the scheduler when enabled. Must be called within a tokio runtime.
    pub fn start(&self) {
        if self.enforcer.is_enabled() {
            self.scheduler.start(self.scheduler.cadence());
        } else {
            info!("Threat blocker disabled, scheduler not started");
        }
    }

    pub fn state(&self) -> AppState {
        AppState {
            admin: Arc::clone(&self.admin),
            enforcer: Arc::clone(&self.enforcer),
        }
    }

    /// Admin routes behind enforcement.
    pub fn router(&self) -> Router {
        http::app(self.state())
    }

    /// Protect application routes with the enforcement check.
    pub fn protect<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        http::with_enforcement(router, Arc::clone(&self.enforcer))
    }
}
