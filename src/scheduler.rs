//! Refresh cadence and the background timer driving refresh cycles.

use crate::refresh::Refresher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// How often refresh cycles run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cadence {
    #[serde(rename = "realtime")]
    Realtime,
    #[serde(rename = "hourly")]
    Hourly,
    #[serde(rename = "6hours", alias = "6-hour", alias = "six_hours")]
    SixHours,
    #[default]
    #[serde(rename = "daily")]
    Daily,
}

impl Cadence {
    pub const ALL: [Cadence; 4] = [
        Cadence::Realtime,
        Cadence::Hourly,
        Cadence::SixHours,
        Cadence::Daily,
    ];

    /// Period between two timer ticks.
    pub fn interval(self) -> Duration {
        match self {
            Cadence::Realtime => Duration::from_secs(5 * 60),
            Cadence::Hourly => Duration::from_secs(60 * 60),
            Cadence::SixHours => Duration::from_secs(6 * 60 * 60),
            Cadence::Daily => Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Cadence::Realtime => "realtime",
            Cadence::Hourly => "hourly",
            Cadence::SixHours => "6hours",
            Cadence::Daily => "daily",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cadence string that names no known cadence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported cadence '{0}' (expected realtime, hourly, 6hours or daily)")]
pub struct UnknownCadence(pub String);

impl FromStr for Cadence {
    type Err = UnknownCadence;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "realtime" => Ok(Cadence::Realtime),
            "hourly" => Ok(Cadence::Hourly),
            "6hours" | "6-hour" | "six_hours" => Ok(Cadence::SixHours),
            "daily" => Ok(Cadence::Daily),
            _ => Err(UnknownCadence(s.to_string())),
        }
    }
}

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Idle,
    Running,
}

struct Inner {
    cadence: Cadence,
    timer: Option<JoinHandle<()>>,
}

/// Owns the refresh timer.
///
/// Every cycle runs on its own task, so aborting the timer never cancels a
/// cycle that already started. Overlap is prevented by the refresher's
/// single-flight guard: a tick that finds a cycle running is dropped.
pub struct Scheduler {
    refresher: Arc<Refresher>,
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new(refresher: Arc<Refresher>, cadence: Cadence) -> Self {
        Self {
            refresher,
            inner: Mutex::new(Inner {
                cadence,
                timer: None,
            }),
        }
    }

    pub fn refresher(&self) -> &Arc<Refresher> {
        &self.refresher
    }

    pub fn cadence(&self) -> Cadence {
        self.inner.lock().cadence
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().timer.is_some()
    }

    /// `Running` whenever a cycle is in progress, even one triggered
    /// manually while stopped.
    pub fn state(&self) -> SchedulerState {
        if self.refresher.is_running() {
            SchedulerState::Running
        } else if self.is_started() {
            SchedulerState::Idle
        } else {
            SchedulerState::Stopped
        }
    }

    /// Run one cycle now, then arm the timer at the cadence's interval.
    ///
    /// Starting an already started scheduler re-arms it with `cadence`.
    /// Must be called within a tokio runtime.
    pub fn start(&self, cadence: Cadence) {
        let mut inner = self.inner.lock();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.cadence = cadence;

        let period = cadence.interval();
        info!(cadence = %cadence, period_secs = period.as_secs(), "Starting refresh scheduler");

        spawn_cycle(&self.refresher);

        let refresher = Arc::clone(&self.refresher);
        inner.timer = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                debug!("Refresh timer fired");
                spawn_cycle(&refresher);
            }
        }));
    }

    /// Cancel the timer. A cycle already running finishes on its own.
    pub fn stop(&self) {
        if let Some(timer) = self.inner.lock().timer.take() {
            timer.abort();
            info!("Refresh scheduler stopped");
        }
    }

    /// Equivalent to `stop` followed by `start(cadence)`.
    pub fn reconfigure(&self, cadence: Cadence) {
        self.stop();
        self.start(cadence);
    }

    /// Record a cadence without arming the timer.
    pub fn set_cadence(&self, cadence: Cadence) {
        self.inner.lock().cadence = cadence;
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.get_mut().timer.take() {
            timer.abort();
        }
    }
}

fn spawn_cycle(refresher: &Arc<Refresher>) {
    let refresher = Arc::clone(refresher);
    tokio::spawn(async move {
        refresher.run_if_idle().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::feeds::{FeedError, FeedFetcher, FeedKind, RawThreatRecord};
    use crate::model::ThreatType;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FeedFetcher for CountingFetcher {
        async fn fetch(&self) -> Result<Vec<RawThreatRecord>, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![RawThreatRecord::listed(
                "203.0.113.9",
                "list",
                ThreatType::Spam,
                75,
            )])
        }

        fn name(&self) -> &str {
            "list"
        }

        fn kind(&self) -> FeedKind {
            FeedKind::Community
        }
    }

    fn scheduler(cadence: Cadence) -> (Scheduler, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = Refresher::new(
            vec![Arc::new(CountingFetcher {
                calls: calls.clone(),
            })],
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryAuditSink::new()),
        );
        (Scheduler::new(Arc::new(refresher), cadence), calls)
    }

    #[test]
    fn test_cadence_intervals() {
        assert_eq!(Cadence::Realtime.interval(), Duration::from_secs(300));
        assert_eq!(Cadence::Hourly.interval(), Duration::from_secs(3600));
        assert_eq!(Cadence::SixHours.interval(), Duration::from_secs(21600));
        assert_eq!(Cadence::Daily.interval(), Duration::from_secs(86400));
    }

    #[test]
    fn test_cadence_parse() {
        assert_eq!("hourly".parse::<Cadence>().unwrap(), Cadence::Hourly);
        assert_eq!("6-hour".parse::<Cadence>().unwrap(), Cadence::SixHours);
        assert_eq!(" Daily ".parse::<Cadence>().unwrap(), Cadence::Daily);
        assert!("weekly".parse::<Cadence>().is_err());

        for cadence in Cadence::ALL {
            assert_eq!(cadence.as_str().parse::<Cadence>().unwrap(), cadence);
        }
    }

    #[test]
    fn test_cadence_serde() {
        let cadence: Cadence = serde_json::from_str("\"6hours\"").unwrap();
        assert_eq!(cadence, Cadence::SixHours);
        assert_eq!(serde_json::to_string(&Cadence::Realtime).unwrap(), "\"realtime\"");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_immediately_then_on_ticks() {
        let (scheduler, calls) = scheduler(Cadence::Hourly);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        scheduler.start(Cadence::Hourly);
        assert!(scheduler.is_started());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.refresher().completed_cycles(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer() {
        let (scheduler, calls) = scheduler(Cadence::Realtime);
        scheduler.start(Cadence::Realtime);
        tokio::time::sleep(Duration::from_secs(1)).await;

        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_changes_period() {
        let (scheduler, calls) = scheduler(Cadence::Daily);
        scheduler.start(Cadence::Daily);
        tokio::time::sleep(Duration::from_secs(1)).await;

        scheduler.reconfigure(Cadence::Hourly);
        assert_eq!(scheduler.cadence(), Cadence::Hourly);
        tokio::time::sleep(Duration::from_secs(3600 + 10)).await;

        // initial run, reconfigure run, one hourly tick
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
