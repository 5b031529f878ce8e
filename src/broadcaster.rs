use crate::config::Config;
use crate::feed::FeedSource;
use crate::gc::prune_stale;
use crate::ingest::Ingestor;
use crate::state::AppState;
use crate::timetable::{Language, build_snapshot};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub ingested: bool,
    pub entries: usize,
    pub delivered: usize,
    pub removed: usize,
}

/// The single producer: ingest, reconcile and publish, one tick at a time.
pub struct Broadcaster<S> {
    state: Arc<AppState>,
    ingestor: Ingestor<S>,
    interval: Duration,
    max_vehicles: usize,
    stale_after: Duration,
    language: Language,
    tz: Tz,
}

impl<S: FeedSource> Broadcaster<S> {
    pub fn new(state: Arc<AppState>, source: S, config: &Config) -> Self {
        Self {
            ingestor: Ingestor::new(source, state.store.clone()),
            state,
            interval: config.broadcast_interval,
            max_vehicles: config.max_vehicles,
            stale_after: config.stale_after,
            language: config.language,
            tz: config.timezone,
        }
    }

    /// Runs until the process exits. A tick that overruns the interval
    /// pushes the next one back instead of overlapping it.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Utc::now().with_timezone(&self.tz);
            self.tick(now).await;
        }
    }

    pub async fn tick(&self, now: DateTime<Tz>) -> TickReport {
        let mut report = TickReport::default();

        match self.ingestor.ingest().await {
            Ok(_) => report.ingested = true,
            Err(e) => warn!("realtime ingest failed, serving previous data: {}", e),
        }
        prune_stale(&self.state.store, self.stale_after, now.timestamp());

        let snapshot = {
            let tables = self.state.store.read();
            self.state.catalog.with_data(|catalog| {
                build_snapshot(&tables, catalog, self.max_vehicles, now, self.language)
            })
        };
        report.entries = snapshot.len();

        let document: Arc<str> = match serde_json::to_string(&snapshot) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                error!("failed to serialize snapshot: {}", e);
                return report;
            }
        };
        self.state.set_latest_snapshot(Arc::new(snapshot));

        let sent = self.state.subscribers.broadcast(document).await;
        report.delivered = sent.delivered;
        report.removed = sent.removed;
        debug!(
            entries = report.entries,
            delivered = report.delivered,
            removed = report.removed,
            "broadcast snapshot"
        );
        report
    }
}
