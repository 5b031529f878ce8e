use crate::feed::{FeedError, FeedSource};
use crate::store::{CommitSummary, RealtimeStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub committed: CommitSummary,
    pub skipped_rows: usize,
}

pub struct Ingestor<S> {
    source: S,
    store: Arc<RealtimeStore>,
}

impl<S: FeedSource> Ingestor<S> {
    pub fn new(source: S, store: Arc<RealtimeStore>) -> Self {
        Self { source, store }
    }

    #[cfg(test)]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetches both feeds, then writes everything in one transaction. A
    /// fetch or decode failure leaves the store untouched; a bad row only
    /// costs that row.
    pub async fn ingest(&self) -> Result<IngestReport, FeedError> {
        let positions = self.source.fetch_vehicle_positions().await?;
        let trip_updates = self.source.fetch_trip_updates().await?;

        let mut report = IngestReport::default();
        let mut tx = self.store.begin();

        for position in positions {
            if let Err(e) = tx.upsert_vehicle_position(position) {
                warn!("skipping vehicle position: {}", e);
                report.skipped_rows += 1;
            }
        }

        for update in trip_updates {
            match tx.insert_trip_update(update) {
                Ok(skipped) => {
                    for e in &skipped {
                        warn!("skipping stop time update: {}", e);
                    }
                    report.skipped_rows += skipped.len();
                }
                Err(e) => {
                    warn!("skipping trip update: {}", e);
                    report.skipped_rows += 1;
                }
            }
        }

        report.committed = tx.commit(Utc::now().timestamp());
        info!(
            vehicles = report.committed.vehicles,
            trip_updates = report.committed.trip_updates,
            stop_time_updates = report.committed.stop_time_updates,
            skipped = report.skipped_rows,
            "ingested realtime feed"
        );
        Ok(report)
    }
}
