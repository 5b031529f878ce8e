use crate::static_data::StaticCatalog;
use crate::store::RealtimeStore;
use crate::subscribers::SubscriberRegistry;
use crate::timetable::TimetableEntry;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub struct AppState {
    // Written by the ingestor, read by reconciliation and persistence
    pub store: Arc<RealtimeStore>,

    pub catalog: Arc<StaticCatalog>,

    pub subscribers: Arc<SubscriberRegistry>,

    // Last broadcast snapshot, served to plain HTTP readers
    pub latest_snapshot: RwLock<Arc<Vec<TimetableEntry>>>,
}

impl AppState {
    pub fn new(store: RealtimeStore, catalog: StaticCatalog, send_timeout: Duration) -> Self {
        Self {
            store: Arc::new(store),
            catalog: Arc::new(catalog),
            subscribers: Arc::new(SubscriberRegistry::new(send_timeout)),
            latest_snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn latest_snapshot(&self) -> Arc<Vec<TimetableEntry>> {
        self.latest_snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_latest_snapshot(&self, snapshot: Arc<Vec<TimetableEntry>>) {
        *self.latest_snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }
}
