use crate::store::RealtimeStore;
use compact_str::CompactString;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub vehicles: usize,
    pub trip_updates: usize,
}

/// Drops rows that no poll has written for longer than `threshold`.
/// Superseded trip update versions age out the same way.
pub fn prune_stale(store: &RealtimeStore, threshold: Duration, now: i64) -> PruneReport {
    let threshold_secs = threshold.as_secs() as i64;
    let mut tables = store.write();

    let vehicles_to_remove: Vec<CompactString> = tables
        .stored_positions()
        .filter(|(_, stored)| stored.observed_at + threshold_secs < now)
        .map(|(id, _)| id.clone())
        .collect();

    let trips_to_remove: Vec<CompactString> = tables
        .stored_trip_updates()
        .filter(|(_, stored)| stored.observed_at + threshold_secs < now)
        .map(|(id, _)| id.clone())
        .collect();

    let mut report = PruneReport::default();
    for id in &vehicles_to_remove {
        if tables.remove_vehicle(id).is_some() {
            report.vehicles += 1;
        }
    }
    for id in &trips_to_remove {
        if tables.remove_trip_update(id).is_some() {
            report.trip_updates += 1;
        }
    }

    if report.vehicles > 0 || report.trip_updates > 0 {
        info!(
            vehicles = report.vehicles,
            trip_updates = report.trip_updates,
            "GC: removed stale realtime rows"
        );
    }
    report
}
