use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TripRef {
    pub trip_id: Option<CompactString>,
    pub route_id: Option<CompactString>,
    pub start_date: Option<CompactString>,
    pub start_time: Option<CompactString>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VehiclePosition {
    pub vehicle_id: CompactString,
    pub label: Option<CompactString>,
    pub trip: TripRef,
    pub current_stop_sequence: Option<u32>,
    pub stop_id: Option<CompactString>,
    pub latitude: Option<f32>,
    pub longitude: Option<f32>,
    pub speed: Option<f32>,
    pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StopTimeUpdate {
    pub stop_sequence: Option<u32>,
    pub stop_id: Option<CompactString>,
    pub arrival_delay: Option<i32>,
    pub arrival_uncertainty: Option<i32>,
    pub departure_delay: Option<i32>,
    pub departure_uncertainty: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TripUpdate {
    pub entity_id: CompactString,
    pub trip: TripRef,
    pub vehicle_id: Option<CompactString>,
    pub timestamp: Option<u64>,
    pub stop_time_updates: Vec<StopTimeUpdate>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("vehicle position has no vehicle id")]
    MissingVehicleId,
    #[error("trip update has no entity id")]
    MissingEntityId,
    #[error("trip update {entity_id} has no trip id")]
    MissingTripId { entity_id: CompactString },
    #[error("trip update {entity_id} appears more than once in this poll")]
    DuplicateEntity { entity_id: CompactString },
    #[error("stop time update in {entity_id} has no stop sequence")]
    MissingStopSequence { entity_id: CompactString },
    #[error("stop time update ({entity_id}, {stop_sequence}) already exists")]
    DuplicateStopSequence {
        entity_id: CompactString,
        stop_sequence: u32,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredPosition {
    pub position: VehiclePosition,
    pub observed_at: i64,
}

/// One version of a trip's realtime update. Stop time rows are keyed by
/// stop sequence under their parent entity id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredTripUpdate {
    pub entity_id: CompactString,
    pub trip_id: CompactString,
    pub route_id: Option<CompactString>,
    pub start_date: Option<CompactString>,
    pub start_time: Option<CompactString>,
    pub vehicle_id: Option<CompactString>,
    pub timestamp: Option<u64>,
    pub observed_at: i64,
    pub stop_times: BTreeMap<u32, StopTimeUpdate>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RealtimeTables {
    positions: HashMap<CompactString, StoredPosition>,
    // Vehicle ids in the order of the most recent poll
    feed_order: Vec<CompactString>,
    trip_updates: HashMap<CompactString, StoredTripUpdate>,
    // TripID -> entity ids, in insertion order
    by_trip: HashMap<CompactString, Vec<CompactString>>,
}

impl RealtimeTables {
    pub fn vehicles(&self) -> impl Iterator<Item = &VehiclePosition> {
        self.feed_order
            .iter()
            .filter_map(|id| self.positions.get(id))
            .map(|stored| &stored.position)
    }

    #[cfg(test)]
    pub fn vehicle(&self, vehicle_id: &str) -> Option<&VehiclePosition> {
        self.positions.get(vehicle_id).map(|s| &s.position)
    }

    pub fn vehicle_count(&self) -> usize {
        self.positions.len()
    }

    pub fn trip_update(&self, entity_id: &str) -> Option<&StoredTripUpdate> {
        self.trip_updates.get(entity_id)
    }

    pub fn trip_update_count(&self) -> usize {
        self.trip_updates.len()
    }

    /// Every stored version referencing `trip_id`, oldest insertion first.
    pub fn trip_updates_for_trip(&self, trip_id: &str) -> Vec<&StoredTripUpdate> {
        self.by_trip
            .get(trip_id)
            .map(|ids| ids.iter().filter_map(|id| self.trip_updates.get(id)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn stored_positions(&self) -> impl Iterator<Item = (&CompactString, &StoredPosition)> {
        self.positions.iter()
    }

    pub(crate) fn stored_trip_updates(
        &self,
    ) -> impl Iterator<Item = (&CompactString, &StoredTripUpdate)> {
        self.trip_updates.iter()
    }

    pub(crate) fn remove_vehicle(&mut self, vehicle_id: &str) -> Option<StoredPosition> {
        let removed = self.positions.remove(vehicle_id)?;
        self.feed_order.retain(|id| id != vehicle_id);
        Some(removed)
    }

    pub(crate) fn remove_trip_update(&mut self, entity_id: &str) -> Option<StoredTripUpdate> {
        let removed = self.trip_updates.remove(entity_id)?;
        self.unlink_from_trip(&removed.trip_id, entity_id);
        Some(removed)
    }

    fn unlink_from_trip(&mut self, trip_id: &str, entity_id: &str) {
        if let Some(ids) = self.by_trip.get_mut(trip_id) {
            ids.retain(|id| id != entity_id);
            if ids.is_empty() {
                self.by_trip.remove(trip_id);
            }
        }
    }

    fn upsert_position(&mut self, position: VehiclePosition, observed_at: i64) {
        let id = position.vehicle_id.clone();
        self.positions.insert(
            id,
            StoredPosition {
                position,
                observed_at,
            },
        );
    }

    // Replaces an earlier row with the same entity id wholesale.
    fn put_trip_update(&mut self, row: StoredTripUpdate) {
        if let Some(previous) = self.trip_updates.remove(&row.entity_id) {
            if previous.trip_id != row.trip_id {
                self.unlink_from_trip(&previous.trip_id, &row.entity_id);
            }
        }
        let ids = self.by_trip.entry(row.trip_id.clone()).or_default();
        if !ids.contains(&row.entity_id) {
            ids.push(row.entity_id.clone());
        }
        self.trip_updates.insert(row.entity_id.clone(), row);
    }

    fn reorder_vehicles(&mut self, polled: Vec<CompactString>) {
        let rest: Vec<CompactString> = {
            let seen: HashSet<&CompactString> = polled.iter().collect();
            self.feed_order
                .iter()
                .filter(|id| !seen.contains(id))
                .cloned()
                .collect()
        };
        let mut order = polled;
        order.extend(rest);
        order.retain(|id| self.positions.contains_key(id));
        self.feed_order = order;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    pub vehicles: usize,
    pub trip_updates: usize,
    pub stop_time_updates: usize,
}

/// The mutable realtime store. Written only through [`Transaction`].
#[derive(Default)]
pub struct RealtimeStore {
    tables: RwLock<RealtimeTables>,
}

impl RealtimeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables(tables: RealtimeTables) -> Self {
        Self {
            tables: RwLock::new(tables),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RealtimeTables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, RealtimeTables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            positions: Vec::new(),
            position_index: HashMap::new(),
            trip_updates: Vec::new(),
            entity_ids: HashSet::new(),
        }
    }
}

/// Writes staged for one poll. Nothing reaches the store until
/// [`Transaction::commit`]; dropping the transaction discards it.
pub struct Transaction<'a> {
    store: &'a RealtimeStore,
    positions: Vec<VehiclePosition>,
    position_index: HashMap<CompactString, usize>,
    trip_updates: Vec<StoredTripUpdate>,
    entity_ids: HashSet<CompactString>,
}

impl Transaction<'_> {
    pub fn upsert_vehicle_position(&mut self, position: VehiclePosition) -> Result<(), RowError> {
        if position.vehicle_id.is_empty() {
            return Err(RowError::MissingVehicleId);
        }
        if let Some(&idx) = self.position_index.get(&position.vehicle_id) {
            self.positions[idx] = position;
        } else {
            self.position_index
                .insert(position.vehicle_id.clone(), self.positions.len());
            self.positions.push(position);
        }
        Ok(())
    }

    /// Stages one trip update. `Err` means the parent row was rejected;
    /// `Ok` carries the child rows that were skipped.
    pub fn insert_trip_update(&mut self, update: TripUpdate) -> Result<Vec<RowError>, RowError> {
        if update.entity_id.is_empty() {
            return Err(RowError::MissingEntityId);
        }
        let entity_id = update.entity_id;
        let Some(trip_id) = update.trip.trip_id.filter(|t| !t.is_empty()) else {
            return Err(RowError::MissingTripId { entity_id });
        };
        if self.entity_ids.contains(&entity_id) {
            return Err(RowError::DuplicateEntity { entity_id });
        }

        let mut skipped = Vec::new();
        let mut stop_times = BTreeMap::new();
        for stu in update.stop_time_updates {
            let Some(seq) = stu.stop_sequence else {
                skipped.push(RowError::MissingStopSequence {
                    entity_id: entity_id.clone(),
                });
                continue;
            };
            if stop_times.contains_key(&seq) {
                skipped.push(RowError::DuplicateStopSequence {
                    entity_id: entity_id.clone(),
                    stop_sequence: seq,
                });
                continue;
            }
            stop_times.insert(seq, stu);
        }

        self.entity_ids.insert(entity_id.clone());
        self.trip_updates.push(StoredTripUpdate {
            entity_id,
            trip_id,
            route_id: update.trip.route_id,
            start_date: update.trip.start_date,
            start_time: update.trip.start_time,
            vehicle_id: update.vehicle_id,
            timestamp: update.timestamp,
            observed_at: 0,
            stop_times,
        });
        Ok(skipped)
    }

    pub fn commit(self, observed_at: i64) -> CommitSummary {
        let mut summary = CommitSummary::default();
        let mut tables = self.store.write();

        if !self.positions.is_empty() {
            let mut polled = Vec::with_capacity(self.positions.len());
            for position in self.positions {
                polled.push(position.vehicle_id.clone());
                tables.upsert_position(position, observed_at);
                summary.vehicles += 1;
            }
            tables.reorder_vehicles(polled);
        }

        for mut row in self.trip_updates {
            row.observed_at = observed_at;
            summary.stop_time_updates += row.stop_times.len();
            summary.trip_updates += 1;
            tables.put_trip_update(row);
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(id: &str, trip: &str, seq: u32) -> VehiclePosition {
        VehiclePosition {
            vehicle_id: id.into(),
            trip: TripRef {
                trip_id: Some(trip.into()),
                ..Default::default()
            },
            current_stop_sequence: Some(seq),
            ..Default::default()
        }
    }

    fn stop_time(seq: Option<u32>, delay: i32) -> StopTimeUpdate {
        StopTimeUpdate {
            stop_sequence: seq,
            departure_delay: Some(delay),
            ..Default::default()
        }
    }

    fn trip_update(entity: &str, trip: &str, stus: Vec<StopTimeUpdate>) -> TripUpdate {
        TripUpdate {
            entity_id: entity.into(),
            trip: TripRef {
                trip_id: Some(trip.into()),
                ..Default::default()
            },
            stop_time_updates: stus,
            ..Default::default()
        }
    }

    #[test]
    fn nothing_is_visible_before_commit() {
        let store = RealtimeStore::new();
        let mut tx = store.begin();
        tx.upsert_vehicle_position(position("V1", "T1", 3)).unwrap();
        assert_eq!(store.read().vehicle_count(), 0);
        drop(tx);
        assert_eq!(store.read().vehicle_count(), 0);
    }

    #[test]
    fn vehicle_positions_are_last_write_wins() {
        let store = RealtimeStore::new();
        let mut tx = store.begin();
        tx.upsert_vehicle_position(position("V1", "T1", 3)).unwrap();
        tx.commit(100);

        let mut tx = store.begin();
        tx.upsert_vehicle_position(position("V1", "T1", 4)).unwrap();
        tx.commit(130);

        let tables = store.read();
        assert_eq!(tables.vehicle_count(), 1);
        assert_eq!(tables.vehicle("V1").unwrap().current_stop_sequence, Some(4));
    }

    #[test]
    fn feed_order_follows_latest_poll() {
        let store = RealtimeStore::new();
        let mut tx = store.begin();
        for id in ["A", "B", "C"] {
            tx.upsert_vehicle_position(position(id, "T", 1)).unwrap();
        }
        tx.commit(1);

        let mut tx = store.begin();
        for id in ["C", "A"] {
            tx.upsert_vehicle_position(position(id, "T", 1)).unwrap();
        }
        tx.commit(2);

        let order: Vec<_> = store
            .read()
            .vehicles()
            .map(|v| v.vehicle_id.to_string())
            .collect();
        assert_eq!(order, vec!["C", "A", "B"]);
    }

    #[test]
    fn versions_of_one_trip_coexist() {
        let store = RealtimeStore::new();
        let mut tx = store.begin();
        tx.insert_trip_update(trip_update("agency-T1-1-x", "T1", vec![stop_time(Some(3), 30)]))
            .unwrap();
        tx.insert_trip_update(trip_update("agency-T1-2-x", "T1", vec![stop_time(Some(3), 90)]))
            .unwrap();
        let summary = tx.commit(10);
        assert_eq!(summary.trip_updates, 2);
        assert_eq!(summary.stop_time_updates, 2);

        let tables = store.read();
        let versions = tables.trip_updates_for_trip("T1");
        let ids: Vec<_> = versions.iter().map(|tu| tu.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["agency-T1-1-x", "agency-T1-2-x"]);
        assert!(versions.iter().all(|tu| tu.stop_times.contains_key(&3)));
        assert!(tables.trip_updates_for_trip("T2").is_empty());
    }

    #[test]
    fn bad_rows_are_skipped_without_aborting() {
        let store = RealtimeStore::new();
        let mut tx = store.begin();

        assert_eq!(
            tx.upsert_vehicle_position(position("", "T1", 1)),
            Err(RowError::MissingVehicleId)
        );
        tx.upsert_vehicle_position(position("V1", "T1", 1)).unwrap();

        let mut no_trip = trip_update("a-T2-1-x", "T2", vec![]);
        no_trip.trip.trip_id = None;
        assert!(matches!(
            tx.insert_trip_update(no_trip),
            Err(RowError::MissingTripId { .. })
        ));

        let skipped = tx
            .insert_trip_update(trip_update(
                "a-T1-1-x",
                "T1",
                vec![stop_time(Some(1), 0), stop_time(None, 5), stop_time(Some(1), 9)],
            ))
            .unwrap();
        assert_eq!(skipped.len(), 2);

        assert!(matches!(
            tx.insert_trip_update(trip_update("a-T1-1-x", "T1", vec![])),
            Err(RowError::DuplicateEntity { .. })
        ));

        tx.commit(5);
        let tables = store.read();
        assert_eq!(tables.vehicle_count(), 1);
        assert_eq!(tables.trip_update_count(), 1);
        let stored = tables.trip_update("a-T1-1-x").unwrap();
        assert_eq!(stored.stop_times.len(), 1);
        // First row for a sequence is kept.
        assert_eq!(stored.stop_times[&1].departure_delay, Some(0));
    }

    #[test]
    fn reingesting_an_entity_replaces_it_wholesale() {
        let store = RealtimeStore::new();
        let mut tx = store.begin();
        tx.insert_trip_update(trip_update(
            "a-T1-1-x",
            "T1",
            vec![stop_time(Some(1), 10), stop_time(Some(2), 20)],
        ))
        .unwrap();
        tx.commit(1);

        let mut tx = store.begin();
        tx.insert_trip_update(trip_update("a-T1-1-x", "T1", vec![stop_time(Some(2), 25)]))
            .unwrap();
        tx.commit(2);

        let tables = store.read();
        let stored = tables.trip_update("a-T1-1-x").unwrap();
        assert_eq!(stored.observed_at, 2);
        assert_eq!(stored.stop_times.len(), 1);
        assert_eq!(stored.stop_times[&2].departure_delay, Some(25));
        assert_eq!(tables.trip_updates_for_trip("T1").len(), 1);
    }
}
