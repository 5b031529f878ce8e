use anyhow::Result;
use chrono::NaiveDate;
use chrono_tz::Tz;
use compact_str::CompactString;
use gtfs_structures::Gtfs;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;
use tracing::{error, info};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledStop {
    pub stop_sequence: u32,
    pub stop_id: CompactString,
    // HH:MM:SS, hours may exceed 23
    pub departure_time: Option<CompactString>,
    pub headsign: CompactString,
}

#[derive(Clone, Debug, Default)]
pub struct Route {
    pub short_name: Option<CompactString>,
    pub long_name: Option<CompactString>,
}

#[derive(Clone, Debug, Default)]
pub struct TripSchedule {
    pub route_id: CompactString,
    pub stops: BTreeMap<u32, ScheduledStop>,
}

/// Read-only view over the imported schedule.
#[derive(Default)]
pub struct CatalogData {
    routes: HashMap<CompactString, Route>,
    trips: HashMap<CompactString, TripSchedule>,
    feed_end_date: Option<NaiveDate>,
}

impl CatalogData {
    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }

    pub fn trip_count(&self) -> usize {
        self.trips.len()
    }

    pub fn feed_end_date(&self) -> Option<NaiveDate> {
        self.feed_end_date
    }

    pub fn set_feed_end_date(&mut self, date: Option<NaiveDate>) {
        self.feed_end_date = date;
    }

    /// The feed is expired once today reaches its end date. A feed that
    /// never declared one does not expire.
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.feed_end_date.is_some_and(|end| today >= end)
    }

    pub fn insert_route(&mut self, route_id: &str, route: Route) {
        self.routes.insert(CompactString::from(route_id), route);
    }

    pub fn insert_trip(&mut self, trip_id: &str, route_id: &str) {
        self.trips
            .entry(CompactString::from(trip_id))
            .or_default()
            .route_id = CompactString::from(route_id);
    }

    pub fn insert_scheduled_stop(&mut self, trip_id: &str, stop: ScheduledStop) {
        self.trips
            .entry(CompactString::from(trip_id))
            .or_default()
            .stops
            .insert(stop.stop_sequence, stop);
    }

    pub fn scheduled_departure(&self, trip_id: &str, stop_sequence: u32) -> Option<&ScheduledStop> {
        self.trips.get(trip_id)?.stops.get(&stop_sequence)
    }

    // First visit in sequence order when a trip serves the stop twice.
    pub fn scheduled_departure_at_stop(&self, trip_id: &str, stop_id: &str) -> Option<&ScheduledStop> {
        self.trips
            .get(trip_id)?
            .stops
            .values()
            .find(|s| s.stop_id == stop_id)
    }

    pub fn trip_route_id(&self, trip_id: &str) -> Option<&str> {
        self.trips
            .get(trip_id)
            .map(|t| t.route_id.as_str())
            .filter(|r| !r.is_empty())
    }

    pub fn route_display_name(&self, route_id: &str) -> Option<&str> {
        let route = self.routes.get(route_id)?;
        route
            .long_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(route.short_name.as_deref().filter(|n| !n.is_empty()))
    }

    pub fn from_gtfs(gtfs: &Gtfs) -> Self {
        let mut data = CatalogData::default();

        for (route_id, route) in &gtfs.routes {
            data.insert_route(
                route_id,
                Route {
                    short_name: route.short_name.as_deref().map(CompactString::from),
                    long_name: route.long_name.as_deref().map(CompactString::from),
                },
            );
        }
        info!(routes = data.routes.len(), "built route index");

        for (trip_id, trip) in &gtfs.trips {
            let trip_headsign = trip.trip_headsign.as_deref().unwrap_or_default();
            data.insert_trip(trip_id, &trip.route_id);
            for st in &trip.stop_times {
                let headsign = st
                    .stop_headsign
                    .as_deref()
                    .filter(|h| !h.is_empty())
                    .unwrap_or(trip_headsign);
                data.insert_scheduled_stop(
                    trip_id,
                    ScheduledStop {
                        stop_sequence: st.stop_sequence,
                        stop_id: CompactString::from(&st.stop.id),
                        departure_time: st.departure_time.map(format_clock_time),
                        headsign: CompactString::from(headsign),
                    },
                );
            }
        }
        info!(trips = data.trip_count(), "built stop time index");

        data.set_feed_end_date(gtfs.feed_info.iter().filter_map(|f| f.end_date).max());
        data
    }
}

pub fn format_clock_time(seconds: u32) -> CompactString {
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    compact_str::format_compact!("{:02}:{:02}:{:02}", h, m, s)
}

pub struct StaticCatalog {
    source: String,
    // Swapped wholesale on refresh; readers never see a half-built catalog
    data: Arc<RwLock<CatalogData>>,
}

impl StaticCatalog {
    pub fn new(source: String) -> Self {
        Self {
            source,
            data: Arc::new(RwLock::new(CatalogData::default())),
        }
    }

    #[cfg(test)]
    pub fn from_data(data: CatalogData) -> Self {
        Self {
            source: String::new(),
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&CatalogData) -> R) -> R {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        f(&data)
    }

    pub fn replace(&self, new_data: CatalogData) {
        let mut d = self.data.write().unwrap_or_else(|e| e.into_inner());
        *d = new_data;
    }

    pub fn load_initial(&self) -> Result<()> {
        info!(source = %self.source, "performing initial GTFS load");
        let gtfs = Self::download_and_load(&self.source)?;
        let data = CatalogData::from_gtfs(&gtfs);
        info!(
            trips = data.trip_count(),
            end_date = ?data.feed_end_date(),
            "initial GTFS load complete"
        );
        self.replace(data);
        Ok(())
    }

    /// Background freshness check. Reloads when the catalog is empty or
    /// its feed end date has been reached; a failed reload keeps the
    /// current catalog.
    pub fn start_updater(&self, check_every: Duration, tz: Tz) {
        let data = self.data.clone();
        let source = self.source.clone();

        thread::spawn(move || {
            loop {
                let today = chrono::Utc::now().with_timezone(&tz).date_naive();
                let needs_refresh = {
                    let d = data.read().unwrap_or_else(|e| e.into_inner());
                    d.is_empty() || d.is_expired(today)
                };
                if !needs_refresh {
                    thread::sleep(check_every);
                    continue;
                }

                info!(%today, "static feed missing or expired, refreshing");
                match Self::download_and_load(&source) {
                    Ok(gtfs) => {
                        let new_data = CatalogData::from_gtfs(&gtfs);
                        if new_data.is_expired(today) {
                            error!("refreshed static feed is still past its end date");
                        }
                        info!(
                            trips = new_data.trip_count(),
                            end_date = ?new_data.feed_end_date(),
                            "static catalog refreshed"
                        );
                        let mut d = data.write().unwrap_or_else(|e| e.into_inner());
                        *d = new_data;
                    }
                    Err(e) => error!("failed to refresh static catalog: {:?}", e),
                }
                thread::sleep(check_every);
            }
        });
    }

    fn download_and_load(source: &str) -> Result<Gtfs> {
        let gtfs = Gtfs::new(source).map_err(|e| anyhow::anyhow!("Gtfs error: {:?}", e))?;
        info!("read GTFS static feed");
        Ok(gtfs)
    }
}
