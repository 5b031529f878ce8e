use crate::entity_id::EntityId;
use crate::static_data::{CatalogData, ScheduledStop};
use crate::store::{RealtimeTables, StoredTripUpdate, VehiclePosition};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

/// Delays at or under this many seconds are shown as on time.
pub const DELAY_NOISE_THRESHOLD_SECS: u32 = 60;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimetableEntry {
    // Carries the display name; the key is kept for existing viewers.
    #[serde(rename = "route_id")]
    pub route_display_name: String,
    pub departure_time: String,
    pub delay: String,
    pub destination: String,
    pub remark: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Language {
    #[default]
    Japanese,
    English,
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ja" | "jp" | "japanese" => Ok(Language::Japanese),
            "en" | "english" => Ok(Language::English),
            other => Err(format!("unknown language '{}'", other)),
        }
    }
}

pub fn delay_description(delay_secs: i32, language: Language) -> String {
    if delay_secs.unsigned_abs() <= DELAY_NOISE_THRESHOLD_SECS {
        return String::new();
    }
    // Truncates toward zero
    let minutes = (delay_secs / 60).unsigned_abs();
    match (language, delay_secs > 0) {
        (Language::Japanese, true) => format!("遅れ 約{}分", minutes),
        (Language::Japanese, false) => format!("早着 約{}分", minutes),
        (Language::English, true) => format!("Delayed by about {} min", minutes),
        (Language::English, false) => format!("Early by about {} min", minutes),
    }
}

/// Seconds after midnight for an `HH:MM:SS` clock time. Hours past 23
/// are allowed for trips running over midnight.
pub fn parse_clock_time(s: &str) -> Option<u32> {
    let mut parts = s.trim().split(':');
    let h = parse_field(parts.next()?)?;
    let m = parse_field(parts.next()?)?;
    let sec = parse_field(parts.next()?)?;
    if parts.next().is_some() || m >= 60 || sec >= 60 {
        return None;
    }
    Some(h * 3600 + m * 60 + sec)
}

fn parse_field(field: &str) -> Option<u32> {
    if field.is_empty() || field.len() > 3 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

/// Anchors a clock time to `date` in `tz`. `None` on a malformed time or
/// a local time skipped by a DST gap.
pub fn departure_instant(clock: &str, date: NaiveDate, tz: Tz) -> Option<DateTime<Tz>> {
    let secs = parse_clock_time(clock)?;
    let naive = date.and_time(NaiveTime::MIN) + Duration::seconds(secs as i64);
    tz.from_local_datetime(&naive).earliest()
}

/// `17:05:00` -> `17:05`
pub fn display_clock_time(clock: &str) -> &str {
    match clock.rsplit_once(':') {
        Some((head, _)) => head,
        None => clock,
    }
}

/// The authoritative update for a trip: the first one seen with the
/// highest version ordinal. Updates whose entity id does not parse take no
/// part. Older versions are superseded even where the winner lacks a row
/// they carry.
pub fn select_latest<'a>(updates: &[&'a StoredTripUpdate]) -> Option<&'a StoredTripUpdate> {
    let mut best: Option<(EntityId, &'a StoredTripUpdate)> = None;
    for &tu in updates {
        let Some(id) = EntityId::parse(&tu.entity_id) else {
            debug!(entity_id = %tu.entity_id, "ignoring unparsable entity id");
            continue;
        };
        if best.as_ref().is_none_or(|(b, _)| id.version > b.version) {
            best = Some((id, tu));
        }
    }
    let (id, tu) = best?;
    debug!(logical_trip = %id.logical_trip, version = id.version, "selected trip update");
    Some(tu)
}

/// One reconciliation pass over at most `max_vehicles` vehicles in feed
/// order. Vehicles that cannot be resolved are left out; the snapshot is
/// sorted by departure.
pub fn build_snapshot(
    tables: &RealtimeTables,
    catalog: &CatalogData,
    max_vehicles: usize,
    now: DateTime<Tz>,
    language: Language,
) -> Vec<TimetableEntry> {
    let today = now.date_naive();
    let tz = now.timezone();

    let mut timed: Vec<(DateTime<Tz>, TimetableEntry)> = tables
        .vehicles()
        .take(max_vehicles)
        .filter_map(|vp| reconcile_vehicle(vp, tables, catalog, now, today, tz, language))
        .collect();

    timed.sort_by_key(|(at, _)| *at);
    timed.into_iter().map(|(_, entry)| entry).collect()
}

fn reconcile_vehicle(
    vp: &VehiclePosition,
    tables: &RealtimeTables,
    catalog: &CatalogData,
    now: DateTime<Tz>,
    today: NaiveDate,
    tz: Tz,
    language: Language,
) -> Option<(DateTime<Tz>, TimetableEntry)> {
    let trip_id = vp.trip.trip_id.as_deref()?;

    let Some(scheduled) = scheduled_stop(vp, trip_id, catalog) else {
        debug!(vehicle_id = %vp.vehicle_id, trip_id, "no scheduled stop");
        return None;
    };

    let versions = tables.trip_updates_for_trip(trip_id);
    let trip_update = select_latest(&versions)?;

    let clock = scheduled.departure_time.as_deref()?;
    let Some(departs_at) = departure_instant(clock, today, tz) else {
        debug!(vehicle_id = %vp.vehicle_id, clock, "unparsable departure time");
        return None;
    };
    if departs_at < now {
        return None;
    }

    let route_name = catalog
        .trip_route_id(trip_id)
        .or(vp.trip.route_id.as_deref())
        .or(trip_update.route_id.as_deref())
        .and_then(|route_id| catalog.route_display_name(route_id))
        .unwrap_or_default();

    // The latest version not covering this stop means no known delay.
    let delay = trip_update
        .stop_times
        .get(&scheduled.stop_sequence)
        .and_then(|stu| stu.departure_delay)
        .unwrap_or(0);

    Some((
        departs_at,
        TimetableEntry {
            route_display_name: route_name.to_string(),
            departure_time: display_clock_time(clock).to_string(),
            delay: delay_description(delay, language),
            destination: scheduled.headsign.to_string(),
            remark: String::new(),
        },
    ))
}

// Vehicles that report only a stop id are placed by the trip's first visit
// to that stop.
fn scheduled_stop<'a>(
    vp: &VehiclePosition,
    trip_id: &str,
    catalog: &'a CatalogData,
) -> Option<&'a ScheduledStop> {
    match (vp.current_stop_sequence, vp.stop_id.as_deref()) {
        (Some(seq), _) => catalog.scheduled_departure(trip_id, seq),
        (None, Some(stop_id)) => catalog.scheduled_departure_at_stop(trip_id, stop_id),
        (None, None) => None,
    }
}
