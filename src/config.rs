use crate::feed::FeedFormat;
use crate::timetable::Language;
use chrono_tz::Tz;
use std::time::Duration;
use thiserror::Error;

const PTD_BASE: &str = "https://www.ptd-hs.jp";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub static_source: String,
    pub vehicle_positions_url: String,
    pub trip_updates_url: String,
    pub feed_format: FeedFormat,
    pub broadcast_interval: Duration,
    pub max_vehicles: usize,
    pub fetch_timeout: Duration,
    pub send_timeout: Duration,
    pub timezone: Tz,
    pub language: Language,
    pub data_dir: String,
    pub stale_after: Duration,
    pub catalog_check: Duration,
    pub has_credentials: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let uid = get("PTD_UID").unwrap_or_default();
        let agency_id = get("PTD_AGENCY_ID").unwrap_or_default();

        let vehicle_positions_url = get("GTFS_RT_VEHICLE_POSITIONS_URL").unwrap_or_else(|| {
            format!(
                "{}/GetVehiclePosition?uid={}&agency_id={}&output=json",
                PTD_BASE, uid, agency_id
            )
        });
        let trip_updates_url = get("GTFS_RT_TRIP_UPDATES_URL").unwrap_or_else(|| {
            format!(
                "{}/GetTripUpdate?uid={}&agency_id={}&output=json",
                PTD_BASE, uid, agency_id
            )
        });

        let feed_format = match get("GTFS_RT_FORMAT").as_deref() {
            None | Some("json") => FeedFormat::Json,
            Some("protobuf") | Some("pb") => FeedFormat::Protobuf,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "GTFS_RT_FORMAT",
                    reason: format!("unknown format '{}'", other),
                });
            }
        };

        let timezone = match get("TIMEZONE") {
            Some(name) => name.parse::<Tz>().map_err(|e| ConfigError::Invalid {
                key: "TIMEZONE",
                reason: e.to_string(),
            })?,
            None => chrono_tz::Asia::Tokyo,
        };

        let language = match get("LANGUAGE") {
            Some(lang) => lang
                .parse::<Language>()
                .map_err(|reason| ConfigError::Invalid {
                    key: "LANGUAGE",
                    reason,
                })?,
            None => Language::default(),
        };

        Ok(Self {
            port: parse_or(&get, "PORT", 8888)?,
            static_source: get("GTFS_STATIC_SOURCE").unwrap_or_else(|| "./static/gtfs.zip".to_string()),
            vehicle_positions_url,
            trip_updates_url,
            feed_format,
            broadcast_interval: Duration::from_secs(parse_or(&get, "BROADCAST_INTERVAL_SECS", 30)?.max(1)),
            max_vehicles: parse_or(&get, "MAX_VEHICLES", 128)?,
            fetch_timeout: Duration::from_secs(parse_or(&get, "FETCH_TIMEOUT_SECS", 10)?),
            send_timeout: Duration::from_millis(parse_or(&get, "SEND_TIMEOUT_MS", 2000)?),
            timezone,
            language,
            data_dir: get("DATA_DIR").unwrap_or_else(|| "./data".to_string()),
            stale_after: Duration::from_secs(parse_or(&get, "STALE_AFTER_SECS", 3600)?),
            catalog_check: Duration::from_secs(parse_or(&get, "CATALOG_CHECK_SECS", 3600)?.max(1)),
            has_credentials: !uid.is_empty(),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            reason: format!("'{}': {}", raw, e),
        }),
        None => Ok(default),
    }
}
