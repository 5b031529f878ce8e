// JSON rendering of the GTFS-Realtime feed (`output=json`).
// Field names are camelCase; 64-bit integers may arrive as strings.
use serde::{Deserialize, Deserializer};

#[derive(Debug, Deserialize)]
pub struct VehiclePositionResponse {
    #[serde(rename = "entity", default)]
    pub entity: Vec<VehicleEntity>,
}

#[derive(Debug, Deserialize)]
pub struct VehicleEntity {
    #[serde(rename = "id", default)]
    pub id: String,
    #[serde(rename = "vehicle")]
    pub vehicle: Option<JsonVehiclePosition>,
}

#[derive(Debug, Deserialize)]
pub struct JsonVehiclePosition {
    #[serde(rename = "currentStopSequence", default, deserialize_with = "lenient_u64")]
    pub current_stop_sequence: Option<u64>,
    #[serde(rename = "position")]
    pub position: Option<JsonPosition>,
    #[serde(rename = "stopId")]
    pub stop_id: Option<String>,
    #[serde(rename = "timestamp", default, deserialize_with = "lenient_u64")]
    pub timestamp: Option<u64>,
    #[serde(rename = "trip")]
    pub trip: Option<JsonTripDescriptor>,
    #[serde(rename = "vehicle")]
    pub vehicle: Option<JsonVehicleDescriptor>,
    // Some producers flatten the descriptor onto the position.
    #[serde(rename = "id")]
    pub id: Option<String>,
    #[serde(rename = "label")]
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JsonPosition {
    #[serde(rename = "latitude")]
    pub latitude: Option<f64>,
    #[serde(rename = "longitude")]
    pub longitude: Option<f64>,
    #[serde(rename = "speed")]
    pub speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct JsonTripDescriptor {
    #[serde(rename = "tripId")]
    pub trip_id: Option<String>,
    #[serde(rename = "routeId")]
    pub route_id: Option<String>,
    #[serde(rename = "startDate")]
    pub start_date: Option<String>,
    #[serde(rename = "startTime")]
    pub start_time: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JsonVehicleDescriptor {
    #[serde(rename = "id")]
    pub id: Option<String>,
    #[serde(rename = "label")]
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TripUpdateResponse {
    #[serde(rename = "entity", default)]
    pub entity: Vec<TripUpdateEntity>,
}

#[derive(Debug, Deserialize)]
pub struct TripUpdateEntity {
    #[serde(rename = "id", default)]
    pub id: String,
    #[serde(rename = "tripUpdate")]
    pub trip_update: Option<JsonTripUpdate>,
}

#[derive(Debug, Deserialize)]
pub struct JsonTripUpdate {
    #[serde(rename = "stopTimeUpdate", default)]
    pub stop_time_update: Vec<JsonStopTimeUpdate>,
    #[serde(rename = "trip")]
    pub trip: Option<JsonTripDescriptor>,
    #[serde(rename = "vehicle")]
    pub vehicle: Option<JsonVehicleDescriptor>,
    #[serde(rename = "timestamp", default, deserialize_with = "lenient_u64")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct JsonStopTimeUpdate {
    #[serde(rename = "arrival")]
    pub arrival: Option<JsonStopTimeEvent>,
    #[serde(rename = "departure")]
    pub departure: Option<JsonStopTimeEvent>,
    #[serde(rename = "stopId")]
    pub stop_id: Option<String>,
    #[serde(rename = "stopSequence", default, deserialize_with = "lenient_u64")]
    pub stop_sequence: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct JsonStopTimeEvent {
    #[serde(rename = "delay")]
    pub delay: Option<i32>,
    #[serde(rename = "uncertainty")]
    pub uncertainty: Option<i32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<NumberOrString> = Option::deserialize(deserializer)?;
    Ok(match value {
        Some(NumberOrString::Number(n)) => Some(n),
        Some(NumberOrString::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}
