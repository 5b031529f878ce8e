use crate::feed_types::{
    JsonStopTimeUpdate, JsonTripDescriptor, TripUpdateResponse, VehiclePositionResponse,
};
use crate::store::{StopTimeUpdate, TripRef, TripUpdate, VehiclePosition};
use compact_str::CompactString;
use gtfs_realtime::FeedMessage;
use prost::Message;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} answered HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("protobuf decode failed: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("json decode failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedFormat {
    Json,
    Protobuf,
}

/// Upstream realtime source. Either fetch failing aborts the whole poll.
pub trait FeedSource: Send + Sync {
    fn fetch_vehicle_positions(
        &self,
    ) -> impl Future<Output = Result<Vec<VehiclePosition>, FeedError>> + Send;

    fn fetch_trip_updates(&self) -> impl Future<Output = Result<Vec<TripUpdate>, FeedError>> + Send;
}

pub struct HttpFeedSource {
    client: reqwest::Client,
    vehicle_positions_url: String,
    trip_updates_url: String,
    format: FeedFormat,
}

impl HttpFeedSource {
    pub fn new(
        vehicle_positions_url: String,
        trip_updates_url: String,
        format: FeedFormat,
        timeout: Duration,
    ) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            vehicle_positions_url,
            trip_updates_url,
            format,
        })
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FeedError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FeedError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        let bytes = response.bytes().await?;
        debug!(url, len = bytes.len(), "fetched realtime feed");
        Ok(bytes.to_vec())
    }
}

impl FeedSource for HttpFeedSource {
    async fn fetch_vehicle_positions(&self) -> Result<Vec<VehiclePosition>, FeedError> {
        let body = self.fetch_bytes(&self.vehicle_positions_url).await?;
        decode_vehicle_positions(&body, self.format)
    }

    async fn fetch_trip_updates(&self) -> Result<Vec<TripUpdate>, FeedError> {
        let body = self.fetch_bytes(&self.trip_updates_url).await?;
        decode_trip_updates(&body, self.format)
    }
}

pub fn decode_vehicle_positions(
    body: &[u8],
    format: FeedFormat,
) -> Result<Vec<VehiclePosition>, FeedError> {
    match format {
        FeedFormat::Protobuf => {
            let msg = FeedMessage::decode(body)?;
            Ok(vehicle_positions_from_message(&msg))
        }
        FeedFormat::Json => {
            let resp: VehiclePositionResponse = serde_json::from_slice(body)?;
            Ok(vehicle_positions_from_json(resp))
        }
    }
}

pub fn decode_trip_updates(body: &[u8], format: FeedFormat) -> Result<Vec<TripUpdate>, FeedError> {
    match format {
        FeedFormat::Protobuf => {
            let msg = FeedMessage::decode(body)?;
            Ok(trip_updates_from_message(&msg))
        }
        FeedFormat::Json => {
            let resp: TripUpdateResponse = serde_json::from_slice(body)?;
            Ok(trip_updates_from_json(resp))
        }
    }
}

fn cs(value: &Option<String>) -> Option<CompactString> {
    value.as_deref().map(CompactString::from)
}

fn trip_ref_from_proto(td: &gtfs_realtime::TripDescriptor) -> TripRef {
    TripRef {
        trip_id: cs(&td.trip_id),
        route_id: cs(&td.route_id),
        start_date: cs(&td.start_date),
        start_time: cs(&td.start_time),
    }
}

fn trip_ref_from_json(td: Option<JsonTripDescriptor>) -> TripRef {
    match td {
        Some(td) => TripRef {
            trip_id: td.trip_id.map(CompactString::from),
            route_id: td.route_id.map(CompactString::from),
            start_date: td.start_date.map(CompactString::from),
            start_time: td.start_time.map(CompactString::from),
        },
        None => TripRef::default(),
    }
}

pub fn vehicle_positions_from_message(msg: &FeedMessage) -> Vec<VehiclePosition> {
    let mut out = Vec::new();
    for entity in &msg.entity {
        let Some(vp) = &entity.vehicle else {
            continue;
        };
        let descriptor = vp.vehicle.as_ref();
        let position = vp.position.as_ref();
        out.push(VehiclePosition {
            // Empty ids are kept here and rejected as rows by the store.
            vehicle_id: descriptor
                .and_then(|d| d.id.as_deref())
                .map(CompactString::from)
                .unwrap_or_default(),
            label: descriptor.and_then(|d| cs(&d.label)),
            trip: vp.trip.as_ref().map(trip_ref_from_proto).unwrap_or_default(),
            current_stop_sequence: vp.current_stop_sequence,
            stop_id: cs(&vp.stop_id),
            latitude: position.map(|p| p.latitude),
            longitude: position.map(|p| p.longitude),
            speed: position.and_then(|p| p.speed),
            timestamp: vp.timestamp,
        });
    }
    out
}

pub fn trip_updates_from_message(msg: &FeedMessage) -> Vec<TripUpdate> {
    let mut out = Vec::new();
    for entity in &msg.entity {
        let Some(tu) = &entity.trip_update else {
            continue;
        };
        let stop_time_updates = tu
            .stop_time_update
            .iter()
            .map(|stu| StopTimeUpdate {
                stop_sequence: stu.stop_sequence,
                stop_id: cs(&stu.stop_id),
                arrival_delay: stu.arrival.as_ref().and_then(|e| e.delay),
                arrival_uncertainty: stu.arrival.as_ref().and_then(|e| e.uncertainty),
                departure_delay: stu.departure.as_ref().and_then(|e| e.delay),
                departure_uncertainty: stu.departure.as_ref().and_then(|e| e.uncertainty),
            })
            .collect();
        out.push(TripUpdate {
            entity_id: CompactString::from(entity.id.as_str()),
            trip: trip_ref_from_proto(&tu.trip),
            vehicle_id: tu.vehicle.as_ref().and_then(|v| cs(&v.id)),
            timestamp: tu.timestamp,
            stop_time_updates,
        });
    }
    out
}

pub fn vehicle_positions_from_json(resp: VehiclePositionResponse) -> Vec<VehiclePosition> {
    let mut out = Vec::new();
    for entity in resp.entity {
        let Some(vp) = entity.vehicle else {
            continue;
        };
        let (nested_id, nested_label) = match vp.vehicle {
            Some(d) => (d.id, d.label),
            None => (None, None),
        };
        let vehicle_id = nested_id.or(vp.id).unwrap_or_default();
        let position = vp.position;
        out.push(VehiclePosition {
            vehicle_id: CompactString::from(vehicle_id),
            label: nested_label.or(vp.label).map(CompactString::from),
            trip: trip_ref_from_json(vp.trip),
            current_stop_sequence: vp.current_stop_sequence.and_then(|s| u32::try_from(s).ok()),
            stop_id: vp.stop_id.map(CompactString::from),
            latitude: position.as_ref().and_then(|p| p.latitude).map(|v| v as f32),
            longitude: position.as_ref().and_then(|p| p.longitude).map(|v| v as f32),
            speed: position.as_ref().and_then(|p| p.speed).map(|v| v as f32),
            timestamp: vp.timestamp,
        });
    }
    out
}

fn stop_time_from_json(stu: JsonStopTimeUpdate) -> StopTimeUpdate {
    StopTimeUpdate {
        stop_sequence: stu.stop_sequence.and_then(|s| u32::try_from(s).ok()),
        stop_id: stu.stop_id.map(CompactString::from),
        arrival_delay: stu.arrival.as_ref().and_then(|e| e.delay),
        arrival_uncertainty: stu.arrival.as_ref().and_then(|e| e.uncertainty),
        departure_delay: stu.departure.as_ref().and_then(|e| e.delay),
        departure_uncertainty: stu.departure.as_ref().and_then(|e| e.uncertainty),
    }
}

pub fn trip_updates_from_json(resp: TripUpdateResponse) -> Vec<TripUpdate> {
    let mut out = Vec::new();
    for entity in resp.entity {
        let Some(tu) = entity.trip_update else {
            continue;
        };
        out.push(TripUpdate {
            entity_id: CompactString::from(entity.id),
            trip: trip_ref_from_json(tu.trip),
            vehicle_id: tu.vehicle.and_then(|v| v.id).map(CompactString::from),
            timestamp: tu.timestamp,
            stop_time_updates: tu.stop_time_update.into_iter().map(stop_time_from_json).collect(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtfs_realtime::{
        FeedEntity, FeedHeader, TripDescriptor, VehicleDescriptor,
        trip_update::{StopTimeEvent, StopTimeUpdate as PbStopTimeUpdate},
    };

    fn encoded_message() -> Vec<u8> {
        let mut msg = FeedMessage::default();
        let mut header = FeedHeader::default();
        header.gtfs_realtime_version = "2.0".to_string();
        msg.header = header;

        let mut tu_entity = FeedEntity::default();
        tu_entity.id = "agency-T1-2-x".to_string();
        let mut tu = gtfs_realtime::TripUpdate::default();
        tu.trip.trip_id = Some("T1".to_string());
        tu.trip.route_id = Some("R1".to_string());
        let mut stu = PbStopTimeUpdate::default();
        stu.stop_sequence = Some(3);
        stu.stop_id = Some("S3".to_string());
        let mut dep = StopTimeEvent::default();
        dep.delay = Some(90);
        stu.departure = Some(dep);
        tu.stop_time_update.push(stu);
        tu_entity.trip_update = Some(tu);
        msg.entity.push(tu_entity);

        let mut vp_entity = FeedEntity::default();
        vp_entity.id = "vp-1".to_string();
        let mut vp = gtfs_realtime::VehiclePosition::default();
        let mut td = TripDescriptor::default();
        td.trip_id = Some("T1".to_string());
        vp.trip = Some(td);
        let mut vd = VehicleDescriptor::default();
        vd.id = Some("V1".to_string());
        vp.vehicle = Some(vd);
        vp.current_stop_sequence = Some(3);
        vp_entity.vehicle = Some(vp);
        msg.entity.push(vp_entity);

        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn decodes_protobuf_feed() {
        let body = encoded_message();

        let positions = decode_vehicle_positions(&body, FeedFormat::Protobuf).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].vehicle_id, "V1");
        assert_eq!(positions[0].trip.trip_id.as_deref(), Some("T1"));
        assert_eq!(positions[0].current_stop_sequence, Some(3));

        let updates = decode_trip_updates(&body, FeedFormat::Protobuf).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].entity_id, "agency-T1-2-x");
        assert_eq!(updates[0].stop_time_updates[0].departure_delay, Some(90));
    }

    #[test]
    fn decodes_json_feed() {
        let body = br#"{
            "header": {"gtfsRealtimeVersion": "2.0", "timestamp": "1735689600"},
            "entity": [{
                "id": "agency-T1-1-x",
                "tripUpdate": {
                    "trip": {"tripId": "T1", "routeId": "R1", "startDate": "20250101"},
                    "vehicle": {"id": "V1"},
                    "stopTimeUpdate": [
                        {"stopSequence": 3, "stopId": "S3", "departure": {"delay": 30, "uncertainty": 0}}
                    ]
                }
            }]
        }"#;
        let updates = decode_trip_updates(body, FeedFormat::Json).unwrap();
        assert_eq!(updates[0].vehicle_id.as_deref(), Some("V1"));
        assert_eq!(updates[0].trip.start_date.as_deref(), Some("20250101"));
        assert_eq!(updates[0].stop_time_updates[0].stop_sequence, Some(3));
        assert_eq!(updates[0].stop_time_updates[0].departure_delay, Some(30));
    }

    #[test]
    fn flattened_json_vehicle_id_is_accepted() {
        let body = br#"{"entity": [{"id": "e1", "vehicle": {"id": "V9", "label": "9", "currentStopSequence": 2}}]}"#;
        let positions = decode_vehicle_positions(body, FeedFormat::Json).unwrap();
        assert_eq!(positions[0].vehicle_id, "V9");
        assert_eq!(positions[0].label.as_deref(), Some("9"));
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        assert!(matches!(
            decode_vehicle_positions(b"<html>", FeedFormat::Json),
            Err(FeedError::Json(_))
        ));
        assert!(matches!(
            decode_trip_updates(&[0xff, 0xff, 0xff], FeedFormat::Protobuf),
            Err(FeedError::Protobuf(_))
        ));
    }
}
