use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One location sample in the GeoJSON Feature shape the reporting
/// devices post. `_id` is assigned by the store gateway on insert and
/// absent on the wire until then. Once persisted a record is never
/// mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: LocationProperties,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationProperties {
    /// Normalized at the serde boundary: devices send epoch
    /// milliseconds or RFC 3339 text, we store and emit RFC 3339 UTC.
    #[serde(
        default,
        with = "timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<Value>,
    /// Anything else the device reported rides along on the raw path
    /// and is stripped by obfuscation.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    /// `[longitude, latitude]` in degrees.
    pub coordinates: [f64; 2],
}

/// What the bus carries: the record plus its timestamp as a
/// transport-level resumption hint (SSE event id), not a uniqueness key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    #[serde(default, with = "timestamp")]
    pub id: Option<DateTime<Utc>>,
    pub data: LocationRecord,
}

impl BroadcastEvent {
    pub fn for_location(location: LocationRecord) -> Self {
        Self {
            id: location.properties.timestamp,
            data: location,
        }
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) mod timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Float(f64),
        Text(String),
    }

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&super::format_timestamp(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<Raw>::deserialize(deserializer)?;
        // Unparseable values degrade to None instead of rejecting the
        // record; the obfuscation seed treats a missing timestamp as 0.
        Ok(raw.and_then(|raw| match raw {
            Raw::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
            Raw::Float(ms) => Utc.timestamp_millis_opt(ms as i64).single(),
            Raw::Text(text) => DateTime::parse_from_rfc3339(&text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_json(timestamp: &str) -> String {
        format!(
            r#"{{
                "type": "Feature",
                "properties": {{
                    "timestamp": {timestamp},
                    "battery_state": "charging",
                    "battery_level": 0.8,
                    "speed": 4.2
                }},
                "geometry": {{ "type": "Point", "coordinates": [13.4, 52.5] }}
            }}"#
        )
    }

    #[test]
    fn timestamp_deserializes_from_epoch_millis() {
        let record: LocationRecord = serde_json::from_str(&sample_json("1700000000000")).unwrap();
        assert_eq!(
            record.properties.timestamp,
            Utc.timestamp_millis_opt(1_700_000_000_000).single()
        );
    }

    #[test]
    fn timestamp_deserializes_from_rfc3339() {
        let record: LocationRecord =
            serde_json::from_str(&sample_json("\"2023-11-14T22:13:20.000Z\"")).unwrap();
        assert_eq!(
            record.properties.timestamp,
            Utc.timestamp_millis_opt(1_700_000_000_000).single()
        );
    }

    #[test]
    fn garbled_timestamp_degrades_to_none() {
        let record: LocationRecord =
            serde_json::from_str(&sample_json("\"not a date\"")).unwrap();
        assert_eq!(record.properties.timestamp, None);
    }

    #[test]
    fn missing_id_and_timestamp_are_omitted_on_serialize() {
        let record: LocationRecord = serde_json::from_str(&sample_json("null")).unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("_id").is_none());
        assert!(json["properties"].get("timestamp").is_none());
    }

    #[test]
    fn extra_properties_round_trip() {
        let record: LocationRecord = serde_json::from_str(&sample_json("1700000000000")).unwrap();
        assert_eq!(record.properties.extra["speed"], 4.2);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["properties"]["speed"], 4.2);
    }

    #[test]
    fn timestamp_serializes_as_rfc3339_millis() {
        let record: LocationRecord = serde_json::from_str(&sample_json("1700000000000")).unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["properties"]["timestamp"], "2023-11-14T22:13:20.000Z");
    }

    #[test]
    fn broadcast_event_id_is_the_record_timestamp() {
        let record: LocationRecord = serde_json::from_str(&sample_json("1700000000000")).unwrap();
        let event = BroadcastEvent::for_location(record.clone());
        assert_eq!(event.id, record.properties.timestamp);
    }
}
