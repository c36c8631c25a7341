//! Core data types for the Meterline event store
//!
//! - `Event`: a validated device event, keyed by its identity triple
//! - `EventIdentity`: (device id, sequence id, device timestamp)
//! - `DeviceLocation`: last resolved position of a device
//! - `DeviceRecord`: auxiliary payloads (configuration, sensor, feedback)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of an event as reported by the device.
///
/// Unique across all persisted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventIdentity {
    pub device_id: i64,
    pub sequence_id: i64,
    pub device_ts: i64,
}

impl EventIdentity {
    pub fn new(device_id: i64, sequence_id: i64, device_ts: i64) -> Self {
        Self {
            device_id,
            sequence_id,
            device_ts,
        }
    }
}

impl std::fmt::Display for EventIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.device_id, self.sequence_id, self.device_ts)
    }
}

/// A validated device event
///
/// Serializes with the field names devices and dashboards already use,
/// so the same JSON is pushed to observers and stored as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "ID")]
    pub sequence_id: i64,
    #[serde(rename = "DEVICE_ID")]
    pub device_id: i64,
    /// Device-side timestamp (epoch seconds)
    #[serde(rename = "TS")]
    pub device_ts: i64,
    #[serde(rename = "Type")]
    pub type_code: i64,
    #[serde(rename = "Event_Name")]
    pub name: String,
    #[serde(rename = "Details", default = "empty_details")]
    pub details: Value,
    #[serde(rename = "Alert", default)]
    pub alert: bool,
    pub received_at: DateTime<Utc>,
}

fn empty_details() -> Value {
    Value::Object(Default::default())
}

impl Event {
    pub fn identity(&self) -> EventIdentity {
        EventIdentity::new(self.device_id, self.sequence_id, self.device_ts)
    }
}

/// Last known position of a device; one row per device id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLocation {
    pub device_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub address: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Stream an auxiliary record arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Device configuration snapshot
    Config,
    /// Auxiliary sensor reading
    Sensor,
    /// Acknowledgement of a control command
    Feedback,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Config => "config",
            RecordKind::Sensor => "sensor",
            RecordKind::Feedback => "feedback",
        }
    }
}

/// Raw payload from one of the auxiliary streams, appended without dedup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub kind: RecordKind,
    pub device_id: i64,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

/// Outcome of a bulk insert-if-absent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertReport {
    /// Rows written
    pub inserted: usize,
    /// Rows skipped because the identity already existed
    pub ignored: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_names() {
        let event = Event {
            sequence_id: 1,
            device_id: 100000,
            device_ts: 1000,
            type_code: 6,
            name: "SOS_ALARM".to_string(),
            details: json!({}),
            alert: true,
            received_at: Utc::now(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["ID"], 1);
        assert_eq!(value["DEVICE_ID"], 100000);
        assert_eq!(value["TS"], 1000);
        assert_eq!(value["Type"], 6);
        assert_eq!(value["Event_Name"], "SOS_ALARM");
        assert_eq!(value["Alert"], true);
        assert!(value["received_at"].is_string());
    }

    #[test]
    fn test_identity_display() {
        let id = EventIdentity::new(7, 3, 1699000000);
        assert_eq!(id.to_string(), "7/3@1699000000");
    }

    #[test]
    fn test_record_kind_names() {
        assert_eq!(RecordKind::Config.as_str(), "config");
        assert_eq!(
            serde_json::to_string(&RecordKind::Feedback).unwrap(),
            "\"feedback\""
        );
    }
}
