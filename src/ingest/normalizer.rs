//! Raw payload → typed event
//!
//! Inbound payloads look like:
//!
//! ```json
//! {"DEVICE_ID": 100000, "ID": 1, "TS": 1699000000, "Type": 6, "Details": {}}
//! ```
//!
//! The four identity/type fields must be present as integers. `Details` is
//! open-schema and defaults to an empty object.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::error::IngestError;
use super::event_type::{event_name, is_alert};
use crate::storage::{DeviceRecord, Event, RecordKind};

/// Parse a payload that must be a JSON object
pub fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, IngestError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(IngestError::MalformedPayload(format!(
            "expected object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(IngestError::MalformedPayload(e.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required_int(object: &Map<String, Value>, field: &'static str) -> Result<i64, IngestError> {
    object
        .get(field)
        .and_then(Value::as_i64)
        .ok_or(IngestError::Validation(field))
}

/// Validate and map an event payload
pub fn normalize_event(payload: &[u8], received_at: DateTime<Utc>) -> Result<Event, IngestError> {
    let mut object = parse_object(payload)?;

    let device_id = required_int(&object, "DEVICE_ID")?;
    let sequence_id = required_int(&object, "ID")?;
    let device_ts = required_int(&object, "TS")?;
    let type_code = required_int(&object, "Type")?;

    let details = match object.remove("Details") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(details) => details,
    };

    Ok(Event {
        sequence_id,
        device_id,
        device_ts,
        type_code,
        name: event_name(type_code).to_string(),
        details,
        alert: is_alert(type_code),
        received_at,
    })
}

/// Validate an auxiliary-stream payload; only `DEVICE_ID` is required
pub fn normalize_record(
    kind: RecordKind,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<DeviceRecord, IngestError> {
    let object = parse_object(payload)?;
    let device_id = required_int(&object, "DEVICE_ID")?;

    Ok(DeviceRecord {
        kind,
        device_id,
        payload: Value::Object(object),
        received_at,
    })
}
