//! Device event type table
//!
//! Type codes are assigned by the device firmware. The table and the alert
//! set are fixed lookup data.

/// Type code of events that carry the serving cell tower
pub const LOCATION: i64 = 1;

/// Name used for codes missing from the table
pub const UNKNOWN_EVENT: &str = "UNKNOWN_EVENT";

const EVENT_NAMES: [&str; 29] = [
    "LOCATION",
    "GUEST_REGISTRATION",
    "MEMBER_GUEST_DECLARATION",
    "CONFIGURATION",
    "TAMPER_ALARM",
    "SOS_ALARM",
    "BATTERY_ALARM",
    "METER_INSTALLATION",
    "VOLTAGE_STATS",
    "TEMPERATURE_STATS",
    "NTP_SYNC",
    "AUDIENCE_SESSION_CLOSE",
    "NETWORK_LATCH",
    "REMOTE_PAIRING",
    "REMOTE_ACTIVITY",
    "SIM_ALERT",
    "SYSTEM_ALARM",
    "SYSTEM_INFO",
    "CONFIG_UPDATE",
    "ALIVE",
    "METER_OTA",
    "BATTERY_VOLTAGE",
    "BOOT",
    "BOOT_V2",
    "STB",
    "DERIVED_TV_STATUS",
    "AUDIO_SOURCE",
    "AUDIO_FINGERPRINT",
    "LOGO_DETECTED",
];

/// TAMPER_ALARM, SOS_ALARM, BATTERY_ALARM, SIM_ALERT, SYSTEM_ALARM
const ALERT_CODES: [i64; 5] = [5, 6, 7, 16, 17];

/// Semantic name for a type code (1-based)
pub fn event_name(code: i64) -> &'static str {
    usize::try_from(code)
        .ok()
        .and_then(|c| c.checked_sub(1))
        .and_then(|idx| EVENT_NAMES.get(idx))
        .copied()
        .unwrap_or(UNKNOWN_EVENT)
}

pub fn is_alert(code: i64) -> bool {
    ALERT_CODES.contains(&code)
}
