use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::bucket::day_start;

/// Topic namespace every meter publishes under.
pub const METER_TOPIC_PREFIX: &str = "energy/meters";

/// One telemetry sample from one meter.
///
/// This is both the wire payload (JSON, RFC 3339 timestamp with offset) and the
/// `energy_readings` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub meter_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub power: f64,
    pub voltage: f64,
    pub current: f64,
    pub frequency: f64,
    /// Energy delivered during one sampling interval, not a running total.
    pub energy: f64,
}

/// Idempotency key of a stored reading.
pub type ReadingKey = (String, OffsetDateTime);

impl Reading {
    pub fn key(&self) -> ReadingKey {
        (self.meter_id.clone(), self.timestamp)
    }

    pub fn topic(&self) -> String {
        meter_topic(&self.meter_id)
    }

    /// Start of the UTC day this reading belongs to.
    pub fn day(&self) -> OffsetDateTime {
        day_start(self.timestamp)
    }

    pub fn has_finite_fields(&self) -> bool {
        [self.power, self.voltage, self.current, self.frequency, self.energy]
            .iter()
            .all(|v| v.is_finite())
    }
}

pub fn meter_topic(meter_id: &str) -> String {
    format!("{METER_TOPIC_PREFIX}/{meter_id}")
}

/// Subscription filter matching every meter topic.
pub fn meter_wildcard() -> String {
    format!("{METER_TOPIC_PREFIX}/#")
}

/// Region grouping key: the first `prefix_len` characters of the meter id.
///
/// Matches SQL `LEFT(meter_id, n)`, so ids shorter than the prefix are their own region.
pub fn region_key(meter_id: &str, prefix_len: usize) -> &str {
    match meter_id.char_indices().nth(prefix_len) {
        Some((idx, _)) => &meter_id[..idx],
        None => meter_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample() -> Reading {
        Reading {
            meter_id: "1000000042".to_string(),
            timestamp: datetime!(2025-03-01 18:05:00 +02:00),
            power: 312.5,
            voltage: 229.1,
            current: 1.36,
            frequency: 50.02,
            energy: 26.04,
        }
    }

    #[test]
    fn wire_payload_uses_rfc3339_timestamp_with_offset() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["timestamp"], "2025-03-01T18:05:00+02:00");
        assert_eq!(json["meter_id"], "1000000042");
    }

    #[test]
    fn decodes_python_style_isoformat() {
        let payload = r#"{"meter_id":"1000000001","timestamp":"2025-05-01T12:00:00.123456+00:00",
            "power":120.0,"voltage":230.0,"current":1.0,"frequency":50.0,"energy":10.0}"#;
        let r: Reading = serde_json::from_str(payload).unwrap();
        assert_eq!(r.timestamp.microsecond(), 123_456);
        assert_eq!(r.meter_id, "1000000001");
    }

    #[test]
    fn topic_and_day_are_derived_from_fields() {
        let r = sample();
        assert_eq!(r.topic(), "energy/meters/1000000042");
        assert_eq!(r.day(), datetime!(2025-03-01 00:00:00 UTC));
        assert_eq!(meter_wildcard(), "energy/meters/#");
    }

    #[test]
    fn region_key_takes_fixed_prefix() {
        assert_eq!(region_key("1000000123", 8), "10000001");
        assert_eq!(region_key("123", 8), "123");
        assert_eq!(region_key("1000000123", 0), "");
    }

    #[test]
    fn non_finite_fields_are_detected() {
        let mut r = sample();
        assert!(r.has_finite_fields());
        r.voltage = f64::NAN;
        assert!(!r.has_finite_fields());
    }
}
