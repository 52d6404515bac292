// Sensor readings as they arrive on the wire and as they are stored.
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};

/// Processing status stamped on every reading this bridge stores.
pub const PENDING: &str = "pending";

// Local date-times without an offset, as published by the sensor gateways.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// JSON payload published by a sensor. All five fields are required; unknown
/// fields are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorPayload {
    pub original_id: i32,
    pub sensor_id: String,
    pub value: f64,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: NaiveDateTime,
    pub status: String,
}

impl SensorPayload {
    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// A decoded reading stamped with its reception time, ready for a single insert.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedReading {
    pub original_id: i32,
    pub sensor_id: String,
    pub value: f64,
    pub timestamp: NaiveDateTime,
    pub status: String,
    pub received_at: DateTime<Utc>,
    pub process_status: String,
}

impl ReceivedReading {
    pub fn received(payload: SensorPayload, received_at: DateTime<Utc>) -> Self {
        Self {
            original_id: payload.original_id,
            sensor_id: payload.sensor_id,
            value: payload.value,
            timestamp: payload.timestamp,
            status: payload.status,
            received_at,
            process_status: PENDING.to_string(),
        }
    }
}

/// Parse a source timestamp. Values with an offset are normalized to UTC.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid Timestamp: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const VALID: &str = r#"{"OriginalId":1,"SensorId":"temp-1","Value":22.5,"Timestamp":"2024-01-01T00:00:00","Status":"ok"}"#;

    fn midnight() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn decodes_the_published_shape() {
        let payload = SensorPayload::decode(VALID).expect("valid payload");
        assert_eq!(payload.original_id, 1);
        assert_eq!(payload.sensor_id, "temp-1");
        assert_eq!(payload.value, 22.5);
        assert_eq!(payload.timestamp, midnight());
        assert_eq!(payload.status, "ok");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let json = r#"{"OriginalId":7,"SensorId":"h-2","Value":40,"Timestamp":"2024-01-01 00:00:00","Status":"ok","Unit":"%","Extra":{"a":1}}"#;
        let payload = SensorPayload::decode(json).expect("extra fields are fine");
        assert_eq!(payload.original_id, 7);
        assert_eq!(payload.value, 40.0);
        assert_eq!(payload.timestamp, midnight());
    }

    #[test]
    fn rejects_malformed_and_incomplete_payloads() {
        let cases = [
            "not-json",
            "",
            "null",
            "[]",
            r#"{"OriginalId":1,"SensorId":"temp-1","Value":22.5,"Timestamp":"2024-01-01T00:00:00"}"#,
            r#"{"OriginalId":"one","SensorId":"temp-1","Value":22.5,"Timestamp":"2024-01-01T00:00:00","Status":"ok"}"#,
            r#"{"OriginalId":1,"SensorId":"temp-1","Value":22.5,"Timestamp":"yesterday","Status":"ok"}"#,
            r#"{"originalId":1,"sensorId":"temp-1","value":22.5,"timestamp":"2024-01-01T00:00:00","status":"ok"}"#,
        ];
        for case in cases {
            assert!(SensorPayload::decode(case).is_err(), "should reject {case:?}");
        }
    }

    #[test]
    fn timestamps_with_offsets_are_normalized_to_utc() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(10, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-01T12:30:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T10:30:00Z"), Some(expected));
    }

    #[test]
    fn fractional_seconds_are_kept() {
        let ts = parse_timestamp("2024-01-01T00:00:00.250").expect("fractional");
        assert_eq!(ts, midnight() + chrono::Duration::milliseconds(250));
    }

    #[test]
    fn received_reading_is_pending_and_stamped() {
        let at = Utc::now();
        let reading = ReceivedReading::received(SensorPayload::decode(VALID).unwrap(), at);
        assert_eq!(reading.process_status, PENDING);
        assert_eq!(reading.received_at, at);
        assert_eq!(reading.sensor_id, "temp-1");
    }
}
