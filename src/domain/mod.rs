use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{HistoryError, Result};

/// A single history record: the latest state for one `id`.
///
/// Only `id` and `updatedAt` are interpreted. Every other field is kept in
/// `payload` and written back untouched, in their original key order.
///
/// `updated_at` carries millisecond precision, like a JavaScript `Date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "updatedAt", with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    pub fn new(id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            updated_at: updated_at.trunc_subsecs(3),
            payload: Map::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Bring `updated_at` to the form the history file can hold.
    ///
    /// Sub-millisecond digits are dropped. Instants outside years 0000-9999
    /// have no RFC 3339 spelling and are refused.
    pub fn normalized(mut self) -> Result<Self> {
        self.updated_at = timestamp::normalize(self.updated_at).ok_or_else(|| {
            HistoryError::TimestampOutOfRange {
                id: self.id.clone(),
                timestamp: self.updated_at,
            }
        })?;
        Ok(self)
    }
}

/// On-disk form of `updatedAt`.
///
/// Written as RFC 3339 UTC with millisecond precision (`2024-01-01T00:00:00.000Z`).
/// Read back from an RFC 3339 string with any offset, a bare `YYYY-MM-DD` date
/// (midnight UTC), or a number of milliseconds since the Unix epoch. Values
/// read are truncated to milliseconds and must fall in years 0000-9999, the
/// range the written form can express. Anything else fails the load.
pub mod timestamp {
    use std::fmt;

    use chrono::{DateTime, Datelike, NaiveDate, SecondsFormat, SubsecRound, Utc};
    use serde::{de, Deserializer, Serializer};

    const MIN_YEAR: i32 = 0;
    const MAX_YEAR: i32 = 9999;

    /// Millisecond-truncated `value`, or `None` outside years 0000-9999.
    pub fn normalize(value: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let truncated = value.trunc_subsecs(3);
        (MIN_YEAR..=MAX_YEAR)
            .contains(&truncated.year())
            .then_some(truncated)
    }

    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse_str(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return normalize(parsed.with_timezone(&Utc));
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .and_then(|naive| normalize(naive.and_utc()))
    }

    pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(millis).and_then(normalize)
    }

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(TimestampVisitor)
    }

    struct TimestampVisitor;

    impl<'de> de::Visitor<'de> for TimestampVisitor {
        type Value = DateTime<Utc>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an RFC 3339 timestamp string or epoch milliseconds")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            parse_str(value)
                .ok_or_else(|| E::custom(format_args!("invalid timestamp: {value:?}")))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
            from_millis(value)
                .ok_or_else(|| E::custom(format_args!("timestamp out of range: {value}")))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
            i64::try_from(value)
                .ok()
                .and_then(from_millis)
                .ok_or_else(|| E::custom(format_args!("timestamp out of range: {value}")))
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
            // fractional milliseconds truncate toward zero
            let truncated = value.trunc();
            if !truncated.is_finite() || truncated.abs() > i64::MAX as f64 {
                return Err(E::custom(format_args!("timestamp out of range: {value}")));
            }
            from_millis(truncated as i64)
                .ok_or_else(|| E::custom(format_args!("timestamp out of range: {value}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn instant(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn serializes_timestamp_with_millis_and_z_suffix() {
        let event = Event::new("1", instant(2024, 1, 1)).with_field("kind", "deploy");

        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(
            value,
            json!({"id": "1", "updatedAt": "2024-01-01T00:00:00.000Z", "kind": "deploy"})
        );
    }

    #[test]
    fn reads_timestamp_from_string_forms() {
        let zulu: Event =
            serde_json::from_value(json!({"id": "a", "updatedAt": "2024-01-02T00:00:00Z"})).unwrap();
        let offset: Event =
            serde_json::from_value(json!({"id": "b", "updatedAt": "2024-01-02T02:00:00+02:00"}))
                .unwrap();
        let date_only: Event =
            serde_json::from_value(json!({"id": "c", "updatedAt": "2024-01-02"})).unwrap();

        assert_eq!(zulu.updated_at, instant(2024, 1, 2));
        assert_eq!(offset.updated_at, instant(2024, 1, 2));
        assert_eq!(date_only.updated_at, instant(2024, 1, 2));
    }

    #[test]
    fn reads_timestamp_from_epoch_millis() {
        let integer: Event =
            serde_json::from_value(json!({"id": "a", "updatedAt": 1_704_067_200_000_i64})).unwrap();
        let float: Event =
            serde_json::from_value(json!({"id": "b", "updatedAt": 1_704_067_200_000.9_f64}))
                .unwrap();

        assert_eq!(integer.updated_at, instant(2024, 1, 1));
        assert_eq!(float.updated_at, instant(2024, 1, 1));
    }

    #[test]
    fn rejects_missing_or_unparsable_timestamp() {
        let missing = serde_json::from_value::<Event>(json!({"id": "a"}));
        let garbage = serde_json::from_value::<Event>(json!({"id": "a", "updatedAt": "yesterday"}));
        let null = serde_json::from_value::<Event>(json!({"id": "a", "updatedAt": null}));

        assert!(missing.unwrap_err().to_string().contains("updatedAt"));
        assert!(garbage.unwrap_err().to_string().contains("invalid timestamp"));
        assert!(null.is_err());
    }

    #[test]
    fn keeps_millisecond_precision_only() {
        let precise = Utc.timestamp_opt(1_704_067_200, 123_456_789).unwrap();

        let event = Event::new("a", precise);
        let reread: Event = serde_json::from_value(json!({
            "id": "a",
            "updatedAt": "2024-01-01T00:00:00.123456789Z"
        }))
        .unwrap();

        assert_eq!(event.updated_at, Utc.timestamp_opt(1_704_067_200, 123_000_000).unwrap());
        assert_eq!(reread, event);
        let written = serde_json::to_value(&event).unwrap();
        assert_eq!(written["updatedAt"], "2024-01-01T00:00:00.123Z");
    }

    #[test]
    fn rejects_instants_outside_four_digit_years() {
        let year_10000 = serde_json::from_value::<Event>(
            json!({"id": "a", "updatedAt": 253_402_300_800_000_i64}),
        );
        let negative_year = serde_json::from_value::<Event>(
            json!({"id": "a", "updatedAt": -62_167_219_200_001_i64}),
        );

        assert!(year_10000.unwrap_err().to_string().contains("out of range"));
        assert!(negative_year.unwrap_err().to_string().contains("out of range"));
    }

    #[test]
    fn boundary_years_survive_text_round_trip() {
        for millis in [-62_167_219_200_000_i64, 253_402_300_799_999] {
            let event = Event::new("a", timestamp::from_millis(millis).unwrap());

            let text = serde_json::to_string(&event).unwrap();
            let reread: Event = serde_json::from_str(&text).unwrap();

            assert_eq!(reread, event, "{text}");
        }
    }

    #[test]
    fn normalized_truncates_and_rejects_far_future() {
        let mut event = Event::new("a", instant(2024, 1, 1));
        event.updated_at = Utc.timestamp_opt(1_704_067_200, 999_999).unwrap();
        assert_eq!(event.normalized().unwrap().updated_at, instant(2024, 1, 1));

        let mut far = Event::new("b", instant(2024, 1, 1));
        far.updated_at = Utc.with_ymd_and_hms(10_000, 1, 1, 0, 0, 0).unwrap();
        let err = far.normalized().unwrap_err();
        assert!(matches!(err, HistoryError::TimestampOutOfRange { ref id, .. } if id == "b"));
    }

    #[test]
    fn payload_keeps_key_order() {
        let text = r#"{"id":"a","updatedAt":"2024-01-01T00:00:00.000Z","zeta":1,"alpha":{"y":1,"x":2},"mid":[]}"#;

        let event: Event = serde_json::from_str(text).unwrap();

        assert_eq!(serde_json::to_string(&event).unwrap(), text);
    }

    #[test]
    fn carries_unknown_fields_through_payload() {
        let raw = json!({
            "id": "a",
            "updatedAt": "2024-01-01T00:00:00.000Z",
            "status": "open",
            "meta": {"attempts": 3, "tags": ["x", "y"]}
        });

        let event: Event = serde_json::from_value(raw.clone()).unwrap();

        assert_eq!(event.field("status"), Some(&json!("open")));
        assert_eq!(event.field("meta"), Some(&json!({"attempts": 3, "tags": ["x", "y"]})));
        assert!(event.field("id").is_none());
        assert_eq!(serde_json::to_value(&event).unwrap(), raw);
    }
}
