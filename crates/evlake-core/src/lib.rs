//! Core domain model for evlake: raw analytics events, candidate-record
//! validation, and the ingestion-run state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "evlake-core";

/// A validated analytics event, ready for the loader.
///
/// `ingestion_time` is deliberately absent: it is assigned by the loader at
/// the moment of persistence, not carried over from the batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_time: DateTime<Utc>,
    pub event_name: String,
    pub user_id: i64,
    pub session_id: Uuid,
    pub product_id: Option<i64>,
    pub price: Option<f64>,
    pub device: Option<String>,
    pub payload: JsonValue,
}

/// Why a candidate record was rejected, naming the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("record is not a JSON object: {0}")]
    NotAnObject(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is invalid: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidField {
        field,
        reason: reason.into(),
    }
}

fn require<'a>(
    obj: &'a serde_json::Map<String, JsonValue>,
    field: &'static str,
) -> Result<&'a JsonValue, ValidationError> {
    match obj.get(field) {
        Some(JsonValue::Null) | None => Err(ValidationError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

fn parse_uuid(value: &JsonValue, field: &'static str) -> Result<Uuid, ValidationError> {
    let raw = value
        .as_str()
        .ok_or_else(|| invalid(field, "expected a UUID string"))?;
    Uuid::parse_str(raw).map_err(|e| invalid(field, format!("not a valid UUID: {e}")))
}

fn parse_timestamp(value: &JsonValue, field: &'static str) -> Result<DateTime<Utc>, ValidationError> {
    let raw = value
        .as_str()
        .ok_or_else(|| invalid(field, "expected an RFC 3339 timestamp string"))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| invalid(field, format!("not a valid timestamp: {e}")))
}

impl Event {
    /// Parse and validate one serialized candidate record.
    ///
    /// Rules: `event_id` and `session_id` must be UUIDs, `event_time` an
    /// RFC 3339 timestamp, `event_name` non-empty, `user_id` an integer,
    /// `price` (when present) non-negative and representable with two
    /// fractional digits, `payload` a JSON object. An `ingestion_time`
    /// field is validated if present but never trusted: the loader stamps
    /// its own at persistence.
    pub fn from_json_line(line: &str) -> Result<Self, ValidationError> {
        let value: JsonValue = serde_json::from_str(line)
            .map_err(|e| ValidationError::NotAnObject(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ValidationError::NotAnObject("top-level value is not an object".into()))?;

        let event_id = parse_uuid(require(obj, "event_id")?, "event_id")?;
        let event_time = parse_timestamp(require(obj, "event_time")?, "event_time")?;
        if let Some(raw) = obj.get("ingestion_time").filter(|v| !v.is_null()) {
            parse_timestamp(raw, "ingestion_time")?;
        }

        let event_name = require(obj, "event_name")?
            .as_str()
            .ok_or_else(|| invalid("event_name", "expected a string"))?
            .to_string();
        if event_name.is_empty() {
            return Err(invalid("event_name", "must be non-empty"));
        }

        let user_id = require(obj, "user_id")?
            .as_i64()
            .ok_or_else(|| invalid("user_id", "expected an integer"))?;
        let session_id = parse_uuid(require(obj, "session_id")?, "session_id")?;

        let product_id = match obj.get("product_id").filter(|v| !v.is_null()) {
            Some(v) => Some(
                v.as_i64()
                    .ok_or_else(|| invalid("product_id", "expected an integer"))?,
            ),
            None => None,
        };

        let price = match obj.get("price").filter(|v| !v.is_null()) {
            Some(v) => {
                let price = v
                    .as_f64()
                    .ok_or_else(|| invalid("price", "expected a number"))?;
                Some(validate_price(price)?)
            }
            None => None,
        };

        let device = match obj.get("device").filter(|v| !v.is_null()) {
            Some(v) => Some(
                v.as_str()
                    .ok_or_else(|| invalid("device", "expected a string"))?
                    .to_string(),
            ),
            None => None,
        };

        let payload = require(obj, "payload")?;
        if !payload.is_object() {
            return Err(invalid("payload", "expected an object"));
        }

        Ok(Self {
            event_id,
            event_time,
            event_name,
            user_id,
            session_id,
            product_id,
            price,
            device,
            payload: payload.clone(),
        })
    }
}

/// Prices are fixed-point with two fractional digits; the store column is
/// `numeric(12,2)`.
fn validate_price(price: f64) -> Result<f64, ValidationError> {
    if !price.is_finite() {
        return Err(invalid("price", "must be a finite number"));
    }
    if price < 0.0 {
        return Err(invalid("price", "must be non-negative"));
    }
    let cents = price * 100.0;
    if (cents - cents.round()).abs() > 1e-6 {
        return Err(invalid("price", "more than two fractional digits"));
    }
    Ok(price)
}

/// Lifecycle of one ingestion run. `Running` is the only non-terminal state
/// and each run leaves it exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row accounting for one run.
///
/// Invariant on completed runs: `rows_in_file` = `rows_loaded` +
/// `rows_deduped` + `rows_invalid`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    /// Candidate rows observed in the batch, valid or not.
    pub rows_in_file: u64,
    /// Rows newly persisted by this run.
    pub rows_loaded: u64,
    /// Rows skipped because their `event_id` already existed.
    pub rows_deduped: u64,
    /// Rows rejected by validation; never persisted, never deduplicated.
    pub rows_invalid: u64,
}

impl RunCounts {
    pub fn is_conserved(&self) -> bool {
        self.rows_in_file == self.rows_loaded + self.rows_deduped + self.rows_invalid
    }
}

/// One row of the `ingestion_runs` audit ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionRun {
    pub run_id: Uuid,
    pub file_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rows_in_file: i64,
    pub rows_loaded: i64,
    pub rows_deduped: i64,
    pub status: RunStatus,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_line() -> String {
        json!({
            "event_id": "0b8a3f6e-5c1d-4f2a-9e7b-0d6c5b4a3f2e",
            "event_time": "2026-02-18T12:34:56.123456+00:00",
            "ingestion_time": "2026-02-18T12:35:00+00:00",
            "event_name": "purchase",
            "user_id": 42,
            "session_id": "7f1e2d3c-4b5a-6978-8a9b-0c1d2e3f4a5b",
            "product_id": 1234,
            "price": 19.99,
            "device": "web",
            "payload": {"source": "synthetic_generator", "session_step": 4}
        })
        .to_string()
    }

    #[test]
    fn valid_record_parses() {
        let event = Event::from_json_line(&valid_line()).unwrap();
        assert_eq!(event.event_name, "purchase");
        assert_eq!(event.user_id, 42);
        assert_eq!(event.price, Some(19.99));
        assert_eq!(event.device.as_deref(), Some("web"));
        assert!(event.payload.is_object());
    }

    #[test]
    fn optional_fields_may_be_absent_or_null() {
        let line = json!({
            "event_id": "0b8a3f6e-5c1d-4f2a-9e7b-0d6c5b4a3f2e",
            "event_time": "2026-02-18T12:34:56Z",
            "event_name": "open",
            "user_id": 1,
            "session_id": "7f1e2d3c-4b5a-6978-8a9b-0c1d2e3f4a5b",
            "product_id": null,
            "price": null,
            "payload": {}
        })
        .to_string();
        let event = Event::from_json_line(&line).unwrap();
        assert_eq!(event.product_id, None);
        assert_eq!(event.price, None);
        assert_eq!(event.device, None);
    }

    #[test]
    fn garbage_is_not_an_object() {
        assert!(matches!(
            Event::from_json_line("not json at all"),
            Err(ValidationError::NotAnObject(_))
        ));
        assert!(matches!(
            Event::from_json_line("[1, 2, 3]"),
            Err(ValidationError::NotAnObject(_))
        ));
    }

    #[test]
    fn missing_fields_are_named() {
        let line = json!({
            "event_time": "2026-02-18T12:34:56Z",
            "event_name": "open",
            "user_id": 1,
            "session_id": "7f1e2d3c-4b5a-6978-8a9b-0c1d2e3f4a5b",
            "payload": {}
        })
        .to_string();
        assert_eq!(
            Event::from_json_line(&line),
            Err(ValidationError::MissingField("event_id"))
        );
    }

    #[test]
    fn bad_uuid_is_rejected() {
        let mut value: serde_json::Value = serde_json::from_str(&valid_line()).unwrap();
        value["event_id"] = json!("definitely-not-a-uuid");
        let err = Event::from_json_line(&value.to_string()).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField { field: "event_id", .. }
        ));
    }

    #[test]
    fn empty_event_name_is_rejected() {
        let mut value: serde_json::Value = serde_json::from_str(&valid_line()).unwrap();
        value["event_name"] = json!("");
        let err = Event::from_json_line(&value.to_string()).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField { field: "event_name", .. }
        ));
    }

    #[test]
    fn price_rules() {
        assert!(validate_price(0.0).is_ok());
        assert!(validate_price(19.99).is_ok());
        assert!(validate_price(250.0).is_ok());
        assert!(validate_price(-0.01).is_err());
        assert!(validate_price(1.999).is_err());
        assert!(validate_price(f64::NAN).is_err());
    }

    #[test]
    fn bad_ingestion_time_still_fails_validation() {
        let mut value: serde_json::Value = serde_json::from_str(&valid_line()).unwrap();
        value["ingestion_time"] = json!("yesterday-ish");
        let err = Event::from_json_line(&value.to_string()).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField { field: "ingestion_time", .. }
        ));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let mut value: serde_json::Value = serde_json::from_str(&valid_line()).unwrap();
        value["payload"] = json!("opaque string");
        let err = Event::from_json_line(&value.to_string()).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField { field: "payload", .. }
        ));
    }

    #[test]
    fn status_round_trips_and_terminality() {
        for status in [
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Partial,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("exploded"), None);
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Partial.is_terminal());
    }

    #[test]
    fn counts_conservation() {
        let counts = RunCounts {
            rows_in_file: 15,
            rows_loaded: 10,
            rows_deduped: 3,
            rows_invalid: 2,
        };
        assert!(counts.is_conserved());
        assert!(!RunCounts { rows_loaded: 11, ..counts }.is_conserved());
    }
}
