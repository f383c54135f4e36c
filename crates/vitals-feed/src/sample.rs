//! Decoded telemetry samples.

use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use vitals_broker::InboundMessage;

/// Field names sensors use for the primary reading.
const READING_FIELDS: [&str; 2] = ["valor", "value"];

/// One decoded data point, tagged with its topic and receive time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub topic: String,
    pub value: Value,
    pub received_at: DateTime<Utc>,
}

impl Sample {
    pub fn new(topic: impl Into<String>, value: Value) -> Self {
        Self {
            topic: topic.into(),
            value,
            received_at: Utc::now(),
        }
    }

    /// Decode a raw payload. Any well-formed UTF-8 JSON value is accepted.
    pub fn decode(message: &InboundMessage) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(&message.payload).map_err(|e| DecodeError::InvalidUtf8 {
            topic: message.topic.clone(),
            reason: e.to_string(),
        })?;

        let value = serde_json::from_str(text).map_err(|e| DecodeError::InvalidJson {
            topic: message.topic.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            topic: message.topic.clone(),
            value,
            received_at: message.received_at,
        })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.value.get(field)
    }

    /// Numeric reading: a bare number, or the `valor`/`value` field of an object.
    pub fn as_f64(&self) -> Option<f64> {
        if let Some(n) = self.value.as_f64() {
            return Some(n);
        }
        READING_FIELDS
            .iter()
            .find_map(|field| self.value.get(field).and_then(Value::as_f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_object_keeps_receive_time() {
        let message = InboundMessage::new("sensores/ecg", r#"{"valor": 72, "unidad": "bpm"}"#);
        let sample = Sample::decode(&message).unwrap();

        assert_eq!(sample.topic, "sensores/ecg");
        assert_eq!(sample.received_at, message.received_at);
        assert_eq!(sample.get("unidad"), Some(&json!("bpm")));
        assert_eq!(sample.as_f64(), Some(72.0));
    }

    #[test]
    fn test_decode_accepts_bare_values() {
        let number = Sample::decode(&InboundMessage::new("sensores/oxigeno", "97.5")).unwrap();
        assert_eq!(number.as_f64(), Some(97.5));

        let array = Sample::decode(&InboundMessage::new("t", "[1, 2, 3]")).unwrap();
        assert_eq!(array.value, json!([1, 2, 3]));
        assert_eq!(array.as_f64(), None);
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        let err = Sample::decode(&InboundMessage::new("sensores/ecg", "{not json")).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidJson { .. }));
        assert_eq!(err.topic(), "sensores/ecg");
    }

    #[test]
    fn test_decode_rejects_empty_payload() {
        let err = Sample::decode(&InboundMessage::new("t", "")).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidJson { .. }));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let err = Sample::decode(&InboundMessage::new("t", vec![0xff, 0xfe, 0x7b])).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUtf8 { .. }));
    }

    #[test]
    fn test_serializes_for_dashboard() {
        let sample = Sample::new("sensores/ecg", json!({"valor": 80}));
        let encoded = serde_json::to_value(&sample).unwrap();
        assert_eq!(encoded["topic"], "sensores/ecg");
        assert_eq!(encoded["value"]["valor"], 80);
        assert!(encoded["received_at"].is_string());
    }
}
