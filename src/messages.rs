//! Wire contract shared by the three nodes.
//!
//! Topic strings and field names are fixed; every payload is a JSON object
//! and decoding rejects unknown fields.

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::error::{DecodeError, TransportError};

// ts/{SUBSCRIBER}/{PUBLISHER}/{SERVICE}
pub const TOPIC_RFID_TAGS: &str = "ts/alarm_controller/rfid_controller/show_tags";
pub const TOPIC_ALARM_STATUS: &str = "ts/gui/alarm_controller/show_state";
pub const TOPIC_DEACTIVATE_ALARM: &str = "ts/alarm_controller/gui/deactivate_alarm";

/// `{"tag": {"epc": "...", "rssi": -52}}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TagMessage {
    pub tag: TagPayload,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TagPayload {
    pub epc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmStatusKind {
    #[serde(rename = "ALARM")]
    Alarm,
}

/// `{"status": "ALARM", "message": "...", "tag": "..."}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AlarmStatusMessage {
    pub status: AlarmStatusKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivateStatus {
    #[serde(rename = "DEACTIVATE")]
    Deactivate,
}

/// `{"alarm_status": "DEACTIVATE"}`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeactivateMessage {
    pub alarm_status: DeactivateStatus,
}

impl DeactivateMessage {
    pub fn new() -> Self {
        DeactivateMessage {
            alarm_status: DeactivateStatus::Deactivate,
        }
    }
}

impl Default for DeactivateMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl AlarmStatusMessage {
    pub fn unborrowed(epc: &str) -> Self {
        AlarmStatusMessage {
            status: AlarmStatusKind::Alarm,
            message: format!("Device with tag number {epc} is not borrowed"),
            tag: Some(epc.to_string()),
        }
    }
}

/// A tag read as seen by the alarm coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct TagEvent {
    pub epc: String,
    pub rssi: Option<f64>,
    pub received_at: DateTime<Utc>,
}

impl TagEvent {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let message: TagMessage = decode(TOPIC_RFID_TAGS, payload)?;
        let epc = message.tag.epc.trim();
        if epc.is_empty() {
            return Err(DecodeError::EmptyTag);
        }

        Ok(TagEvent {
            epc: epc.to_string(),
            rssi: message.tag.rssi,
            received_at: Utc::now(),
        })
    }
}

pub fn decode<T: serde::de::DeserializeOwned>(topic: &str, payload: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|source| DecodeError::Schema {
        topic: topic.to_string(),
        source,
    })
}

pub fn encode<T: serde::Serialize>(topic: &str, message: &T) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(message).map_err(|source| TransportError::Encode {
        topic: topic.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_event_decode() {
        let event = TagEvent::decode(br#"{"tag": {"epc": "E2801160600002", "rssi": -61}}"#).unwrap();
        assert_eq!(event.epc, "E2801160600002");
        assert_eq!(event.rssi, Some(-61.0));
    }

    #[test]
    fn test_tag_event_without_rssi() {
        let event = TagEvent::decode(br#"{"tag": {"epc": " ABC123 "}}"#).unwrap();
        assert_eq!(event.epc, "ABC123");
        assert_eq!(event.rssi, None);
    }

    #[test]
    fn test_tag_event_missing_epc() {
        let err = TagEvent::decode(br#"{"tag": {"rssi": -61}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Schema { .. }));
    }

    #[test]
    fn test_tag_event_empty_epc() {
        let err = TagEvent::decode(br#"{"tag": {"epc": "  "}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::EmptyTag));
    }

    #[test]
    fn test_tag_event_rejects_legacy_literal() {
        // Python-literal payloads from older publishers are not JSON.
        let err = TagEvent::decode(b"{'tag': {'epc': b'E280', 'rssi': -61}}").unwrap_err();
        assert!(matches!(err, DecodeError::Schema { .. }));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<DeactivateMessage, _> = decode(
            TOPIC_DEACTIVATE_ALARM,
            br#"{"alarm_status": "DEACTIVATE", "user": "admin"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_deactivate_wire_format() {
        let bytes = encode(TOPIC_DEACTIVATE_ALARM, &DeactivateMessage::new()).unwrap();
        assert_eq!(bytes, br#"{"alarm_status":"DEACTIVATE"}"#.to_vec());
    }

    #[test]
    fn test_deactivate_other_status_rejected() {
        let result: Result<DeactivateMessage, _> =
            decode(TOPIC_DEACTIVATE_ALARM, br#"{"alarm_status": "ACTIVATE"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_alarm_status_wire_format() {
        let message = AlarmStatusMessage::unborrowed("E280");
        let value: serde_json::Value =
            serde_json::from_slice(&encode(TOPIC_ALARM_STATUS, &message).unwrap()).unwrap();
        assert_eq!(value["status"], "ALARM");
        assert_eq!(value["message"], "Device with tag number E280 is not borrowed");
        assert_eq!(value["tag"], "E280");
    }

    #[test]
    fn test_alarm_status_without_tag_decodes() {
        let message: AlarmStatusMessage = decode(
            TOPIC_ALARM_STATUS,
            br#"{"status": "ALARM", "message": "Device with tag number 1 is not borrowed"}"#,
        )
        .unwrap();
        assert_eq!(message.tag, None);
    }
}
