use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound frames, keyed by their `type` field. Types this client does not
/// know land in [`InboundMessage::Unknown`] instead of failing.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ObjectUpdate { object_id: String, data: Value },
    Ack { message: Option<String>, object_id: Option<String> },
    SubscribeAck { message: Option<String> },
    ObjectsData { objects: Vec<Value> },
    Error { message: String },
    Unknown { kind: String, payload: Value },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Known {
    ObjectUpdate {
        object_id: String,
        #[serde(default)]
        data: Value,
    },
    Ack {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        object_id: Option<String>,
    },
    SubscribeAck {
        #[serde(default)]
        message: Option<String>,
    },
    ObjectsData {
        #[serde(default)]
        objects: Vec<Value>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

const KNOWN_TYPES: &[&str] = &["object_update", "ack", "subscribe_ack", "objects_data", "error"];

impl InboundMessage {
    /// Parses a text frame. Fails on non-JSON, on a missing string `type`,
    /// and on known types whose fields do not fit.
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(frame)?;
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => {
                return Err(serde::de::Error::custom("frame has no string `type` field"));
            }
        };

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Ok(InboundMessage::Unknown {
                kind,
                payload: value,
            });
        }

        let message = match serde_json::from_value(value)? {
            Known::ObjectUpdate { object_id, data } => InboundMessage::ObjectUpdate { object_id, data },
            Known::Ack { message, object_id } => InboundMessage::Ack { message, object_id },
            Known::SubscribeAck { message } => InboundMessage::SubscribeAck { message },
            Known::ObjectsData { objects } => InboundMessage::ObjectsData { objects },
            Known::Error { message } => InboundMessage::Error { message },
        };
        Ok(message)
    }

    /// The wire `type` string handlers are registered under.
    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::ObjectUpdate { .. } => "object_update",
            InboundMessage::Ack { .. } => "ack",
            InboundMessage::SubscribeAck { .. } => "subscribe_ack",
            InboundMessage::ObjectsData { .. } => "objects_data",
            InboundMessage::Error { .. } => "error",
            InboundMessage::Unknown { kind, .. } => kind,
        }
    }
}

/// Fire-and-forget control messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Subscribe {
        object_types: Vec<String>,
    },
    GetObjects {
        #[serde(skip_serializing_if = "Option::is_none")]
        object_type: Option<String>,
        limit: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_object_update() {
        let msg = InboundMessage::parse(
            r#"{"type":"object_update","object_id":"b","data":{"latitude":1.5}}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), "object_update");
        assert_eq!(
            msg,
            InboundMessage::ObjectUpdate {
                object_id: "b".to_string(),
                data: json!({"latitude": 1.5}),
            }
        );
    }

    #[test]
    fn test_unknown_type_is_kept() {
        let msg = InboundMessage::parse(r#"{"type":"weather","wind":12}"#).unwrap();
        match msg {
            InboundMessage::Unknown { kind, payload } => {
                assert_eq!(kind, "weather");
                assert_eq!(payload["wind"], 12);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames() {
        assert!(InboundMessage::parse("not json").is_err());
        assert!(InboundMessage::parse(r#"{"object_id":"x"}"#).is_err());
        assert!(InboundMessage::parse(r#"{"type":7}"#).is_err());
        // known type, missing required field
        assert!(InboundMessage::parse(r#"{"type":"object_update"}"#).is_err());
    }

    #[test]
    fn test_outbound_shape() {
        let msg = OutboundMessage::GetObjects {
            object_type: None,
            limit: 100,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "get_objects", "limit": 100})
        );
        let sub = OutboundMessage::Subscribe {
            object_types: vec!["ship".to_string()],
        };
        assert_eq!(
            serde_json::to_value(&sub).unwrap(),
            json!({"type": "subscribe", "object_types": ["ship"]})
        );
    }
}
