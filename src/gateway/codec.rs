/// Gateway wire format
///
/// Every message is a JSON object tagged by `kind`:
///
/// ```text
/// {"kind":"command",  "id":7, "name":"ping", "payload":{}}
/// {"kind":"response", "id":7, "ok":true,  "result":{...}}
/// {"kind":"response", "id":8, "ok":false, "error":{"code":"E_SENSOR","message":"..."}}
/// {"kind":"event",    "topic":"sensor/1001/temperature", "payload":{...}}
/// ```
///
/// One text frame carries one message, or a JSON array of messages when the
/// gateway batches pushes. Decoding never panics; failures come back as
/// `DecodeError` and the caller drops the frame.
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::DecodeError;

/// Correlation id, unique within one connection's lifetime
pub type CorrelationId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
    Command {
        id: CorrelationId,
        name: String,
        #[serde(default)]
        payload: Value,
    },
    Response {
        id: CorrelationId,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_wire_error"
        )]
        error: Option<WireError>,
    },
    Event {
        topic: String,
        #[serde(default)]
        payload: Value,
    },
}

/// Application error carried by a failed response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl WireMessage {
    pub fn command(id: CorrelationId, name: impl Into<String>, payload: Value) -> Self {
        WireMessage::Command {
            id,
            name: name.into(),
            payload,
        }
    }

    pub fn response_ok(id: CorrelationId, result: Value) -> Self {
        WireMessage::Response {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn response_err(id: CorrelationId, code: Option<&str>, message: impl Into<String>) -> Self {
        WireMessage::Response {
            id,
            ok: false,
            result: None,
            error: Some(WireError {
                code: code.map(str::to_string),
                message: message.into(),
            }),
        }
    }

    pub fn event(topic: impl Into<String>, payload: Value) -> Self {
        WireMessage::Event {
            topic: topic.into(),
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Command { .. } => "command",
            WireMessage::Response { .. } => "response",
            WireMessage::Event { .. } => "event",
        }
    }
}

// ============================================================================
// ENCODE
// ============================================================================

pub fn encode(message: &WireMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

// ============================================================================
// DECODE
// ============================================================================

/// Decode a frame holding exactly one message
pub fn decode(frame: &str) -> Result<WireMessage, DecodeError> {
    let value = parse_frame(frame)?;
    if value.is_array() {
        return Err(DecodeError::InvalidField {
            kind: "batch".to_string(),
            field: "kind".to_string(),
        });
    }
    decode_value(&value)
}

/// Decode a text frame that may hold a single message or a batch
///
/// A malformed element of a batch fails on its own; the rest still decode.
pub fn decode_frame(frame: &str) -> Vec<Result<WireMessage, DecodeError>> {
    match parse_frame(frame) {
        Ok(Value::Array(items)) => items.iter().map(decode_value).collect(),
        Ok(value) => vec![decode_value(&value)],
        Err(e) => vec![Err(e)],
    }
}

/// Binary frames are accepted when they hold UTF-8 JSON
pub fn decode_binary(frame: &[u8]) -> Vec<Result<WireMessage, DecodeError>> {
    match std::str::from_utf8(frame) {
        Ok(text) => decode_frame(text),
        Err(_) => vec![Err(DecodeError::NotUtf8)],
    }
}

fn parse_frame(frame: &str) -> Result<Value, DecodeError> {
    if frame.trim().is_empty() {
        return Err(DecodeError::Empty);
    }
    serde_json::from_str(frame).map_err(|e| DecodeError::Json(e.to_string()))
}

const KINDS: [&str; 3] = ["command", "response", "event"];

fn decode_value(value: &Value) -> Result<WireMessage, DecodeError> {
    let obj = value
        .as_object()
        .ok_or_else(|| DecodeError::Json("frame is not an object".to_string()))?;

    let kind = obj
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("unknown", "kind"))?;
    if !KINDS.contains(&kind) {
        return Err(DecodeError::UnknownKind(kind.to_string()));
    }

    let message = WireMessage::deserialize(value).map_err(|e| schema_error(kind, &e))?;
    match &message {
        WireMessage::Command { name, .. } if name.is_empty() => Err(invalid(kind, "name")),
        WireMessage::Event { topic, .. } if topic.is_empty() => Err(invalid(kind, "topic")),
        _ => Ok(message),
    }
}

/// Missing fields are reported by name; anything else keeps serde's reason
fn schema_error(kind: &str, error: &serde_json::Error) -> DecodeError {
    let reason = error.to_string();
    match reason
        .strip_prefix("missing field `")
        .and_then(|rest| rest.split('`').next())
    {
        Some(field) => invalid(kind, field),
        None => DecodeError::Malformed {
            kind: kind.to_string(),
            reason,
        },
    }
}

/// Gateways report errors either as a bare string or as `{code?, message}`
fn deserialize_wire_error<'de, D>(deserializer: D) -> Result<Option<WireError>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(message)) => Ok(Some(WireError {
            code: None,
            message,
        })),
        Some(Value::Object(err)) => {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .ok_or_else(|| de::Error::missing_field("error.message"))?;
            let code = err.get("code").and_then(|c| match c {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            Ok(Some(WireError {
                code,
                message: message.to_string(),
            }))
        }
        Some(other) => Err(de::Error::custom(format!("expected error text or object, got {}", other))),
    }
}

fn invalid(kind: &str, field: &str) -> DecodeError {
    DecodeError::InvalidField {
        kind: kind.to_string(),
        field: field.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_encoding_shape() {
        let frame = encode(&WireMessage::command(3, "ping", json!({}))).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"kind": "command", "id": 3, "name": "ping", "payload": {}}));
    }

    #[test]
    fn test_failed_response_encoding_omits_result() {
        let frame = encode(&WireMessage::response_err(9, Some("E_BUSY"), "sensor busy")).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"kind": "response", "id": 9, "ok": false, "error": {"code": "E_BUSY", "message": "sensor busy"}})
        );
    }

    #[test]
    fn test_decode_response_variants() {
        let ok = decode(r#"{"kind":"response","id":4,"ok":true,"result":{"latency":2}}"#).unwrap();
        assert_eq!(ok, WireMessage::response_ok(4, json!({"latency": 2})));

        let bare = decode(r#"{"kind":"response","id":5,"ok":false,"error":"bad serial"}"#).unwrap();
        match bare {
            WireMessage::Response { ok, error: Some(err), .. } => {
                assert!(!ok);
                assert_eq!(err.message, "bad serial");
                assert_eq!(err.code, None);
            }
            other => panic!("unexpected {:?}", other),
        }

        let numeric_code =
            decode(r#"{"kind":"response","id":6,"ok":false,"error":{"code":401,"message":"denied"}}"#).unwrap();
        match numeric_code {
            WireMessage::Response { error: Some(err), .. } => assert_eq!(err.code.as_deref(), Some("401")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_event_defaults_payload() {
        let event = decode(r#"{"kind":"event","topic":"gateway/status"}"#).unwrap();
        assert_eq!(event, WireMessage::event("gateway/status", Value::Null));
    }

    #[test]
    fn test_decode_errors_are_typed() {
        assert_eq!(decode("   "), Err(DecodeError::Empty));
        assert!(matches!(decode("{not json"), Err(DecodeError::Json(_))));
        assert_eq!(
            decode(r#"{"kind":"telemetry","topic":"x"}"#),
            Err(DecodeError::UnknownKind("telemetry".to_string()))
        );
        assert_eq!(
            decode(r#"{"kind":"response","ok":true}"#),
            Err(DecodeError::InvalidField {
                kind: "response".to_string(),
                field: "id".to_string()
            })
        );
        assert_eq!(
            decode(r#"{"kind":"event","topic":""}"#),
            Err(DecodeError::InvalidField {
                kind: "event".to_string(),
                field: "topic".to_string()
            })
        );
        assert!(matches!(
            decode(r#"{"kind":"response","id":-1,"ok":true}"#),
            Err(DecodeError::Malformed { ref kind, .. }) if kind == "response"
        ));
        assert_eq!(
            decode(r#"{"kind":"response","id":3,"ok":false,"error":{"code":"E_X"}}"#),
            Err(DecodeError::InvalidField {
                kind: "response".to_string(),
                field: "error.message".to_string()
            })
        );
        assert!(matches!(
            decode(r#"{"kind":"response","id":3,"ok":false,"error":7}"#),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_batch_frame_isolates_bad_elements() {
        let frame = r#"[
            {"kind":"event","topic":"sensor/1/temperature","payload":{"temperature":21.5}},
            {"kind":"event"},
            {"kind":"response","id":2,"ok":true}
        ]"#;
        let decoded = decode_frame(frame);
        assert_eq!(decoded.len(), 3);
        assert!(decoded[0].is_ok());
        assert!(decoded[1].is_err());
        assert_eq!(
            decoded[2],
            Ok(WireMessage::Response {
                id: 2,
                ok: true,
                result: None,
                error: None
            })
        );
        assert!(decode(frame).is_err());
    }

    #[test]
    fn test_binary_frames() {
        let decoded = decode_binary(br#"{"kind":"event","topic":"t","payload":1}"#);
        assert_eq!(decoded, vec![Ok(WireMessage::event("t", json!(1)))]);
        assert_eq!(decode_binary(&[0xff, 0xfe]), vec![Err(DecodeError::NotUtf8)]);
    }
}
