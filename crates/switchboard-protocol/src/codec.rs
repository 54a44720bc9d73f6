//! Peer frame codec.
//!
//! A frame is one JSON text. An array is an event: element 0 names it and
//! the rest are its arguments (the last one may be an ack channel). Any
//! other JSON value is opaque data.
use serde_json::Value;

use crate::error::ProtocolError;

/// A decoded peer frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Event { name: String, args: Vec<Value> },
    Data(Value),
}

/// Encode an event frame `[name, args...]`.
pub fn encode_event(name: &str, args: &[Value]) -> Result<String, ProtocolError> {
    let mut items = Vec::with_capacity(args.len() + 1);
    items.push(Value::String(name.to_string()));
    items.extend_from_slice(args);
    encode_frame(&items)
}

/// Encode an already assembled event array.
pub fn encode_frame(items: &[Value]) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(items)?)
}

/// Encode an opaque data frame.
pub fn encode_data(value: &Value) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(value)?)
}

/// Decode one frame.
///
/// Fails on malformed JSON, on an empty array, and on an array whose head is
/// not a string.
pub fn decode_frame(frame: &str) -> Result<Incoming, ProtocolError> {
    match serde_json::from_str::<Value>(frame)? {
        Value::Array(mut items) => {
            if items.is_empty() {
                return Err(ProtocolError::InvalidFrame {
                    reason: "empty event array".into(),
                });
            }
            match items.remove(0) {
                Value::String(name) => Ok(Incoming::Event { name, args: items }),
                other => Err(ProtocolError::InvalidFrame {
                    reason: format!("event name must be a string, got {other}"),
                }),
            }
        }
        value => Ok(Incoming::Data(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_event() {
        let frame = encode_event("chat", &[json!("hi"), json!(3)]).unwrap();
        assert_eq!(frame, r#"["chat","hi",3]"#);
        assert_eq!(
            decode_frame(&frame).unwrap(),
            Incoming::Event {
                name: "chat".into(),
                args: vec![json!("hi"), json!(3)],
            }
        );
    }

    #[test]
    fn test_non_array_is_data() {
        assert_eq!(
            decode_frame(r#"{"x":1}"#).unwrap(),
            Incoming::Data(json!({"x": 1}))
        );
        assert_eq!(decode_frame("42").unwrap(), Incoming::Data(json!(42)));
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(decode_frame("[1,").is_err());
        assert!(decode_frame("[]").is_err());
        assert!(matches!(
            decode_frame("[7, 1]"),
            Err(ProtocolError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_event_without_args() {
        assert_eq!(
            decode_frame(r#"["ping"]"#).unwrap(),
            Incoming::Event {
                name: "ping".into(),
                args: vec![],
            }
        );
    }
}
