use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::selector::SelectionRule;
use crate::types::ConnectionId;

/// Default prefix of every broker channel a node publishes on.
pub const DEFAULT_CHANNEL_PREFIX: &str = "sb:";

/// Who an envelope is meant for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Target {
    /// Every registered connection (the `all` group).
    All,
    /// Whatever the rule resolves to against the membership store.
    Rule(SelectionRule),
    /// An explicit list of connection ids, no store round-trip.
    Ids(Vec<ConnectionId>),
}

/// The unit published on the fan-out channel.
///
/// Serialized as MessagePack. `payload` is the event array exactly as it
/// will be framed for each recipient: `[name, args...]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Node that published the envelope.
    pub origin: String,
    pub target: Target,
    pub payload: Vec<Value>,
}

impl Envelope {
    pub fn new(origin: impl Into<String>, target: Target, event: &str, args: Vec<Value>) -> Self {
        let mut payload = Vec::with_capacity(args.len() + 1);
        payload.push(Value::String(event.to_string()));
        payload.extend(args);
        Self {
            origin: origin.into(),
            target,
            payload,
        }
    }

    /// Event name (payload head), if the payload is well formed.
    pub fn event(&self) -> Option<&str> {
        self.payload.first().and_then(Value::as_str)
    }

    /// Arguments following the event name.
    pub fn args(&self) -> &[Value] {
        self.payload.get(1..).unwrap_or(&[])
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(rmp_serde::to_vec(self)?))
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

/// Broker channel an event is published on.
pub fn channel_for(prefix: &str, event: &str) -> String {
    format!("{prefix}{event}")
}

/// Subscription pattern covering every event under `prefix`.
pub fn subscription_pattern(prefix: &str) -> String {
    format!("{prefix}*")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_msgpack_roundtrip() {
        let rule = SelectionRule {
            or: vec!["a".into()],
            and: vec!["b".into()],
            not: vec![],
            filter: Some("admins".into()),
        };
        let env = Envelope::new(
            "node-1",
            Target::Rule(rule),
            "chat",
            vec![json!("hello"), json!({"n": 1})],
        );
        let bytes = env.to_bytes().unwrap();
        let back = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.event(), Some("chat"));
        assert_eq!(back.args(), &[json!("hello"), json!({"n": 1})]);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = Envelope::from_bytes(&[0xc1, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(channel_for("sb:", "chat"), "sb:chat");
        assert_eq!(subscription_pattern("sb:"), "sb:*");
    }

    #[test]
    fn test_empty_payload_has_no_event() {
        let env = Envelope {
            origin: "n".into(),
            target: Target::All,
            payload: vec![],
        };
        assert_eq!(env.event(), None);
        assert!(env.args().is_empty());
    }
}
