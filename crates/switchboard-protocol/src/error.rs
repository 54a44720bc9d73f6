use std::time::Duration;

use crate::broker::BrokerError;
use crate::store::StoreError;

/// Protocol-level errors for switchboard.
///
/// Wraps transport, store and broker failures and adds protocol-specific
/// variants (codec, handshake, runtime lifecycle).
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] switchboard_transport::TransportError),

    #[error("membership store error: {0}")]
    Store(#[from] StoreError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("ack failed: {0}")]
    Ack(#[from] AckError),

    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("runtime shut down")]
    Shutdown,
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::InvalidFrame {
            reason: e.to_string(),
        }
    }
}

/// Failure delivered to a pending ack callback in place of a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AckError {
    /// No response arrived before the configured expiry.
    #[error("ack timed out after {0:?}")]
    Expired(Duration),

    /// The session owning the ack went away before it resolved.
    #[error("session dropped")]
    Dropped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_invalid_frame() {
        let err = ProtocolError::InvalidFrame {
            reason: "event name must be a string".into(),
        };
        assert_eq!(err.to_string(), "invalid frame: event name must be a string");
    }

    #[test]
    fn test_display_unauthorized() {
        let err = ProtocolError::Unauthorized {
            reason: "handshake timed out".into(),
        };
        assert_eq!(err.to_string(), "unauthorized: handshake timed out");
    }

    #[test]
    fn test_display_store_wraps_source() {
        let err = ProtocolError::from(StoreError::Unavailable);
        assert_eq!(err.to_string(), "membership store error: store unavailable");
    }

    #[test]
    fn test_json_error_becomes_invalid_frame() {
        let json_err = serde_json::from_str::<serde_json::Value>("[1,").unwrap_err();
        let err = ProtocolError::from(json_err);
        assert!(matches!(err, ProtocolError::InvalidFrame { .. }));
    }

    #[test]
    fn test_display_ack_expired() {
        let err = AckError::Expired(Duration::from_millis(250));
        assert_eq!(err.to_string(), "ack timed out after 250ms");
    }
}
