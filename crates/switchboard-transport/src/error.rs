/// Errors returned by the switchboard transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not open")]
    NotOpen,

    #[error("connect to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("send failed: {0}")]
    Send(#[source] anyhow::Error),

    #[error("link reset by peer: {0}")]
    Reset(String),

    #[error("listener is shut down")]
    ListenerClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_connect() {
        let err = TransportError::Connect {
            url: "mem://node-a".into(),
            source: anyhow::anyhow!("refused"),
        };
        assert_eq!(err.to_string(), "connect to mem://node-a failed: refused");
    }

    #[test]
    fn test_display_not_open() {
        assert_eq!(TransportError::NotOpen.to_string(), "transport is not open");
    }
}
