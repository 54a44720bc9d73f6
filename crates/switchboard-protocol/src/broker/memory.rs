use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use super::{pattern_matches, Broker, BrokerError, BrokerMessage, Subscription};

const BUS_CAPACITY: usize = 1024;
const SUBSCRIPTION_BUFFER: usize = 256;

/// In-process broker. Clones share one bus.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    bus: broadcast::Sender<BrokerMessage>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self { bus }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.bus.receiver_count()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        // No subscribers is not an error: the message is simply not kept.
        let _ = self.bus.send(BrokerMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        if pattern.is_empty() {
            return Err(BrokerError::InvalidPattern(pattern.to_string()));
        }
        let mut bus_rx = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let filter = pattern.to_string();

        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(msg) => {
                        if !pattern_matches(&filter, &msg.channel) {
                            continue;
                        }
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("broker: subscription {filter} lagged, {n} messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(pattern.to_string(), rx))
    }
}
