//! Fan-out broker.
//!
//! Nodes publish envelopes on named channels and receive everything matching
//! a glob pattern. Delivery is best effort: at least once, ordered per
//! channel, nothing is kept for subscribers that are not listening.

mod memory;

pub use memory::MemoryBroker;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Errors from a broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

/// One message received through a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Bytes,
}

/// Stream of messages matching one pattern.
#[derive(Debug)]
pub struct Subscription {
    pattern: String,
    rx: mpsc::Receiver<BrokerMessage>,
}

impl Subscription {
    pub fn new(pattern: String, rx: mpsc::Receiver<BrokerMessage>) -> Self {
        Self { pattern, rx }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next message. `None` once the broker is gone.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.rx.recv().await
    }
}

/// Publish/subscribe fan-out shared by every node.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe to every channel matching `pattern` (`*` matches any run
    /// of characters, `?` exactly one).
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError>;
}

/// Glob match of `channel` against `pattern`.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = channel.chars().collect();
    let (mut pi, mut ci) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ci < c.len() {
        match p.get(pi) {
            Some('*') => {
                backtrack = Some((pi, ci));
                pi += 1;
            }
            Some('?') => {
                pi += 1;
                ci += 1;
            }
            Some(ch) if *ch == c[ci] => {
                pi += 1;
                ci += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    pi = star + 1;
                    ci = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    p[pi..].iter().all(|ch| *ch == '*')
}
