use std::fmt;

use tokio::sync::mpsc;

use crate::{Frame, TransportError};

/// Identifies one physical link (one transport instance).
///
/// A logical session may span several links over its lifetime (one per
/// reconnect); signals are stamped with the link that produced them so that
/// late signals from a replaced link can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The id following this one.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Signals a transport emits towards its owner.
#[derive(Debug)]
pub enum TransportSignal {
    /// The link is established and frames may be sent.
    Open,
    /// The link is gone (refused, dropped, or closed by either side).
    Close,
    /// Non-fatal transport failure.
    Error(TransportError),
    /// An incoming text frame.
    Message(Frame),
}

/// Receiving side of a signal channel, shared by every link of one owner.
pub type SignalReceiver = mpsc::UnboundedReceiver<(LinkId, TransportSignal)>;

/// Sending side handed to a transport. Every signal is stamped with `link`.
#[derive(Debug, Clone)]
pub struct SignalSender {
    link: LinkId,
    tx: mpsc::UnboundedSender<(LinkId, TransportSignal)>,
}

impl SignalSender {
    /// The link this sender stamps onto signals.
    pub fn link(&self) -> LinkId {
        self.link
    }

    /// A sender feeding the same channel under a different link id.
    pub fn for_link(&self, link: LinkId) -> Self {
        Self {
            link,
            tx: self.tx.clone(),
        }
    }

    /// Deliver a signal. Returns `false` if the owner is gone.
    pub fn emit(&self, signal: TransportSignal) -> bool {
        self.tx.send((self.link, signal)).is_ok()
    }

    /// Whether the owner has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a signal channel. The sender starts out stamping `first`.
pub fn signal_channel(first: LinkId) -> (SignalSender, SignalReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SignalSender { link: first, tx }, rx)
}
