//! Switchboard transport layer.
//!
//! Defines the contract every concrete socket (WebSocket, SockJS, ...) must
//! satisfy to carry switchboard sessions: a bidirectional text-frame channel
//! with a readiness state that reports `Open`, `Close`, `Error` and
//! `Message` signals to its owner.
//!
//! Signals never flow through callbacks. A transport is handed a
//! [`SignalSender`] when it is created and pushes stamped signals into the
//! owner's channel; the owner drains them on its own event loop.
//!
//! # Quick start
//!
//! ```rust
//! use switchboard_transport::{memory, signal_channel, Connector, LinkId, TransportSignal};
//!
//! # async fn example() -> Result<(), switchboard_transport::TransportError> {
//! use switchboard_transport::Listener;
//!
//! let (connector, mut listener) = memory::network();
//! let (client_signals, mut client_rx) = signal_channel(LinkId::new(1));
//! let (server_signals, _server_rx) = signal_channel(LinkId::new(1));
//!
//! let mut client = connector.connect("mem://node", client_signals)?;
//! let _server = listener.accept(server_signals).await?;
//!
//! let (_, signal) = client_rx.recv().await.expect("open signal");
//! assert!(matches!(signal, TransportSignal::Open));
//! client.send(r#"["hello"]"#)?;
//! # Ok(())
//! # }
//! ```

mod error;
pub mod memory;
mod signal;

pub use error::TransportError;
pub use signal::{signal_channel, LinkId, SignalReceiver, SignalSender, TransportSignal};

/// A single text frame on the wire.
pub type Frame = String;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Closure because the peer failed to authenticate.
pub const CLOSE_UNAUTHORIZED: u16 = 1011;

/// Readiness of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    Connecting,
    Open,
    Closed,
}

/// A bidirectional frame channel to one peer.
///
/// `send` must not block: a transport either accepts the frame into its own
/// buffer or fails immediately.
pub trait Transport: Send {
    /// Current readiness.
    fn ready_state(&self) -> ReadyState;

    /// Hand one frame to the wire. Fails with [`TransportError::NotOpen`]
    /// unless the transport is `Open`.
    fn send(&mut self, frame: &str) -> Result<(), TransportError>;

    /// Begin closing. The transport reports completion with a
    /// [`TransportSignal::Close`].
    fn close(&mut self, code: u16, reason: &str);
}

/// Client side factory: dials a URL and returns a transport in the
/// `Connecting` (or already failed) state.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        url: &str,
        signals: SignalSender,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Server side factory: yields one transport per accepted peer.
///
/// Implementations must be cancel-safe: a dropped `accept` future must not
/// lose a pending peer.
#[async_trait::async_trait]
pub trait Listener: Send {
    async fn accept(&mut self, signals: SignalSender) -> Result<Box<dyn Transport>, TransportError>;
}
