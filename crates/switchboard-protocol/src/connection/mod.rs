//! Per-peer session.
//!
//! A [`Connection`] wraps one transport at a time and owns everything that
//! must survive across transports: the outgoing queue, the reconnect
//! backoff, pending acks, and the listener table. It is a pure state
//! machine: transport signals go in through [`Connection::handle_signal`],
//! timers through [`Connection::tick`], and the owner's event loop drives
//! both (see [`Client`] for a ready-made loop).

mod ack;
mod client;

pub use client::{Client, ClientChannels, ClientHandle};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use switchboard_transport::{
    signal_channel, Connector, Frame, LinkId, ReadyState, SignalReceiver, SignalSender, Transport,
    TransportError, TransportSignal, CLOSE_NORMAL,
};
use tokio::time::Instant;

use crate::codec::{self, Incoming};
use crate::error::{AckError, ProtocolError};
use crate::events::{Emitter, Event, EventKey, ListenerId, Listeners};
use crate::queue::{OutgoingQueue, Priority};
use crate::types::{
    is_service_channel, ConnectionId, AUTH_EVENT, CLOSE_EVENT, DEFAULT_QUEUE_LIMIT,
    RECONNECT_TIMEOUT, REOPEN_DELAY,
};

use ack::AckTable;

/// Outcome handed to an ack callback: the response arguments, or why none
/// will come.
pub type AckResult = Result<Vec<Value>, AckError>;

type AckCallback = Box<dyn FnOnce(&mut Connection, AckResult) + Send>;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for a client-side session.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Address handed to the connector.
    pub url: String,
    /// Outgoing queue capacity.
    pub queue_limit: usize,
    /// Initial reconnect delay. Zero disables reconnection.
    pub reconnect_timeout: Duration,
    /// Durable id announced during the handshake. Generated when absent.
    pub id: Option<ConnectionId>,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue_limit: DEFAULT_QUEUE_LIMIT,
            reconnect_timeout: RECONNECT_TIMEOUT,
            id: None,
        }
    }

    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }

    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    pub fn with_id(mut self, id: impl Into<ConnectionId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new("")
    }
}

// ── Capabilities ──────────────────────────────────────────────────────

/// Anything that can queue an event frame towards its peer.
pub trait Sendable {
    /// Queue `payload` (`[name, args...]`) for delivery.
    fn send_frame(&mut self, payload: &[Value]) -> Result<(), ProtocolError>;

    fn send_event(&mut self, event: &str, args: &[Value]) -> Result<(), ProtocolError> {
        let mut payload = Vec::with_capacity(args.len() + 1);
        payload.push(Value::String(event.to_string()));
        payload.extend_from_slice(args);
        self.send_frame(&payload)
    }
}

/// Anything that can answer an ack channel named by its peer.
pub trait Ackable: Sendable {
    /// Reply on `channel`. Only channels under the service prefix are
    /// answered; anything else is ignored and `Ok(false)` returned.
    fn ack(&mut self, channel: &str, args: &[Value]) -> Result<bool, ProtocolError> {
        if !is_service_channel(channel) || channel == CLOSE_EVENT {
            tracing::debug!("connection: ignoring ack on non-service channel {channel:?}");
            return Ok(false);
        }
        self.send_event(channel, args)?;
        Ok(true)
    }
}

// ── Connection ────────────────────────────────────────────────────────

/// One logical peer session.
pub struct Connection {
    id: ConnectionId,
    url: String,
    connector: Option<Arc<dyn Connector>>,
    transport: Option<Box<dyn Transport>>,
    signals: SignalSender,
    link: LinkId,

    queue: OutgoingQueue<Frame>,
    flush_pending: bool,
    quality_next: bool,
    expire_next: Option<Duration>,

    /// Initial backoff; zero means the session never reconnects.
    reconnect_timeout: Duration,
    backoff: Duration,
    reconnect: bool,
    reconnect_at: Option<Instant>,
    reopen_at: Option<Instant>,

    live: bool,
    opened_once: bool,
    terminated: bool,

    acks: AckTable<AckCallback>,
    listeners: Listeners<Connection>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("link", &self.link)
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .field("pending_acks", &self.acks.len())
            .finish()
    }
}

impl Connection {
    /// A client-side session dialing `config.url` through `connector`.
    ///
    /// Answers the node's `auth` challenge with its id. Nothing is dialed
    /// until [`open`](Self::open).
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> (Self, SignalReceiver) {
        let (signals, rx) = signal_channel(LinkId::new(0));
        let mut conn = Self::base(
            config.id.unwrap_or_default(),
            config.url,
            Some(connector),
            None,
            signals,
            config.queue_limit,
            config.reconnect_timeout,
        );
        conn.on(EventKey::named(AUTH_EVENT), |conn, event| {
            if let Some(channel) = event.ack_channel() {
                let id = Value::String(conn.id.to_string());
                if let Err(e) = conn.ack(&channel, &[Value::Null, id]) {
                    tracing::warn!("connection: failed to answer auth challenge: {e}");
                }
            }
        });
        (conn, rx)
    }

    /// A server-side session over an already accepted transport. Never
    /// reconnects; the id stays provisional until [`set_id`](Self::set_id).
    pub fn accepted(
        transport: Box<dyn Transport>,
        signals: SignalSender,
        queue_limit: usize,
    ) -> Self {
        Self::base(
            ConnectionId::new(),
            String::new(),
            None,
            Some(transport),
            signals,
            queue_limit,
            Duration::ZERO,
        )
    }

    fn base(
        id: ConnectionId,
        url: String,
        connector: Option<Arc<dyn Connector>>,
        transport: Option<Box<dyn Transport>>,
        signals: SignalSender,
        queue_limit: usize,
        reconnect_timeout: Duration,
    ) -> Self {
        Self {
            id,
            url,
            connector,
            transport,
            link: signals.link(),
            signals,
            queue: OutgoingQueue::new(queue_limit),
            flush_pending: false,
            quality_next: false,
            expire_next: None,
            reconnect_timeout,
            backoff: reconnect_timeout,
            reconnect: !reconnect_timeout.is_zero(),
            reconnect_at: None,
            reopen_at: None,
            live: false,
            opened_once: false,
            terminated: false,
            acks: AckTable::new(),
            listeners: Listeners::new(),
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn set_id(&mut self, id: ConnectionId) {
        self.id = id;
    }

    /// Link of the current (or most recent) transport.
    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn state(&self) -> ReadyState {
        self.transport
            .as_ref()
            .map_or(ReadyState::Closed, |t| t.ready_state())
    }

    /// Whether the session reached its terminal close.
    pub fn is_closed(&self) -> bool {
        self.terminated
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Delay the next reconnect will wait.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    // ── Listeners ─────────────────────────────────────────────────────

    pub fn on<F>(&mut self, key: EventKey, handler: F) -> ListenerId
    where
        F: FnMut(&mut Connection, &Event) + Send + 'static,
    {
        self.listeners.on(key, handler)
    }

    pub fn once<F>(&mut self, key: EventKey, handler: F) -> ListenerId
    where
        F: FnMut(&mut Connection, &Event) + Send + 'static,
    {
        self.listeners.once(key, handler)
    }

    pub fn remove_listener(&mut self, key: &EventKey, id: ListenerId) -> bool {
        self.listeners.remove(key, id)
    }

    pub fn remove_all_listeners(&mut self, key: Option<&EventKey>) {
        self.listeners.remove_all(key);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Dial a new transport. No-op while one is open or connecting.
    pub fn open(&mut self) {
        if matches!(self.state(), ReadyState::Open | ReadyState::Connecting) {
            return;
        }
        let Some(connector) = self.connector.clone() else {
            tracing::debug!("connection: {} has no connector, cannot open", self.id);
            return;
        };

        self.reconnect_at = None;
        self.reopen_at = None;
        self.reconnect = !self.reconnect_timeout.is_zero();
        self.terminated = false;
        self.link = self.link.next();

        match connector.connect(&self.url, self.signals.for_link(self.link)) {
            Ok(transport) => {
                self.transport = Some(transport);
                self.emit(&Event::Connecting);
            }
            Err(e) => {
                tracing::warn!("connection: {} failed to dial {}: {e}", self.id, self.url);
                self.emit(&Event::Error(Arc::new(e)));
                self.transport_closed();
            }
        }
    }

    /// Close for good: reconnection is disabled and the transport closed.
    /// Pending acks are left in place.
    pub fn close(&mut self) {
        self.close_with(CLOSE_NORMAL, "closed");
    }

    pub fn close_with(&mut self, code: u16, reason: &str) {
        self.reconnect = false;
        self.reconnect_at = None;
        self.reopen_at = None;
        match self.transport.as_mut() {
            Some(transport) if transport.ready_state() != ReadyState::Closed => {
                transport.close(code, reason);
            }
            _ => {
                self.transport = None;
                if !self.terminated {
                    self.transport_closed();
                }
            }
        }
    }

    /// Close, then open again after `delay` (100 ms when `None`).
    pub fn reopen(&mut self, delay: Option<Duration>) {
        self.close();
        self.reopen_at = Some(Instant::now() + delay.unwrap_or(REOPEN_DELAY));
    }

    /// Announce an orderly close to the peer, then close.
    pub fn end(&mut self) {
        if let Err(e) = self.send_event(CLOSE_EVENT, &[]) {
            tracing::warn!("connection: {} failed to queue close notice: {e}", self.id);
        }
        self.flush();
        self.close();
    }

    // ── Sending ───────────────────────────────────────────────────────

    /// Make the next queued frame jump the line.
    pub fn quality(&mut self) -> &mut Self {
        self.quality_next = true;
        self
    }

    /// Expire the next ack-carrying send after `after`.
    pub fn expire(&mut self, after: Duration) -> &mut Self {
        self.expire_next = Some(after);
        self
    }

    /// Queue event `name` with `args`.
    pub fn send(&mut self, name: &str, args: Vec<Value>) -> Result<(), ProtocolError> {
        self.send_event(name, &args)
    }

    /// Queue an opaque data frame.
    pub fn send_data(&mut self, value: &Value) -> Result<(), ProtocolError> {
        let frame = codec::encode_data(value)?;
        self.enqueue(frame);
        Ok(())
    }

    /// Queue event `name` with an ack channel appended to `args`. The
    /// callback runs once: with the peer's response, or with
    /// [`AckError::Expired`] if an expiry was set and passes first.
    ///
    /// Returns the reserved channel name.
    pub fn send_with_ack<F>(
        &mut self,
        name: &str,
        mut args: Vec<Value>,
        callback: F,
    ) -> Result<String, ProtocolError>
    where
        F: FnOnce(&mut Connection, AckResult) + Send + 'static,
    {
        let channel = self.acks.reserve();
        args.push(Value::String(channel.clone()));
        self.send_event(name, &args)?;
        let expiry = self.expire_next.take();
        self.acks
            .insert(channel.clone(), Box::new(callback), Instant::now(), expiry);
        Ok(channel)
    }

    fn enqueue(&mut self, frame: Frame) {
        let priority = if std::mem::take(&mut self.quality_next) {
            Priority::Quality
        } else {
            Priority::Normal
        };
        if self.queue.push(frame, priority).is_some() {
            tracing::warn!(
                "connection: {} queue full ({}), dropped oldest frame",
                self.id,
                self.queue.limit()
            );
        }
        self.flush_pending = true;
    }

    /// Whether frames were queued since the last flush.
    pub fn has_pending_flush(&self) -> bool {
        self.flush_pending
    }

    /// Hand queued frames to the transport until it is empty or a send
    /// fails. A failed frame stays at the head of the queue.
    pub fn flush(&mut self) {
        self.flush_pending = false;
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let mut failure = None;
        while transport.ready_state() == ReadyState::Open {
            let Some(frame) = self.queue.pop_front() else {
                break;
            };
            if let Err(e) = transport.send(&frame) {
                self.queue.restore_front(frame);
                failure = Some(e);
                break;
            }
        }
        if let Some(e) = failure {
            tracing::warn!(
                "connection: {} send failed, {} frames held: {e}",
                self.id,
                self.queue.len()
            );
            self.emit(&Event::Error(Arc::new(e)));
        }
    }

    // ── Inputs ────────────────────────────────────────────────────────

    /// Feed one transport signal. Signals from replaced links are ignored.
    pub fn handle_signal(&mut self, link: LinkId, signal: TransportSignal) {
        if link != self.link {
            tracing::trace!("connection: {} ignoring stale signal from {link}", self.id);
            return;
        }
        match signal {
            TransportSignal::Open => self.transport_opened(),
            TransportSignal::Close => self.transport_closed(),
            TransportSignal::Error(e) => self.transport_error(e),
            TransportSignal::Message(frame) => self.handle_frame(&frame),
        }
    }

    fn transport_opened(&mut self) {
        self.backoff = self.reconnect_timeout;
        self.emit(&Event::Connect);
        if !self.opened_once {
            self.opened_once = true;
            self.emit(&Event::Open);
        }
        self.live = true;
        self.flush();
    }

    fn transport_closed(&mut self) {
        self.transport = None;
        if self.terminated {
            return;
        }
        if self.live {
            self.live = false;
            self.emit(&Event::Disconnect);
        }
        if self.reconnect {
            let delay = self.backoff;
            self.reconnect_at = Some(Instant::now() + delay);
            self.backoff = self.backoff.saturating_mul(2);
            tracing::debug!("connection: {} reconnecting in {delay:?}", self.id);
        } else {
            self.reconnect_at = None;
            self.opened_once = false;
            self.terminated = true;
            self.emit(&Event::Close);
        }
    }

    fn transport_error(&mut self, e: TransportError) {
        tracing::debug!("connection: {} transport error: {e}", self.id);
        self.emit(&Event::Error(Arc::new(e)));
    }

    /// Decode and dispatch one incoming frame. Undecodable frames are
    /// logged and dropped.
    pub fn handle_frame(&mut self, frame: &str) {
        match codec::decode_frame(frame) {
            Err(e) => {
                tracing::warn!("connection: {} dropping bad frame: {e}", self.id);
            }
            Ok(Incoming::Data(value)) => {
                self.emit(&Event::Data(value));
            }
            Ok(Incoming::Event { name, .. }) if name == CLOSE_EVENT => {
                tracing::debug!("connection: {} closed by peer", self.id);
                self.close();
            }
            Ok(Incoming::Event { name, args }) if is_service_channel(&name) => {
                match self.acks.take(&name) {
                    Some(callback) => callback(self, Ok(args)),
                    None => tracing::debug!("connection: {} no pending ack for {name}", self.id),
                }
            }
            Ok(Incoming::Event { name, args }) => {
                self.emit(&Event::Named { name, args });
            }
        }
    }

    /// Run due timers: reopen/reconnect, ack expiries, then any pending
    /// flush.
    pub fn tick(&mut self, now: Instant) {
        if self.reopen_at.is_some_and(|at| at <= now) {
            self.reopen_at = None;
            self.open();
        }
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            self.open();
        }
        for (channel, callback, after) in self.acks.take_expired(now) {
            tracing::debug!("connection: {} ack {channel} expired", self.id);
            callback(self, Err(AckError::Expired(after)));
        }
        if self.flush_pending {
            self.flush();
        }
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.reopen_at, self.reconnect_at, self.acks.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }
}

impl Emitter for Connection {
    fn listeners_mut(&mut self) -> &mut Listeners<Self> {
        &mut self.listeners
    }
}

impl Sendable for Connection {
    fn send_frame(&mut self, payload: &[Value]) -> Result<(), ProtocolError> {
        let frame = codec::encode_frame(payload)?;
        self.enqueue(frame);
        Ok(())
    }
}

impl Ackable for Connection {}

#[cfg(test)]
pub(crate) mod mock;
