//! Per-node connection registry.
//!
//! Owns every server-side session on this node, the local group mirrors and
//! the named filters. Pure state machine: the node loop feeds it transport
//! signals, timer ticks and store results, and acts on the returned
//! [`RegistryEvent`]s. Store I/O never happens here.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde_json::{json, Value};
use switchboard_transport::{LinkId, SignalSender, Transport, TransportSignal, CLOSE_UNAUTHORIZED};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::connection::{AckResult, Ackable, Connection, Sendable};
use crate::error::ProtocolError;
use crate::events::{Event, EventKey, ListenerId};
use crate::group::Group;
use crate::selector::Filters;
use crate::store::StoreError;
use crate::types::{nonce, ConnectionId, GroupId, AUTH_EVENT};

/// What a session reports back to the registry.
enum SessionNote {
    Event(Event),
    Handshake(AckResult),
}

/// Outcome of registry operations, for the node loop to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// The peer proved its id; its registration must be written to the store.
    Authenticated { link: LinkId, id: ConnectionId },
    /// The session is registered and attached to its groups.
    Registered { link: LinkId, id: ConnectionId },
    /// The last local session of `id` went away.
    Unregistered { id: ConnectionId },
    /// The session was refused and is being closed.
    Rejected { link: LinkId, reason: String },
    /// A named event from a registered session.
    Message {
        link: LinkId,
        id: ConnectionId,
        name: String,
        args: Vec<Value>,
    },
    /// An opaque data frame from a registered session.
    Data {
        link: LinkId,
        id: ConnectionId,
        value: Value,
    },
}

pub struct Registry {
    sessions: HashMap<LinkId, Connection>,
    registered: HashMap<LinkId, ConnectionId>,
    conns: HashMap<ConnectionId, Vec<LinkId>>,
    groups: HashMap<GroupId, Group>,
    memberships: HashMap<LinkId, BTreeSet<GroupId>>,
    filters: Filters,
    handshake_timeout: Duration,
    notes_tx: mpsc::UnboundedSender<(LinkId, SessionNote)>,
    notes_rx: mpsc::UnboundedReceiver<(LinkId, SessionNote)>,
}

impl Registry {
    pub fn new(handshake_timeout: Duration) -> Self {
        let (notes_tx, notes_rx) = mpsc::unbounded_channel();
        Self {
            sessions: HashMap::new(),
            registered: HashMap::new(),
            conns: HashMap::new(),
            groups: HashMap::new(),
            memberships: HashMap::new(),
            filters: Filters::new(),
            handshake_timeout,
            notes_tx,
            notes_rx,
        }
    }

    // ── Session lifecycle ─────────────────────────────────────────────

    /// Take a freshly accepted transport as a provisional session and
    /// challenge it for its id.
    pub fn attach(
        &mut self,
        link: LinkId,
        transport: Box<dyn Transport>,
        signals: SignalSender,
        queue_limit: usize,
    ) {
        let mut conn = Connection::accepted(transport, signals, queue_limit);

        let relay = self.notes_tx.clone();
        conn.on(EventKey::Any, move |_, event| {
            let _ = relay.send((link, SessionNote::Event(event.clone())));
        });

        let reply = self.notes_tx.clone();
        let challenge = conn
            .expire(self.handshake_timeout)
            .send_with_ack(AUTH_EVENT, vec![json!(nonce())], move |_, result| {
                let _ = reply.send((link, SessionNote::Handshake(result)));
            });
        if let Err(e) = challenge {
            tracing::warn!("registry: failed to challenge {link}: {e}");
            conn.close_with(CLOSE_UNAUTHORIZED, "Unauthorized");
        }

        tracing::debug!("registry: {link} attached, awaiting handshake");
        self.sessions.insert(link, conn);
    }

    /// Feed a transport signal to the session on `link`.
    pub fn handle_signal(&mut self, link: LinkId, signal: TransportSignal) -> Vec<RegistryEvent> {
        match self.sessions.get_mut(&link) {
            Some(conn) => conn.handle_signal(link, signal),
            None => tracing::trace!("registry: signal for unknown {link}"),
        }
        self.drain_notes()
    }

    /// Run due session timers (handshake expiry above all).
    pub fn tick(&mut self, now: Instant) -> Vec<RegistryEvent> {
        for conn in self.sessions.values_mut() {
            conn.tick(now);
        }
        self.drain_notes()
    }

    /// Flush every session that queued frames since its last flush.
    pub fn flush_pending(&mut self) {
        for conn in self.sessions.values_mut() {
            if conn.has_pending_flush() {
                conn.flush();
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(Connection::next_deadline)
            .min()
    }

    fn drain_notes(&mut self) -> Vec<RegistryEvent> {
        let mut out = Vec::new();
        while let Ok((link, note)) = self.notes_rx.try_recv() {
            match note {
                SessionNote::Handshake(result) => self.finish_handshake(link, result, &mut out),
                SessionNote::Event(Event::Close) => self.detach(link, &mut out),
                SessionNote::Event(Event::Named { name, args }) => {
                    match self.registered.get(&link) {
                        Some(id) => out.push(RegistryEvent::Message {
                            link,
                            id: id.clone(),
                            name,
                            args,
                        }),
                        None => tracing::debug!("registry: dropping {name} from provisional {link}"),
                    }
                }
                SessionNote::Event(Event::Data(value)) => {
                    if let Some(id) = self.registered.get(&link) {
                        out.push(RegistryEvent::Data {
                            link,
                            id: id.clone(),
                            value,
                        });
                    }
                }
                SessionNote::Event(Event::Error(e)) => {
                    tracing::debug!("registry: {link} transport error: {e}");
                }
                SessionNote::Event(_) => {}
            }
        }
        out
    }

    fn finish_handshake(&mut self, link: LinkId, result: AckResult, out: &mut Vec<RegistryEvent>) {
        let outcome = result
            .map_err(|e| format!("handshake failed: {e}"))
            .and_then(|args| parse_auth_reply(&args));
        match outcome {
            Ok(id) => {
                tracing::debug!("registry: {link} authenticated as {id}");
                out.push(RegistryEvent::Authenticated { link, id });
            }
            Err(reason) => self.reject(link, ProtocolError::Unauthorized { reason }, out),
        }
    }

    fn reject(&mut self, link: LinkId, error: ProtocolError, out: &mut Vec<RegistryEvent>) {
        tracing::info!("registry: rejecting {link}: {error}");
        if let Some(conn) = self.sessions.get_mut(&link) {
            conn.close_with(CLOSE_UNAUTHORIZED, "Unauthorized");
        }
        out.push(RegistryEvent::Rejected {
            link,
            reason: error.to_string(),
        });
    }

    /// Complete a registration once the store reported `groups` for `id`.
    pub fn register(
        &mut self,
        link: LinkId,
        id: ConnectionId,
        groups: Vec<GroupId>,
    ) -> Vec<RegistryEvent> {
        let Some(conn) = self.sessions.get_mut(&link) else {
            tracing::debug!("registry: {link} closed before registration of {id} completed");
            return Vec::new();
        };
        conn.set_id(id.clone());
        self.registered.insert(link, id.clone());
        self.conns.entry(id.clone()).or_default().push(link);

        let joined = self.memberships.entry(link).or_default();
        for group in groups {
            self.groups
                .entry(group.clone())
                .or_insert_with(|| Group::new(group.clone()))
                .attach(link);
            joined.insert(group);
        }
        tracing::info!("registry: {id} registered on {link}");
        vec![RegistryEvent::Registered { link, id }]
    }

    /// The store could not register the session: refuse it.
    pub fn registration_failed(&mut self, link: LinkId, error: StoreError) -> Vec<RegistryEvent> {
        let mut out = Vec::new();
        let error = ProtocolError::Unauthorized {
            reason: format!("registration failed: {error}"),
        };
        self.reject(link, error, &mut out);
        out
    }

    fn detach(&mut self, link: LinkId, out: &mut Vec<RegistryEvent>) {
        self.sessions.remove(&link);
        for group in self.memberships.remove(&link).unwrap_or_default() {
            if let Some(g) = self.groups.get_mut(&group) {
                g.detach(link);
            }
        }
        let Some(id) = self.registered.remove(&link) else {
            tracing::debug!("registry: provisional {link} closed");
            return;
        };
        let now_empty = match self.conns.get_mut(&id) {
            Some(links) => {
                links.retain(|l| *l != link);
                links.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.conns.remove(&id);
            tracing::info!("registry: {id} unregistered");
            out.push(RegistryEvent::Unregistered { id });
        }
    }

    // ── Membership mirror ─────────────────────────────────────────────

    /// Attach every local session of `id` to `groups`. Call only after the
    /// store accepted the join.
    pub fn mirror_join(&mut self, id: &ConnectionId, groups: &[GroupId]) {
        let Some(links) = self.conns.get(id) else {
            return;
        };
        for &link in links {
            let joined = self.memberships.entry(link).or_default();
            for group in groups {
                self.groups
                    .entry(group.clone())
                    .or_insert_with(|| Group::new(group.clone()))
                    .attach(link);
                joined.insert(group.clone());
            }
        }
    }

    /// Detach every local session of `id` from `groups`. Call only after
    /// the store accepted the leave.
    pub fn mirror_leave(&mut self, id: &ConnectionId, groups: &[GroupId]) {
        let Some(links) = self.conns.get(id) else {
            return;
        };
        for &link in links {
            for group in groups {
                if let Some(g) = self.groups.get_mut(group) {
                    g.detach(link);
                }
                if let Some(joined) = self.memberships.get_mut(&link) {
                    joined.remove(group);
                }
            }
        }
    }

    // ── Delivery ──────────────────────────────────────────────────────

    /// Deliver `event` once to every local session of the resolved ids,
    /// then notify the taps of `targeted` groups and of the ids' personal
    /// groups, each once. Returns the number of sessions reached.
    ///
    /// Sessions are looked up through `conns`; group mirrors only carry taps.
    pub fn deliver(
        &mut self,
        event: &str,
        args: &[Value],
        ids: &[ConnectionId],
        targeted: &[GroupId],
    ) -> usize {
        let links: BTreeSet<LinkId> = ids
            .iter()
            .filter_map(|id| self.conns.get(id))
            .flatten()
            .copied()
            .collect();

        let mut delivered = 0;
        for link in links {
            let Some(conn) = self.sessions.get_mut(&link) else {
                continue;
            };
            match conn.send_event(event, args) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("registry: failed to queue {event} on {link}: {e}"),
            }
        }

        let tapped: BTreeSet<GroupId> = targeted
            .iter()
            .cloned()
            .chain(ids.iter().map(ConnectionId::personal_group))
            .collect();
        for group in tapped {
            if let Some(g) = self.groups.get_mut(&group) {
                g.notify(event, args);
            }
        }

        tracing::trace!("registry: {event} delivered to {delivered} local sessions");
        delivered
    }

    /// Queue `event` on one session directly.
    pub fn send_to(&mut self, link: LinkId, event: &str, args: &[Value]) -> Result<bool, ProtocolError> {
        match self.sessions.get_mut(&link) {
            Some(conn) => conn.send_event(event, args).map(|()| true),
            None => Ok(false),
        }
    }

    /// Answer an ack channel a session sent.
    pub fn ack(&mut self, link: LinkId, channel: &str, args: &[Value]) -> Result<bool, ProtocolError> {
        match self.sessions.get_mut(&link) {
            Some(conn) => conn.ack(channel, args),
            None => Ok(false),
        }
    }

    /// Orderly close of every local session of `id`.
    pub fn disconnect(&mut self, id: &ConnectionId) -> usize {
        let links = self.conns.get(id).cloned().unwrap_or_default();
        for link in &links {
            if let Some(conn) = self.sessions.get_mut(link) {
                conn.end();
            }
        }
        links.len()
    }

    /// Close every session, registered or not.
    pub fn close_all(&mut self) {
        for conn in self.sessions.values_mut() {
            conn.end();
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Registered ids with at least one local session, sorted.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.conns.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of the local sessions attached to `group`, sorted and unique.
    pub fn group_members(&self, group: &GroupId) -> Vec<ConnectionId> {
        let Some(g) = self.groups.get(group) else {
            return Vec::new();
        };
        let ids: BTreeSet<ConnectionId> = g
            .members()
            .filter_map(|link| self.registered.get(&link).cloned())
            .collect();
        ids.into_iter().collect()
    }

    pub fn is_registered(&self, link: LinkId) -> bool {
        self.registered.contains_key(&link)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ── Groups & filters ──────────────────────────────────────────────

    /// The local group `id`, created on first reference.
    pub fn group(&mut self, id: &GroupId) -> &mut Group {
        self.groups
            .entry(id.clone())
            .or_insert_with(|| Group::new(id.clone()))
    }

    pub fn on_group<F>(&mut self, id: &GroupId, key: EventKey, handler: F) -> ListenerId
    where
        F: FnMut(&mut Group, &Event) + Send + 'static,
    {
        self.group(id).on(key, handler)
    }

    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    pub fn filters_mut(&mut self) -> &mut Filters {
        &mut self.filters
    }
}

/// Parse `[error|null, connectionId]`.
fn parse_auth_reply(args: &[Value]) -> Result<ConnectionId, String> {
    match args {
        [Value::Null, Value::String(id), ..] => {
            let id = ConnectionId::from(id.as_str());
            if id.is_acceptable() {
                Ok(id)
            } else {
                Err(format!("reserved connection id {id}"))
            }
        }
        [Value::Null, other, ..] => Err(format!("invalid connection id {other}")),
        [Value::Null] | [] => Err("missing connection id".to_string()),
        [err, ..] => Err(format!("peer refused: {err}")),
    }
}
