//! Session events and per-entity listener tables.
//!
//! Every entity that emits events (a [`Connection`](crate::Connection), a
//! [`Group`](crate::Group)) owns a [`Listeners`] table keyed by
//! [`EventKey`]. Handlers receive the entity itself as `&mut`, so they may
//! send, ack, or (un)register listeners while being dispatched.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use switchboard_transport::TransportError;

use crate::types::is_service_channel;

/// Key a listener is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    Connecting,
    Connect,
    Open,
    Disconnect,
    Close,
    Error,
    Data,
    Named(String),
    /// Receives every event, after the specific listeners.
    Any,
}

impl EventKey {
    pub fn named(name: impl Into<String>) -> Self {
        EventKey::Named(name.into())
    }
}

/// Something that happened on an entity.
#[derive(Debug, Clone)]
pub enum Event {
    /// A transport was created and is dialing.
    Connecting,
    /// The transport reported open (every time, reconnects included).
    Connect,
    /// The very first successful open of this session.
    Open,
    /// A live transport went away.
    Disconnect,
    /// Terminal close: no reconnect will follow.
    Close,
    Error(Arc<TransportError>),
    /// Opaque, non-event payload.
    Data(Value),
    Named { name: String, args: Vec<Value> },
}

impl Event {
    pub fn key(&self) -> EventKey {
        match self {
            Event::Connecting => EventKey::Connecting,
            Event::Connect => EventKey::Connect,
            Event::Open => EventKey::Open,
            Event::Disconnect => EventKey::Disconnect,
            Event::Close => EventKey::Close,
            Event::Error(_) => EventKey::Error,
            Event::Data(_) => EventKey::Data,
            Event::Named { name, .. } => EventKey::Named(name.clone()),
        }
    }

    /// Ack channel carried as the last argument of a named event, if any.
    pub fn ack_channel(&self) -> Option<String> {
        match self {
            Event::Named { args, .. } => args
                .last()
                .and_then(Value::as_str)
                .filter(|s| is_service_channel(s))
                .map(str::to_string),
            _ => None,
        }
    }
}

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Handler<C> = Box<dyn FnMut(&mut C, &Event) + Send>;

struct Entry<C> {
    id: ListenerId,
    once: bool,
    /// `None` while the handler is being dispatched.
    handler: Option<Handler<C>>,
}

/// Ordered handler lists per event key.
pub struct Listeners<C> {
    next_id: u64,
    table: HashMap<EventKey, Vec<Entry<C>>>,
}

impl<C> Default for Listeners<C> {
    fn default() -> Self {
        Self {
            next_id: 0,
            table: HashMap::new(),
        }
    }
}

impl<C> std::fmt::Debug for Listeners<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("keys", &self.table.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<C> Listeners<C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, key: EventKey, once: bool, handler: Handler<C>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.table.entry(key).or_default().push(Entry {
            id,
            once,
            handler: Some(handler),
        });
        id
    }

    pub fn on<F>(&mut self, key: EventKey, handler: F) -> ListenerId
    where
        F: FnMut(&mut C, &Event) + Send + 'static,
    {
        self.insert(key, false, Box::new(handler))
    }

    pub fn once<F>(&mut self, key: EventKey, handler: F) -> ListenerId
    where
        F: FnMut(&mut C, &Event) + Send + 'static,
    {
        self.insert(key, true, Box::new(handler))
    }

    /// Remove one listener. Returns whether it was registered.
    pub fn remove(&mut self, key: &EventKey, id: ListenerId) -> bool {
        let Some(entries) = self.table.get_mut(key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.table.remove(key);
        }
        removed
    }

    /// Remove every listener under `key`, or every listener at all.
    pub fn remove_all(&mut self, key: Option<&EventKey>) {
        match key {
            Some(key) => {
                self.table.remove(key);
            }
            None => self.table.clear(),
        }
    }

    pub fn count(&self, key: &EventKey) -> usize {
        self.table.get(key).map_or(0, Vec::len)
    }

    fn ids(&self, key: &EventKey) -> Vec<ListenerId> {
        self.table
            .get(key)
            .map(|entries| entries.iter().map(|e| e.id).collect())
            .unwrap_or_default()
    }

    /// Take a handler out for dispatch. A once-listener is unregistered here.
    fn take(&mut self, key: &EventKey, id: ListenerId) -> Option<Handler<C>> {
        let entries = self.table.get_mut(key)?;
        let pos = entries.iter().position(|e| e.id == id)?;
        if entries[pos].once {
            let entry = entries.remove(pos);
            if entries.is_empty() {
                self.table.remove(key);
            }
            entry.handler
        } else {
            entries[pos].handler.take()
        }
    }

    /// Return a dispatched handler. Dropped if it was removed meanwhile.
    fn restore(&mut self, key: &EventKey, id: ListenerId, handler: Handler<C>) {
        if let Some(entry) = self
            .table
            .get_mut(key)
            .and_then(|entries| entries.iter_mut().find(|e| e.id == id))
        {
            if entry.handler.is_none() {
                entry.handler = Some(handler);
            }
        }
    }
}

/// An entity that dispatches [`Event`]s to its own listener table.
pub trait Emitter: Sized {
    fn listeners_mut(&mut self) -> &mut Listeners<Self>;

    /// Dispatch `event` to the listeners of its key, then to catch-all
    /// listeners. Listeners added during dispatch only see later events.
    /// Returns whether any listener ran.
    fn emit(&mut self, event: &Event) -> bool {
        let mut fired = false;
        for key in [event.key(), EventKey::Any] {
            for id in self.listeners_mut().ids(&key) {
                let Some(mut handler) = self.listeners_mut().take(&key, id) else {
                    continue;
                };
                handler(self, event);
                fired = true;
                self.listeners_mut().restore(&key, id, handler);
            }
        }
        fired
    }
}
