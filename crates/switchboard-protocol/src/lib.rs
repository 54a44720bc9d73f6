//! Switchboard protocol layer.
//!
//! Sessions, acks, groups and cross-node fan-out on top of
//! `switchboard-transport`. A peer keeps one durable [`ConnectionId`] across
//! reconnects; nodes keep group membership in a shared [`MembershipStore`]
//! and route events to each other through a [`Broker`].
//!
//! Peer frames: JSON arrays `[event, args..., ackChannel?]`.
//! Broker envelopes: MessagePack.

pub mod broker;
pub mod codec;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod events;
pub mod group;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod selector;
pub mod store;
pub mod types;

pub use broker::{Broker, BrokerError, BrokerMessage, MemoryBroker, Subscription};
pub use codec::Incoming;
pub use connection::{
    AckResult, Ackable, Client, ClientChannels, ClientHandle, Connection,
    ConnectionConfig, Sendable,
};
pub use envelope::{Envelope, Target};
pub use error::{AckError, ProtocolError};
pub use events::{Emitter, Event, EventKey, ListenerId, Listeners};
pub use group::Group;
pub use queue::{OutgoingQueue, Priority};
pub use registry::{Registry, RegistryEvent};
pub use runtime::{NodeChannels, NodeConfig, NodeEvent, NodeHandle, NodeRuntime};
pub use selector::{Filters, Publisher, SelectionRule, Selector};
pub use store::{MembershipStore, MemoryStore, SqliteStore, StoreCommand, StoreError, StoreReply};
pub use types::{ConnectionId, GroupId};
