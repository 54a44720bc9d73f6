//! Node runtime: one event loop per node.
//!
//! The loop owns the [`Registry`](crate::registry::Registry) and every
//! server-side session. It accepts transports from a [`Listener`], drives
//! session timers, relays registry events to the application and delivers
//! envelopes received from the broker. Store batches never run on the loop;
//! they run on spawned tasks and report back through an internal channel.
mod r#loop;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use switchboard_transport::{LinkId, Listener};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::broker::Broker;
use crate::envelope::{subscription_pattern, DEFAULT_CHANNEL_PREFIX};
use crate::error::ProtocolError;
use crate::events::{EventKey, Handler, ListenerId};
use crate::group::Group;
use crate::selector::{FilterFn, Filters, Publisher, SelectionRule, Selector};
use crate::store::{groups_batch, join_batch, last_members, leave_batch, MembershipStore};
use crate::types::{
    nonce, ConnectionId, GroupId, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_QUEUE_LIMIT,
};

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ── Configuration ─────────────────────────────────────────────────────

/// Environment override for [`NodeConfig::node_id`].
pub const NODE_ID_ENV: &str = "SWITCHBOARD_NODE_ID";
/// Environment override for [`NodeConfig::channel_prefix`].
pub const CHANNEL_PREFIX_ENV: &str = "SWITCHBOARD_CHANNEL_PREFIX";

/// Configuration for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stamped on every envelope this node publishes.
    pub node_id: String,
    /// Broker channel prefix shared by every node of a deployment.
    pub channel_prefix: String,
    /// How long a provisional session has to answer the id challenge.
    pub handshake_timeout: Duration,
    /// Outgoing queue capacity of each session.
    pub queue_limit: usize,
    /// Capacity of the event channel towards the application.
    pub event_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", &nonce()[..8]),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            queue_limit: DEFAULT_QUEUE_LIMIT,
            event_buffer: 256,
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with the node id and channel prefix taken from the
    /// environment when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(id) = non_empty_env(NODE_ID_ENV) {
            config.node_id = id;
        }
        if let Some(prefix) = non_empty_env(CHANNEL_PREFIX_ENV) {
            config.channel_prefix = prefix;
        }
        config
    }

    pub fn with_node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = id.into();
        self
    }

    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

// ── Commands (app → loop) ─────────────────────────────────────────────

enum NodeCommand {
    /// The store accepted a join; attach local sessions.
    MirrorJoin {
        id: ConnectionId,
        groups: Vec<GroupId>,
        reply: oneshot::Sender<()>,
    },
    /// The store accepted a leave; detach local sessions.
    MirrorLeave {
        id: ConnectionId,
        groups: Vec<GroupId>,
        reply: oneshot::Sender<()>,
    },
    SendTo {
        link: LinkId,
        event: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<bool, ProtocolError>>,
    },
    Ack {
        link: LinkId,
        channel: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<bool, ProtocolError>>,
    },
    AddFilter {
        name: String,
        filter: FilterFn,
    },
    RemoveFilter {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    GetFilters {
        reply: oneshot::Sender<Filters>,
    },
    OnGroup {
        group: GroupId,
        key: EventKey,
        handler: Handler<Group>,
        reply: oneshot::Sender<ListenerId>,
    },
    RemoveGroupListener {
        group: GroupId,
        key: EventKey,
        id: ListenerId,
        reply: oneshot::Sender<bool>,
    },
    GroupMembers {
        group: GroupId,
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    Disconnect {
        id: ConnectionId,
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

// ── Events (loop → app) ───────────────────────────────────────────────

/// What a node reports to its application.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// A session proved its id and joined its persisted groups.
    Registered { id: ConnectionId, link: LinkId },
    /// The last local session of `id` closed.
    Unregistered { id: ConnectionId },
    /// A session failed the handshake or its registration.
    Rejected { link: LinkId, reason: String },
    /// A named event sent by a registered session.
    Message {
        id: ConnectionId,
        link: LinkId,
        name: String,
        args: Vec<Value>,
    },
    /// An opaque data frame sent by a registered session.
    Data {
        id: ConnectionId,
        link: LinkId,
        value: Value,
    },
    /// Non-fatal runtime failure.
    Error { description: String },
}

// ── NodeHandle ────────────────────────────────────────────────────────

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    cmd_tx: mpsc::Sender<NodeCommand>,
    store: Arc<dyn MembershipStore>,
    publisher: Publisher,
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        self.publisher.origin()
    }

    /// Publisher bound to this node's broker and channel prefix.
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    async fn command(&self, cmd: NodeCommand) -> Result<(), ProtocolError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ProtocolError::Shutdown)
    }

    async fn query<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> NodeCommand,
    ) -> Result<T, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.command(build(tx)).await?;
        rx.await.map_err(|_| ProtocolError::Shutdown)
    }

    // ── Membership ─────────────────────────────────

    /// Add `id` to `groups`. The store is written first; local sessions of
    /// `id` are attached only once it succeeded.
    pub async fn join<I, G>(&self, id: &ConnectionId, groups: I) -> Result<(), ProtocolError>
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupId>,
    {
        let groups: Vec<GroupId> = groups.into_iter().map(Into::into).collect();
        if groups.is_empty() {
            return Ok(());
        }
        self.store.exec(join_batch(id, &groups)).await?;
        self.query(|reply| NodeCommand::MirrorJoin {
            id: id.clone(),
            groups,
            reply,
        })
        .await
    }

    /// Remove `id` from `groups`, store first.
    pub async fn leave<I, G>(&self, id: &ConnectionId, groups: I) -> Result<(), ProtocolError>
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupId>,
    {
        let groups: Vec<GroupId> = groups.into_iter().map(Into::into).collect();
        if groups.is_empty() {
            return Ok(());
        }
        self.store.exec(leave_batch(id, &groups)).await?;
        self.query(|reply| NodeCommand::MirrorLeave {
            id: id.clone(),
            groups,
            reply,
        })
        .await
    }

    /// Persisted groups of `id`, sorted.
    pub async fn groups(&self, id: &ConnectionId) -> Result<Vec<GroupId>, ProtocolError> {
        let replies = self.store.exec(groups_batch(id)).await?;
        Ok(last_members(replies)?
            .into_iter()
            .map(GroupId::from)
            .collect())
    }

    // ── Fan-out ────────────────────────────────────

    /// Start a selection. Nothing happens until it is sent or resolved.
    pub fn select(&self) -> Selector {
        self.publisher.select()
    }

    /// Selection from a complete rule.
    pub fn select_rule(&self, rule: SelectionRule) -> Selector {
        Selector::from_rule(self.publisher.clone(), rule)
    }

    /// Every registered connection, on every node.
    pub async fn broadcast(&self, event: &str, args: Vec<Value>) -> Result<(), ProtocolError> {
        self.publisher.broadcast(event, args).await
    }

    /// An explicit list of connections, without store resolution.
    pub async fn forall<I, C>(&self, ids: I, event: &str, args: Vec<Value>) -> Result<(), ProtocolError>
    where
        I: IntoIterator<Item = C>,
        C: Into<ConnectionId>,
    {
        self.publisher.forall(ids, event, args).await
    }

    /// Resolve `selector` against the store with this node's filters.
    pub async fn resolve(&self, selector: Selector) -> Result<Vec<ConnectionId>, ProtocolError> {
        let filters = self.query(|reply| NodeCommand::GetFilters { reply }).await?;
        selector.resolve(self.store.as_ref(), &filters).await
    }

    // ── Sessions ───────────────────────────────────

    /// Queue `event` on one local session. `Ok(false)` if it is gone.
    pub async fn send_to(
        &self,
        link: LinkId,
        event: &str,
        args: Vec<Value>,
    ) -> Result<bool, ProtocolError> {
        self.query(|reply| NodeCommand::SendTo {
            link,
            event: event.to_string(),
            args,
            reply,
        })
        .await?
    }

    /// Answer an ack channel a local session sent.
    pub async fn ack(
        &self,
        link: LinkId,
        channel: &str,
        args: Vec<Value>,
    ) -> Result<bool, ProtocolError> {
        self.query(|reply| NodeCommand::Ack {
            link,
            channel: channel.to_string(),
            args,
            reply,
        })
        .await?
    }

    /// Orderly close of every local session of `id`. Returns how many
    /// sessions were told to close.
    pub async fn disconnect(&self, id: &ConnectionId) -> Result<usize, ProtocolError> {
        self.query(|reply| NodeCommand::Disconnect {
            id: id.clone(),
            reply,
        })
        .await
    }

    // ── Filters & taps ─────────────────────────────

    /// Register the node-local filter `name`, replacing any previous one.
    pub async fn add_filter<F>(&self, name: impl Into<String>, filter: F) -> Result<(), ProtocolError>
    where
        F: Fn(&ConnectionId) -> bool + Send + Sync + 'static,
    {
        self.command(NodeCommand::AddFilter {
            name: name.into(),
            filter: Arc::new(filter),
        })
        .await
    }

    pub async fn remove_filter(&self, name: &str) -> Result<bool, ProtocolError> {
        self.query(|reply| NodeCommand::RemoveFilter {
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Tap events delivered to the local group `group`.
    pub async fn on_group<F>(
        &self,
        group: impl Into<GroupId>,
        key: EventKey,
        handler: F,
    ) -> Result<ListenerId, ProtocolError>
    where
        F: FnMut(&mut Group, &crate::events::Event) + Send + 'static,
    {
        let group = group.into();
        self.query(|reply| NodeCommand::OnGroup {
            group,
            key,
            handler: Box::new(handler),
            reply,
        })
        .await
    }

    pub async fn remove_group_listener(
        &self,
        group: impl Into<GroupId>,
        key: EventKey,
        id: ListenerId,
    ) -> Result<bool, ProtocolError> {
        let group = group.into();
        self.query(|reply| NodeCommand::RemoveGroupListener {
            group,
            key,
            id,
            reply,
        })
        .await
    }

    // ── Queries ────────────────────────────────────

    /// Local members of `group`.
    pub async fn members(&self, group: impl Into<GroupId>) -> Result<Vec<ConnectionId>, ProtocolError> {
        let group = group.into();
        self.query(|reply| NodeCommand::GroupMembers { group, reply })
            .await
    }

    /// Registered ids with at least one session on this node.
    pub async fn connections(&self) -> Result<Vec<ConnectionId>, ProtocolError> {
        self.query(|reply| NodeCommand::Connections { reply }).await
    }

    /// Close every session and stop the loop.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(NodeCommand::Shutdown).await;
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("publisher", &self.publisher)
            .finish()
    }
}

// ── NodeChannels ──────────────────────────────────────────────────────

/// Returned to the application when a node starts.
pub struct NodeChannels {
    pub handle: NodeHandle,
    pub events: mpsc::Receiver<NodeEvent>,
}

// ── NodeRuntime ───────────────────────────────────────────────────────

pub struct NodeRuntime;

impl NodeRuntime {
    /// Subscribe to the broker and start the node loop.
    ///
    /// The subscription is live when this returns, so envelopes published
    /// afterwards (including this node's own) are seen by the node.
    pub async fn spawn<L>(
        config: NodeConfig,
        listener: L,
        store: Arc<dyn MembershipStore>,
        broker: Arc<dyn Broker>,
    ) -> Result<NodeChannels, ProtocolError>
    where
        L: Listener + 'static,
    {
        let pattern = subscription_pattern(&config.channel_prefix);
        let subscription = broker.subscribe(&pattern).await?;
        tracing::info!("node: {} subscribed to {pattern}", config.node_id);

        let (cmd_tx, cmd_rx) = mpsc::channel::<NodeCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<NodeEvent>(config.event_buffer.max(1));

        let publisher = Publisher::new(broker, config.channel_prefix.clone(), config.node_id.clone());

        tokio::spawn(r#loop::node_loop(
            config,
            Box::new(listener),
            store.clone(),
            subscription,
            cmd_rx,
            event_tx,
        ));

        Ok(NodeChannels {
            handle: NodeHandle {
                cmd_tx,
                store,
                publisher,
            },
            events: event_rx,
        })
    }
}
