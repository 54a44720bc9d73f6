use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ── Reserved names ───────────────────────────────────────────────────────

/// Prefix reserved for internal service channels (ack replies, control).
pub const SERVICE_CHANNEL: &str = "/_svc_/";

/// Control event announcing an orderly close from the remote side.
pub const CLOSE_EVENT: &str = "/_svc_/close";

/// Challenge event sent by a node to negotiate a connection id.
pub const AUTH_EVENT: &str = "auth";

/// Group every registered connection belongs to.
pub const ALL_GROUP: &str = "all";

/// Store key prefix of group member sets (`g:<group>`).
pub const GROUP_KEY_PREFIX: &str = "g:";

/// Store key prefix of per-connection membership indexes (`c:<id>:g`).
pub const INDEX_KEY_PREFIX: &str = "c:";

/// Suffix of the per-connection membership index set.
pub const MEMBERSHIP_SUFFIX: &str = ":g";

// ── Defaults ─────────────────────────────────────────────────────────────

/// Initial reconnect delay. Doubles after every close while reconnecting.
pub const RECONNECT_TIMEOUT: Duration = Duration::from_millis(125);

/// Delay used by `reopen` when the caller gives none.
pub const REOPEN_DELAY: Duration = Duration::from_millis(100);

/// Outgoing queue capacity per connection.
pub const DEFAULT_QUEUE_LIMIT: usize = 1024;

/// How long a node waits for a peer to answer the id challenge.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Random, hard to guess token.
pub fn nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Whether `name` lives under the reserved service prefix.
pub fn is_service_channel(name: &str) -> bool {
    name.starts_with(SERVICE_CHANNEL)
}

// ── ConnectionId ─────────────────────────────────────────────────────────

/// Durable identity of one logical peer. Survives reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(format!("c-{}", nonce()))
    }

    /// Key of the set holding the groups this connection belongs to.
    pub fn membership_key(&self) -> String {
        format!("{INDEX_KEY_PREFIX}{}{MEMBERSHIP_SUFFIX}", self.0)
    }

    /// Whether this id may be negotiated by a peer. Ids naming the `all`
    /// group or the service prefix would alias shared names.
    pub fn is_acceptable(&self) -> bool {
        !self.0.is_empty() && self.0 != ALL_GROUP && !is_service_channel(&self.0)
    }

    /// The group containing only this connection.
    pub fn personal_group(&self) -> GroupId {
        GroupId(self.0.clone())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ── GroupId ──────────────────────────────────────────────────────────────

/// Name of a group, which is also the key of its persisted member set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    /// The implicit group of every registered connection.
    pub fn all() -> Self {
        Self(ALL_GROUP.to_string())
    }

    /// Key of the store set holding this group's member ids.
    pub fn store_key(&self) -> String {
        format!("{GROUP_KEY_PREFIX}{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for GroupId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&GroupId> for GroupId {
    fn from(g: &GroupId) -> Self {
        g.clone()
    }
}

impl From<ConnectionId> for GroupId {
    fn from(id: ConnectionId) -> Self {
        Self(id.0)
    }
}

impl AsRef<str> for GroupId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
