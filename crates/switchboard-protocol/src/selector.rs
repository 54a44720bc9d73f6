//! Set-algebra targeting.
//!
//! A [`SelectionRule`] names groups to union (`or`), intersect (`and`) and
//! subtract (`not`), plus an optional named post-filter:
//!
//! ```text
//! (⋃ or ∩ ⋂ and) − ⋃ not   |> filter
//! ```
//!
//! An empty `or` selects the `all` group. Resolution runs as one atomic
//! store batch over a scratch set that is created, read and deleted inside
//! that same batch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::Broker;
use crate::envelope::{channel_for, Envelope, Target};
use crate::error::ProtocolError;
use crate::store::{MembershipStore, StoreCommand, StoreError, StoreReply};
use crate::types::{nonce, ConnectionId, GroupId};

/// Flat targeting rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRule {
    #[serde(default)]
    pub or: Vec<GroupId>,
    #[serde(default)]
    pub and: Vec<GroupId>,
    #[serde(default)]
    pub not: Vec<GroupId>,
    #[serde(default)]
    pub filter: Option<String>,
}

impl SelectionRule {
    /// Whether this rule is the implicit "everyone" rule.
    pub fn is_broadcast(&self) -> bool {
        *self == SelectionRule::default()
    }
}

// ── Scratch set ───────────────────────────────────────────────────────

/// Name of an ephemeral working set, unique per resolution.
struct ScratchSet(String);

impl ScratchSet {
    fn new() -> Self {
        Self(format!("tmp:select:{}", nonce()))
    }

    /// Build the full batch: compute into the scratch set, read it, drop it.
    fn batch(self, rule: &SelectionRule) -> Vec<StoreCommand> {
        let tmp = self.0;
        let mut batch = vec![StoreCommand::UnionStore {
            dest: tmp.clone(),
            sources: rule.or.iter().map(GroupId::store_key).collect(),
        }];
        if !rule.and.is_empty() {
            let mut sources = vec![tmp.clone()];
            sources.extend(rule.and.iter().map(GroupId::store_key));
            batch.push(StoreCommand::InterStore {
                dest: tmp.clone(),
                sources,
            });
        }
        if !rule.not.is_empty() {
            let mut sources = vec![tmp.clone()];
            sources.extend(rule.not.iter().map(GroupId::store_key));
            batch.push(StoreCommand::DiffStore {
                dest: tmp.clone(),
                sources,
            });
        }
        batch.push(StoreCommand::Members { set: tmp.clone() });
        batch.push(StoreCommand::Delete { set: tmp });
        batch
    }
}

/// The store batch resolving `rule` (before any filter).
pub fn resolution_batch(rule: &SelectionRule) -> Vec<StoreCommand> {
    if rule.or.is_empty() {
        return vec![StoreCommand::Members {
            set: GroupId::all().store_key(),
        }];
    }
    ScratchSet::new().batch(rule)
}

/// Resolve `rule` against the store. The named filter is not applied.
pub async fn resolve_members(
    store: &dyn MembershipStore,
    rule: &SelectionRule,
) -> Result<Vec<ConnectionId>, StoreError> {
    let replies = store.exec(resolution_batch(rule)).await?;
    replies
        .into_iter()
        .rev()
        .find_map(StoreReply::into_members)
        .map(|ids| ids.into_iter().map(ConnectionId::from).collect())
        .ok_or(StoreError::UnexpectedReply { command: "members" })
}

// ── Filters ───────────────────────────────────────────────────────────

pub type FilterFn = Arc<dyn Fn(&ConnectionId) -> bool + Send + Sync>;

/// Named node-local predicates applied after resolution.
#[derive(Clone, Default)]
pub struct Filters {
    table: HashMap<String, FilterFn>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(&mut self, name: impl Into<String>, filter: F)
    where
        F: Fn(&ConnectionId) -> bool + Send + Sync + 'static,
    {
        self.table.insert(name.into(), Arc::new(filter));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.table.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    /// Keep the ids `name` accepts. Unknown or absent names keep everything.
    pub fn apply(&self, name: Option<&str>, ids: Vec<ConnectionId>) -> Vec<ConnectionId> {
        let Some(name) = name else {
            return ids;
        };
        match self.table.get(name) {
            Some(filter) => ids.into_iter().filter(|id| filter(id)).collect(),
            None => {
                tracing::debug!("selector: no filter named {name}, keeping all");
                ids
            }
        }
    }
}

impl fmt::Debug for Filters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.table.keys()).finish()
    }
}

// ── Publishing ────────────────────────────────────────────────────────

/// Publishes envelopes on the broker under a channel prefix.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    prefix: String,
    origin: String,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, prefix: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            broker,
            prefix: prefix.into(),
            origin: origin.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Id stamped on published envelopes.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Publish `event` once for `target`.
    pub async fn publish(
        &self,
        target: Target,
        event: &str,
        args: Vec<Value>,
    ) -> Result<(), ProtocolError> {
        let envelope = Envelope::new(self.origin.clone(), target, event, args);
        let bytes = envelope.to_bytes()?;
        self.broker
            .publish(&channel_for(&self.prefix, event), bytes)
            .await?;
        Ok(())
    }

    /// Every registered connection.
    pub async fn broadcast(&self, event: &str, args: Vec<Value>) -> Result<(), ProtocolError> {
        self.publish(Target::All, event, args).await
    }

    /// An explicit list of connections, no store resolution.
    pub async fn forall<I, C>(&self, ids: I, event: &str, args: Vec<Value>) -> Result<(), ProtocolError>
    where
        I: IntoIterator<Item = C>,
        C: Into<ConnectionId>,
    {
        let ids = ids.into_iter().map(Into::into).collect();
        self.publish(Target::Ids(ids), event, args).await
    }

    pub fn select(&self) -> Selector {
        Selector::new(self.clone())
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("prefix", &self.prefix)
            .field("origin", &self.origin)
            .finish()
    }
}

// ── Selector ──────────────────────────────────────────────────────────

/// Single-use rule builder. `send` and `resolve` consume it.
#[derive(Debug)]
#[must_use = "a selector does nothing until sent or resolved"]
pub struct Selector {
    rule: SelectionRule,
    publisher: Publisher,
}

impl Selector {
    pub fn new(publisher: Publisher) -> Self {
        Self::from_rule(publisher, SelectionRule::default())
    }

    pub fn from_rule(publisher: Publisher, rule: SelectionRule) -> Self {
        Self { rule, publisher }
    }

    /// Union these groups.
    pub fn to<I, G>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupId>,
    {
        self.rule.or.extend(groups.into_iter().map(Into::into));
        self
    }

    /// Intersect with these groups.
    pub fn only<I, G>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupId>,
    {
        self.rule.and.extend(groups.into_iter().map(Into::into));
        self
    }

    /// Exclude these groups.
    pub fn not<I, G>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupId>,
    {
        self.rule.not.extend(groups.into_iter().map(Into::into));
        self
    }

    /// Apply the node-local filter registered as `name`.
    pub fn filter(mut self, name: impl Into<String>) -> Self {
        self.rule.filter = Some(name.into());
        self
    }

    pub fn rule(&self) -> &SelectionRule {
        &self.rule
    }

    /// Publish `event` to whatever the rule resolves to on each node.
    pub async fn send(self, event: &str, args: Vec<Value>) -> Result<(), ProtocolError> {
        let target = if self.rule.is_broadcast() {
            Target::All
        } else {
            Target::Rule(self.rule)
        };
        self.publisher.publish(target, event, args).await
    }

    /// Resolve the rule now, applying `filters`.
    pub async fn resolve(
        self,
        store: &dyn MembershipStore,
        filters: &Filters,
    ) -> Result<Vec<ConnectionId>, ProtocolError> {
        let ids = resolve_members(store, &self.rule).await?;
        Ok(filters.apply(self.rule.filter.as_deref(), ids))
    }
}
