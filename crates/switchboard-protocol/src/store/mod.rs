//! Shared membership store.
//!
//! Group membership lives outside any node, as named sets of strings: one
//! set per group (`g:<group>`, its member connection ids) and one index set
//! per connection (`c:<id>:g`, the groups it belongs to). The prefixes keep
//! group names, connection ids and scratch sets in disjoint keyspaces. Nodes talk to it in
//! atomic batches of set commands, the way a Redis `MULTI` block would.
//!
//! Two backends ship here: [`MemoryStore`] for a single process and
//! [`SqliteStore`] for processes sharing one host.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::collections::BTreeSet;

use crate::types::{ConnectionId, GroupId};

/// Errors from a membership store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store task failed: {0}")]
    Task(String),

    #[error("unexpected reply to {command}")]
    UnexpectedReply { command: &'static str },
}

/// One command of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCommand {
    /// Add members to a set. Replies with the number newly added.
    Add { set: String, members: Vec<String> },
    /// Remove members from a set. Replies with the number removed.
    Remove { set: String, members: Vec<String> },
    /// `dest = ⋃ sources`. Replies with the size of `dest`.
    UnionStore { dest: String, sources: Vec<String> },
    /// `dest = ⋂ sources`. Replies with the size of `dest`.
    InterStore { dest: String, sources: Vec<String> },
    /// `dest = sources[0] − ⋃ sources[1..]`. Replies with the size of `dest`.
    DiffStore { dest: String, sources: Vec<String> },
    /// Replies with the members of a set, sorted.
    Members { set: String },
    /// Drop a set. Replies with 1 if it existed.
    Delete { set: String },
}

impl StoreCommand {
    fn name(&self) -> &'static str {
        match self {
            StoreCommand::Add { .. } => "add",
            StoreCommand::Remove { .. } => "remove",
            StoreCommand::UnionStore { .. } => "union-store",
            StoreCommand::InterStore { .. } => "inter-store",
            StoreCommand::DiffStore { .. } => "diff-store",
            StoreCommand::Members { .. } => "members",
            StoreCommand::Delete { .. } => "delete",
        }
    }
}

/// Reply to one command, in batch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReply {
    Count(usize),
    Members(Vec<String>),
}

impl StoreReply {
    pub fn into_members(self) -> Option<Vec<String>> {
        match self {
            StoreReply::Members(m) => Some(m),
            StoreReply::Count(_) => None,
        }
    }

    pub fn count(&self) -> Option<usize> {
        match self {
            StoreReply::Count(n) => Some(*n),
            StoreReply::Members(_) => None,
        }
    }
}

/// A set store executing atomic command batches.
#[async_trait::async_trait]
pub trait MembershipStore: Send + Sync {
    /// Run `batch` atomically; one reply per command.
    async fn exec(&self, batch: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError>;
}

// ── Batch builders ────────────────────────────────────────────────────

/// Add `id` to every group and the groups to `id`'s index.
pub fn join_batch(id: &ConnectionId, groups: &[GroupId]) -> Vec<StoreCommand> {
    if groups.is_empty() {
        return Vec::new();
    }
    let mut batch: Vec<StoreCommand> = groups
        .iter()
        .map(|g| StoreCommand::Add {
            set: g.store_key(),
            members: vec![id.to_string()],
        })
        .collect();
    batch.push(StoreCommand::Add {
        set: id.membership_key(),
        members: groups.iter().map(GroupId::to_string).collect(),
    });
    batch
}

/// Remove `id` from every group and the groups from `id`'s index.
pub fn leave_batch(id: &ConnectionId, groups: &[GroupId]) -> Vec<StoreCommand> {
    if groups.is_empty() {
        return Vec::new();
    }
    let mut batch: Vec<StoreCommand> = groups
        .iter()
        .map(|g| StoreCommand::Remove {
            set: g.store_key(),
            members: vec![id.to_string()],
        })
        .collect();
    batch.push(StoreCommand::Remove {
        set: id.membership_key(),
        members: groups.iter().map(GroupId::to_string).collect(),
    });
    batch
}

/// Join `id` to `all` and to its personal group, then read its index.
/// The last reply holds every group `id` belongs to.
pub fn register_batch(id: &ConnectionId) -> Vec<StoreCommand> {
    let mut batch = join_batch(id, &[GroupId::all(), id.personal_group()]);
    batch.push(StoreCommand::Members {
        set: id.membership_key(),
    });
    batch
}

/// Read `id`'s membership index.
pub fn groups_batch(id: &ConnectionId) -> Vec<StoreCommand> {
    vec![StoreCommand::Members {
        set: id.membership_key(),
    }]
}

/// Members listed by the last reply of a batch.
pub fn last_members(replies: Vec<StoreReply>) -> Result<Vec<String>, StoreError> {
    replies
        .into_iter()
        .last()
        .and_then(StoreReply::into_members)
        .ok_or(StoreError::UnexpectedReply { command: "members" })
}

// ── Shared evaluation ─────────────────────────────────────────────────

/// Primitive set access a backend provides to [`apply_batch`].
pub(crate) trait SetBackend {
    fn members(&mut self, set: &str) -> Result<BTreeSet<String>, StoreError>;
    fn insert(&mut self, set: &str, member: &str) -> Result<bool, StoreError>;
    fn remove(&mut self, set: &str, member: &str) -> Result<bool, StoreError>;
    /// Replace a set wholesale. An empty set is deleted.
    fn replace(&mut self, set: &str, members: BTreeSet<String>) -> Result<(), StoreError>;
    fn delete(&mut self, set: &str) -> Result<bool, StoreError>;
}

/// Evaluate `batch` against `backend`. Atomicity is the caller's concern.
pub(crate) fn apply_batch<B: SetBackend>(
    backend: &mut B,
    batch: Vec<StoreCommand>,
) -> Result<Vec<StoreReply>, StoreError> {
    let mut replies = Vec::with_capacity(batch.len());
    for command in batch {
        tracing::trace!("store: {}", command.name());
        let reply = match command {
            StoreCommand::Add { set, members } => {
                let mut added = 0;
                for m in &members {
                    if backend.insert(&set, m)? {
                        added += 1;
                    }
                }
                StoreReply::Count(added)
            }
            StoreCommand::Remove { set, members } => {
                let mut removed = 0;
                for m in &members {
                    if backend.remove(&set, m)? {
                        removed += 1;
                    }
                }
                StoreReply::Count(removed)
            }
            StoreCommand::UnionStore { dest, sources } => {
                let mut acc = BTreeSet::new();
                for s in &sources {
                    acc.extend(backend.members(s)?);
                }
                store_result(backend, &dest, acc)?
            }
            StoreCommand::InterStore { dest, sources } => {
                let mut acc: Option<BTreeSet<String>> = None;
                for s in &sources {
                    let set = backend.members(s)?;
                    acc = Some(match acc {
                        None => set,
                        Some(prev) => prev.intersection(&set).cloned().collect(),
                    });
                }
                store_result(backend, &dest, acc.unwrap_or_default())?
            }
            StoreCommand::DiffStore { dest, sources } => {
                let mut iter = sources.iter();
                let mut acc = match iter.next() {
                    Some(first) => backend.members(first)?,
                    None => BTreeSet::new(),
                };
                for s in iter {
                    for m in backend.members(s)? {
                        acc.remove(&m);
                    }
                }
                store_result(backend, &dest, acc)?
            }
            StoreCommand::Members { set } => {
                StoreReply::Members(backend.members(&set)?.into_iter().collect())
            }
            StoreCommand::Delete { set } => StoreReply::Count(usize::from(backend.delete(&set)?)),
        };
        replies.push(reply);
    }
    Ok(replies)
}

fn store_result<B: SetBackend>(
    backend: &mut B,
    dest: &str,
    members: BTreeSet<String>,
) -> Result<StoreReply, StoreError> {
    let n = members.len();
    backend.replace(dest, members)?;
    Ok(StoreReply::Count(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(set: &str, members: &[&str]) -> StoreCommand {
        StoreCommand::Add {
            set: set.into(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn members(set: &str) -> StoreCommand {
        StoreCommand::Members { set: set.into() }
    }

    #[tokio::test]
    async fn test_set_algebra_commands() {
        let store = MemoryStore::new();
        store
            .exec(vec![
                add("a", &["1", "2", "3"]),
                add("b", &["2", "3", "4"]),
                add("c", &["3"]),
            ])
            .await
            .unwrap();

        let replies = store
            .exec(vec![
                StoreCommand::UnionStore {
                    dest: "t".into(),
                    sources: vec!["a".into(), "c".into()],
                },
                StoreCommand::InterStore {
                    dest: "t".into(),
                    sources: vec!["t".into(), "b".into()],
                },
                StoreCommand::DiffStore {
                    dest: "t".into(),
                    sources: vec!["t".into(), "c".into()],
                },
                members("t"),
                StoreCommand::Delete { set: "t".into() },
                members("t"),
            ])
            .await
            .unwrap();

        assert_eq!(
            replies,
            vec![
                StoreReply::Count(3),
                StoreReply::Count(2),
                StoreReply::Count(1),
                StoreReply::Members(vec!["2".into()]),
                StoreReply::Count(1),
                StoreReply::Members(vec![]),
            ]
        );
    }

    #[tokio::test]
    async fn test_add_remove_counts_are_idempotent() {
        let store = MemoryStore::new();
        let replies = store
            .exec(vec![
                add("g", &["x", "y"]),
                add("g", &["x"]),
                StoreCommand::Remove {
                    set: "g".into(),
                    members: vec!["x".into(), "zzz".into()],
                },
                members("g"),
            ])
            .await
            .unwrap();
        assert_eq!(
            replies,
            vec![
                StoreReply::Count(2),
                StoreReply::Count(0),
                StoreReply::Count(1),
                StoreReply::Members(vec!["y".into()]),
            ]
        );
    }

    #[test]
    fn test_join_and_leave_batches_mirror_each_other() {
        let id = ConnectionId::from("alice");
        let groups = [GroupId::from("a"), GroupId::from("b")];
        let join = join_batch(&id, &groups);
        assert_eq!(join.len(), 3);
        assert_eq!(join[0], add("g:a", &["alice"]));
        assert_eq!(join[2], add("c:alice:g", &["a", "b"]));
        let leave = leave_batch(&id, &groups);
        assert_eq!(
            leave[0],
            StoreCommand::Remove {
                set: "g:a".into(),
                members: vec!["alice".into()],
            }
        );
        assert!(join_batch(&id, &[]).is_empty());
    }

    #[tokio::test]
    async fn test_group_named_like_an_index_stays_separate() {
        let store = MemoryStore::new();
        store.exec(register_batch(&ConnectionId::from("alice"))).await.unwrap();
        // A group literally named like alice's index stays a separate set.
        store
            .exec(join_batch(&ConnectionId::from("bob"), &[GroupId::from("alice:g")]))
            .await
            .unwrap();
        let replies = store
            .exec(groups_batch(&ConnectionId::from("alice")))
            .await
            .unwrap();
        assert_eq!(
            last_members(replies).unwrap(),
            vec!["alice".to_string(), "all".into()]
        );
        assert_eq!(store.snapshot("g:alice:g"), vec!["bob"]);
    }

    #[tokio::test]
    async fn test_register_batch_reports_groups() {
        let store = MemoryStore::new();
        let id = ConnectionId::from("c:9");
        store
            .exec(join_batch(&id, &[GroupId::from("room")]))
            .await
            .unwrap();
        let replies = store.exec(register_batch(&id)).await.unwrap();
        assert_eq!(
            last_members(replies).unwrap(),
            vec!["all".to_string(), "c:9".into(), "room".into()]
        );
    }
}
