use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{apply_batch, MembershipStore, SetBackend, StoreCommand, StoreError, StoreReply};

/// In-process membership store. Share it between nodes with an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every batch fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of one set, sorted.
    pub fn snapshot(&self, set: &str) -> Vec<String> {
        self.sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(set)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of non-empty sets.
    pub fn set_count(&self) -> usize {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct MapBackend<'a>(&'a mut HashMap<String, BTreeSet<String>>);

impl SetBackend for MapBackend<'_> {
    fn members(&mut self, set: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.0.get(set).cloned().unwrap_or_default())
    }

    fn insert(&mut self, set: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .0
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    fn remove(&mut self, set: &str, member: &str) -> Result<bool, StoreError> {
        let Some(entries) = self.0.get_mut(set) else {
            return Ok(false);
        };
        let removed = entries.remove(member);
        if entries.is_empty() {
            self.0.remove(set);
        }
        Ok(removed)
    }

    fn replace(&mut self, set: &str, members: BTreeSet<String>) -> Result<(), StoreError> {
        if members.is_empty() {
            self.0.remove(set);
        } else {
            self.0.insert(set.to_string(), members);
        }
        Ok(())
    }

    fn delete(&mut self, set: &str) -> Result<bool, StoreError> {
        Ok(self.0.remove(set).is_some())
    }
}

#[async_trait::async_trait]
impl MembershipStore for MemoryStore {
    async fn exec(&self, batch: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        apply_batch(&mut MapBackend(&mut *sets), batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_store_rejects_batches() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store
            .exec(vec![StoreCommand::Members { set: "all".into() }])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable));

        store.set_unavailable(false);
        assert!(store.exec(vec![]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emptied_sets_disappear() {
        let store = MemoryStore::new();
        store
            .exec(vec![
                StoreCommand::Add {
                    set: "g".into(),
                    members: vec!["1".into()],
                },
                StoreCommand::Remove {
                    set: "g".into(),
                    members: vec!["1".into()],
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.set_count(), 0);
        assert!(store.snapshot("g").is_empty());
    }
}
