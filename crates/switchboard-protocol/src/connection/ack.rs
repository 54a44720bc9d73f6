use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::{nonce, SERVICE_CHANNEL};

struct Pending<F> {
    callback: F,
    expiry: Option<(Instant, Duration)>,
}

/// Pending acks of one session, keyed by their service channel name.
///
/// Each entry resolves exactly once: `take` (a response arrived) and
/// `take_expired` (its deadline passed) both remove it.
pub(crate) struct AckTable<F> {
    pending: HashMap<String, Pending<F>>,
}

impl<F> AckTable<F> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// A fresh channel name under the service prefix, unused in this table.
    pub fn reserve(&self) -> String {
        loop {
            let channel = format!("{SERVICE_CHANNEL}{}", nonce());
            if !self.pending.contains_key(&channel) {
                return channel;
            }
        }
    }

    /// Register `callback` on `channel`, optionally expiring `after` from `now`.
    pub fn insert(&mut self, channel: String, callback: F, now: Instant, after: Option<Duration>) {
        let expiry = after.map(|d| (now + d, d));
        self.pending.insert(channel, Pending { callback, expiry });
    }

    /// Claim the callback for a response on `channel`.
    pub fn take(&mut self, channel: &str) -> Option<F> {
        self.pending.remove(channel).map(|p| p.callback)
    }

    /// Claim every callback whose deadline is at or before `now`, with the
    /// expiry it was registered with.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(String, F, Duration)> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| matches!(p.expiry, Some((at, _)) if at <= now))
            .map(|(channel, _)| channel.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|channel| {
                let p = self.pending.remove(&channel)?;
                let (_, after) = p.expiry?;
                Some((channel, p.callback, after))
            })
            .collect()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .filter_map(|p| p.expiry.map(|(at, _)| at))
            .min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_channels_are_unique_and_prefixed() {
        let table: AckTable<()> = AckTable::new();
        let a = table.reserve();
        let b = table.reserve();
        assert!(a.starts_with(SERVICE_CHANNEL));
        assert_ne!(a, b);
    }

    #[test]
    fn test_take_resolves_once() {
        let mut table = AckTable::new();
        let now = Instant::now();
        table.insert("/_svc_/1".into(), 7, now, Some(Duration::from_millis(10)));
        assert_eq!(table.take("/_svc_/1"), Some(7));
        assert_eq!(table.take("/_svc_/1"), None);
        assert!(table.take_expired(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_expiry_order_and_deadline() {
        let mut table = AckTable::new();
        let now = Instant::now();
        table.insert("/_svc_/a".into(), 'a', now, Some(Duration::from_millis(50)));
        table.insert("/_svc_/b".into(), 'b', now, Some(Duration::from_millis(10)));
        table.insert("/_svc_/c".into(), 'c', now, None);
        assert_eq!(table.next_deadline(), Some(now + Duration::from_millis(10)));

        let fired = table.take_expired(now + Duration::from_millis(20));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, 'b');
        assert_eq!(fired[0].2, Duration::from_millis(10));
        assert_eq!(table.len(), 2);
        assert_eq!(table.next_deadline(), Some(now + Duration::from_millis(50)));
    }
}
