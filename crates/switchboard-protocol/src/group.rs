use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use switchboard_transport::LinkId;

use crate::connection::Sendable;
use crate::events::{Emitter, Event, EventKey, ListenerId, Listeners};
use crate::types::GroupId;

/// Node-local mirror of one group: the sessions attached here whose
/// connection belongs to it, plus connection-agnostic taps.
///
/// Members are referenced by link; the sessions themselves live in the
/// registry and are passed in for fan-out.
pub struct Group {
    id: GroupId,
    members: BTreeSet<LinkId>,
    listeners: Listeners<Group>,
}

impl Group {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            members: BTreeSet::new(),
            listeners: Listeners::new(),
        }
    }

    pub fn id(&self) -> &GroupId {
        &self.id
    }

    /// Returns `true` if the link was not yet a member.
    pub fn attach(&mut self, link: LinkId) -> bool {
        self.members.insert(link)
    }

    pub fn detach(&mut self, link: LinkId) -> bool {
        self.members.remove(&link)
    }

    pub fn contains(&self, link: LinkId) -> bool {
        self.members.contains(&link)
    }

    pub fn members(&self) -> impl Iterator<Item = LinkId> + '_ {
        self.members.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Tap events delivered to this group.
    pub fn on<F>(&mut self, key: EventKey, handler: F) -> ListenerId
    where
        F: FnMut(&mut Group, &Event) + Send + 'static,
    {
        self.listeners.on(key, handler)
    }

    pub fn remove_listener(&mut self, key: &EventKey, id: ListenerId) -> bool {
        self.listeners.remove(key, id)
    }

    /// Send `event` to every member session, then to the group's own
    /// taps. Returns the number of sessions it was queued on.
    pub fn handle_message<S: Sendable>(
        &mut self,
        event: &str,
        args: &[Value],
        sessions: &mut HashMap<LinkId, S>,
    ) -> usize {
        let mut delivered = 0;
        for link in &self.members {
            let Some(session) = sessions.get_mut(link) else {
                continue;
            };
            match session.send_event(event, args) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("group: {} failed to queue {event} on {link}: {e}", self.id),
            }
        }
        self.notify(event, args);
        delivered
    }

    /// Hand `event` to the group's taps only.
    pub fn notify(&mut self, event: &str, args: &[Value]) {
        self.emit(&Event::Named {
            name: event.to_string(),
            args: args.to_vec(),
        });
    }
}

impl Emitter for Group {
    fn listeners_mut(&mut self) -> &mut Listeners<Self> {
        &mut self.listeners
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("members", &self.members)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Outbox(Vec<Vec<Value>>);

    impl Sendable for Outbox {
        fn send_frame(&mut self, payload: &[Value]) -> Result<(), ProtocolError> {
            self.0.push(payload.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_fans_out_to_members_and_taps() {
        let mut sessions: HashMap<LinkId, Outbox> = HashMap::new();
        for raw in 1..=3 {
            sessions.insert(LinkId::new(raw), Outbox::default());
        }

        let mut group = Group::new("room".into());
        group.attach(LinkId::new(1));
        group.attach(LinkId::new(3));
        group.attach(LinkId::new(9)); // no session for this one

        let tapped = Arc::new(Mutex::new(Vec::new()));
        let sink = tapped.clone();
        group.on(EventKey::named("chat"), move |g, e| {
            if let Event::Named { args, .. } = e {
                sink.lock().unwrap().push((g.id().clone(), args.clone()));
            }
        });

        let n = group.handle_message("chat", &[json!("hi")], &mut sessions);
        assert_eq!(n, 2);
        assert_eq!(sessions[&LinkId::new(1)].0, vec![vec![json!("chat"), json!("hi")]]);
        assert!(sessions[&LinkId::new(2)].0.is_empty());
        assert_eq!(sessions[&LinkId::new(3)].0.len(), 1);
        assert_eq!(
            *tapped.lock().unwrap(),
            vec![(GroupId::from("room"), vec![json!("hi")])]
        );
    }

    #[test]
    fn test_attach_is_idempotent() {
        let mut group = Group::new(GroupId::all());
        assert!(group.attach(LinkId::new(1)));
        assert!(!group.attach(LinkId::new(1)));
        assert_eq!(group.len(), 1);
        assert!(group.detach(LinkId::new(1)));
        assert!(group.is_empty());
    }
}
