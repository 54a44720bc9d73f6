//! The node event loop.
//!
//! A single task that owns the registry and multiplexes over accepted
//! transports, transport signals, application commands, broker envelopes,
//! store results and session deadlines.
use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use switchboard_transport::{signal_channel, LinkId, Listener, TransportError};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::broker::{BrokerMessage, Subscription};
use crate::envelope::{Envelope, Target};
use crate::registry::{Registry, RegistryEvent};
use crate::selector::{resolve_members, SelectionRule};
use crate::store::{last_members, register_batch, MembershipStore, StoreError};
use crate::types::{ConnectionId, GroupId};

use super::{sleep_until, NodeCommand, NodeConfig, NodeEvent};

/// One received envelope awaiting resolution.
struct Delivery {
    event: String,
    args: Vec<Value>,
    target: Target,
}

/// Results of work done off the loop.
enum Internal {
    Registration {
        link: LinkId,
        id: ConnectionId,
        result: Result<Vec<GroupId>, StoreError>,
    },
    Resolved {
        delivery: Delivery,
        result: Result<Vec<ConnectionId>, StoreError>,
    },
}

/// Main event loop. Owns every session of the node.
pub(super) async fn node_loop(
    config: NodeConfig,
    mut listener: Box<dyn Listener>,
    store: Arc<dyn MembershipStore>,
    mut subscription: Subscription,
    mut cmd_rx: mpsc::Receiver<NodeCommand>,
    event_tx: mpsc::Sender<NodeEvent>,
) {
    let mut registry = Registry::new(config.handshake_timeout);
    let (signals, mut signal_rx) = signal_channel(LinkId::new(1));
    let mut next_link = LinkId::new(1);
    let mut accepting = true;
    let mut subscribed = true;

    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<Internal>();
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel::<Delivery>();
    tokio::spawn(resolver(store.clone(), delivery_rx, internal_tx.clone()));

    tracing::info!("node: {} started", config.node_id);

    loop {
        let deadline = registry.next_deadline();
        let mut events = Vec::new();

        tokio::select! {
            // ── 1. New peers ────────────────────────────────────
            accepted = listener.accept(signals.for_link(next_link)), if accepting => {
                match accepted {
                    Ok(transport) => {
                        let link = next_link;
                        next_link = next_link.next();
                        registry.attach(link, transport, signals.for_link(link), config.queue_limit);
                    }
                    Err(TransportError::ListenerClosed) => {
                        tracing::info!("node: listener closed, no longer accepting");
                        accepting = false;
                    }
                    Err(e) => tracing::warn!("node: accept failed: {e}"),
                }
            }

            // ── 2. Transport signals ────────────────────────────
            Some((link, signal)) = signal_rx.recv() => {
                events = registry.handle_signal(link, signal);
            }

            // ── 3. Application commands ─────────────────────────
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    registry.close_all();
                    break;
                };
                if !handle_command(&mut registry, cmd) {
                    break;
                }
            }

            // ── 4. Broker envelopes ─────────────────────────────
            msg = subscription.recv(), if subscribed => {
                match msg {
                    Some(msg) => accept_envelope(&msg, &delivery_tx),
                    None => {
                        tracing::warn!("node: broker subscription ended, cross-node fan-out stopped");
                        subscribed = false;
                    }
                }
            }

            // ── 5. Store results ────────────────────────────────
            Some(internal) = internal_rx.recv() => {
                events = handle_internal(&mut registry, internal, &event_tx).await;
            }

            // ── 6. Session deadlines ────────────────────────────
            _ = sleep_until(deadline) => {
                events = registry.tick(Instant::now());
            }
        }

        registry.flush_pending();

        for event in events {
            match event {
                RegistryEvent::Authenticated { link, id } => {
                    spawn_registration(&store, &internal_tx, link, id);
                }
                other => {
                    if let Some(event) = to_node_event(other) {
                        let _ = event_tx.send(event).await;
                    }
                }
            }
        }
    }

    tracing::info!("node: {} stopped", config.node_id);
}

/// Apply one command. Returns `false` once the loop should stop.
fn handle_command(registry: &mut Registry, cmd: NodeCommand) -> bool {
    match cmd {
        NodeCommand::MirrorJoin { id, groups, reply } => {
            registry.mirror_join(&id, &groups);
            let _ = reply.send(());
        }
        NodeCommand::MirrorLeave { id, groups, reply } => {
            registry.mirror_leave(&id, &groups);
            let _ = reply.send(());
        }
        NodeCommand::SendTo {
            link,
            event,
            args,
            reply,
        } => {
            let _ = reply.send(registry.send_to(link, &event, &args));
        }
        NodeCommand::Ack {
            link,
            channel,
            args,
            reply,
        } => {
            let _ = reply.send(registry.ack(link, &channel, &args));
        }
        NodeCommand::AddFilter { name, filter } => {
            registry
                .filters_mut()
                .insert(name, move |id: &ConnectionId| filter(id));
        }
        NodeCommand::RemoveFilter { name, reply } => {
            let _ = reply.send(registry.filters_mut().remove(&name));
        }
        NodeCommand::GetFilters { reply } => {
            let _ = reply.send(registry.filters().clone());
        }
        NodeCommand::OnGroup {
            group,
            key,
            handler,
            reply,
        } => {
            let _ = reply.send(registry.on_group(&group, key, handler));
        }
        NodeCommand::RemoveGroupListener {
            group,
            key,
            id,
            reply,
        } => {
            let _ = reply.send(registry.group(&group).remove_listener(&key, id));
        }
        NodeCommand::GroupMembers { group, reply } => {
            let _ = reply.send(registry.group_members(&group));
        }
        NodeCommand::Connections { reply } => {
            let _ = reply.send(registry.connections());
        }
        NodeCommand::Disconnect { id, reply } => {
            let _ = reply.send(registry.disconnect(&id));
        }
        NodeCommand::Shutdown => {
            registry.close_all();
            return false;
        }
    }
    true
}

/// Decode an envelope and queue it for resolution.
fn accept_envelope(msg: &BrokerMessage, deliveries: &mpsc::UnboundedSender<Delivery>) {
    let envelope = match Envelope::from_bytes(&msg.payload) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!("node: bad envelope on {}: {e}", msg.channel);
            return;
        }
    };
    let Some(event) = envelope.event().map(str::to_string) else {
        tracing::debug!("node: envelope on {} carries no event", msg.channel);
        return;
    };
    let args = envelope.args().to_vec();
    tracing::trace!("node: {event} from {}", envelope.origin);
    let _ = deliveries.send(Delivery {
        event,
        args,
        target: envelope.target,
    });
}

async fn handle_internal(
    registry: &mut Registry,
    internal: Internal,
    event_tx: &mpsc::Sender<NodeEvent>,
) -> Vec<RegistryEvent> {
    match internal {
        Internal::Registration { link, id, result } => match result {
            Ok(groups) => registry.register(link, id, groups),
            Err(e) => {
                tracing::warn!("node: registration of {id} failed: {e}");
                registry.registration_failed(link, e)
            }
        },
        Internal::Resolved { delivery, result } => {
            match result {
                Ok(ids) => {
                    let filter = match &delivery.target {
                        Target::Rule(rule) => rule.filter.as_deref(),
                        _ => None,
                    };
                    let ids = registry.filters().apply(filter, ids);
                    let targeted = targeted_groups(&delivery.target);
                    registry.deliver(&delivery.event, &delivery.args, &ids, &targeted);
                }
                Err(e) => {
                    // No partial delivery: the whole fan-out is abandoned.
                    tracing::warn!("node: selection for {} failed: {e}", delivery.event);
                    let _ = event_tx
                        .send(NodeEvent::Error {
                            description: format!("selection for {} failed: {e}", delivery.event),
                        })
                        .await;
                }
            }
            Vec::new()
        }
    }
}

/// Groups whose taps hear an envelope: the rule's union, or `all`.
fn targeted_groups(target: &Target) -> Vec<GroupId> {
    match target {
        Target::All => vec![GroupId::all()],
        Target::Rule(rule) if rule.or.is_empty() => vec![GroupId::all()],
        Target::Rule(rule) => rule.or.clone(),
        Target::Ids(_) => Vec::new(),
    }
}

fn spawn_registration(
    store: &Arc<dyn MembershipStore>,
    internal_tx: &mpsc::UnboundedSender<Internal>,
    link: LinkId,
    id: ConnectionId,
) {
    let store = store.clone();
    let internal_tx = internal_tx.clone();
    tokio::spawn(async move {
        let result = match store.exec(register_batch(&id)).await {
            Ok(replies) => last_members(replies),
            Err(e) => Err(e),
        }
        .map(|groups| groups.into_iter().map(GroupId::from).collect());
        let _ = internal_tx.send(Internal::Registration { link, id, result });
    });
}

/// Resolves envelopes one at a time so deliveries keep broker order.
async fn resolver(
    store: Arc<dyn MembershipStore>,
    mut jobs: mpsc::UnboundedReceiver<Delivery>,
    done: mpsc::UnboundedSender<Internal>,
) {
    while let Some(delivery) = jobs.recv().await {
        let result = match &delivery.target {
            Target::Ids(ids) => Ok(unique(ids)),
            Target::All => resolve_members(store.as_ref(), &SelectionRule::default()).await,
            Target::Rule(rule) => resolve_members(store.as_ref(), rule).await,
        };
        if done.send(Internal::Resolved { delivery, result }).is_err() {
            break;
        }
    }
}

/// Explicit id lists may repeat ids; store results never do.
fn unique(ids: &[ConnectionId]) -> Vec<ConnectionId> {
    ids.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
}

fn to_node_event(event: RegistryEvent) -> Option<NodeEvent> {
    match event {
        RegistryEvent::Authenticated { .. } => None,
        RegistryEvent::Registered { link, id } => Some(NodeEvent::Registered { id, link }),
        RegistryEvent::Unregistered { id } => Some(NodeEvent::Unregistered { id }),
        RegistryEvent::Rejected { link, reason } => Some(NodeEvent::Rejected { link, reason }),
        RegistryEvent::Message {
            link,
            id,
            name,
            args,
        } => Some(NodeEvent::Message {
            id,
            link,
            name,
            args,
        }),
        RegistryEvent::Data { link, id, value } => Some(NodeEvent::Data { id, link, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_ids_are_deduplicated() {
        let ids: Vec<ConnectionId> = ["b", "a", "b", "a"].into_iter().map(Into::into).collect();
        assert_eq!(unique(&ids), vec![ConnectionId::from("a"), ConnectionId::from("b")]);
    }

    #[test]
    fn test_taps_follow_the_rule_union() {
        let rule = SelectionRule {
            or: vec!["room".into(), "lobby".into()],
            not: vec!["banned".into()],
            ..Default::default()
        };
        assert_eq!(
            targeted_groups(&Target::Rule(rule)),
            vec![GroupId::from("room"), GroupId::from("lobby")]
        );
        assert_eq!(targeted_groups(&Target::All), vec![GroupId::all()]);
        assert!(targeted_groups(&Target::Ids(vec!["a".into()])).is_empty());
    }
}
