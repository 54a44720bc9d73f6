//! In-process transport.
//!
//! [`network`] returns a connector/listener pair joined by channels. Every
//! `connect` creates a link with two ends; a frame sent on one end surfaces
//! as [`TransportSignal::Message`] on the other. Closing (or dropping) either
//! end closes the whole link and both owners observe a `Close` signal.
//!
//! Used by tests and by single-process deployments where sessions and the
//! node share an address space.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

use crate::{
    Connector, Listener, ReadyState, SignalSender, Transport, TransportError, TransportSignal,
};

struct Link {
    state: ReadyState,
    client: SignalSender,
    server: Option<SignalSender>,
}

type SharedLink = Arc<Mutex<Link>>;

fn lock(link: &Mutex<Link>) -> MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(PoisonError::into_inner)
}

fn close_link(link: &Mutex<Link>) {
    let mut link = lock(link);
    if link.state == ReadyState::Closed {
        return;
    }
    link.state = ReadyState::Closed;
    link.client.emit(TransportSignal::Close);
    if let Some(server) = &link.server {
        server.emit(TransportSignal::Close);
    }
}

struct Shared {
    pending: mpsc::UnboundedSender<SharedLink>,
    links: Mutex<Vec<Weak<Mutex<Link>>>>,
    refusing: AtomicBool,
}

/// Create a connected connector/listener pair.
pub fn network() -> (MemoryConnector, MemoryListener) {
    let (pending_tx, pending_rx) = mpsc::unbounded_channel();
    let connector = MemoryConnector {
        shared: Arc::new(Shared {
            pending: pending_tx,
            links: Mutex::new(Vec::new()),
            refusing: AtomicBool::new(false),
        }),
    };
    (connector, MemoryListener { pending: pending_rx })
}

/// Client side of an in-process network. Cheap to clone.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    /// Refuse (or accept again) new connections. A refused connect yields a
    /// transport that reports `Close` straight away, like a socket whose
    /// handshake failed.
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Drop every live link, as a network partition would.
    pub fn sever_all(&self) {
        let links: Vec<SharedLink> = {
            let mut links = self
                .shared
                .links
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            links.retain(|weak| weak.strong_count() > 0);
            links.iter().filter_map(Weak::upgrade).collect()
        };
        for link in links {
            close_link(&link);
        }
    }

    /// Number of links that have not been closed.
    pub fn live_links(&self) -> usize {
        let links = self
            .shared
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        links
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|link| lock(link).state != ReadyState::Closed)
            .count()
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        url: &str,
        signals: SignalSender,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let link = Arc::new(Mutex::new(Link {
            state: ReadyState::Connecting,
            client: signals,
            server: None,
        }));

        let refused = self.shared.refusing.load(Ordering::SeqCst)
            || self.shared.pending.send(link.clone()).is_err();
        if refused {
            tracing::debug!("memory: connection to {url} refused");
            close_link(&link);
        } else {
            self.shared
                .links
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::downgrade(&link));
        }

        Ok(Box::new(MemoryTransport {
            link,
            side: Side::Client,
        }))
    }
}

/// Server side of an in-process network.
pub struct MemoryListener {
    pending: mpsc::UnboundedReceiver<SharedLink>,
}

#[async_trait::async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self, signals: SignalSender) -> Result<Box<dyn Transport>, TransportError> {
        loop {
            let link = self
                .pending
                .recv()
                .await
                .ok_or(TransportError::ListenerClosed)?;

            {
                let mut guard = lock(&link);
                // The client gave up before we got to it.
                if guard.state != ReadyState::Connecting {
                    continue;
                }
                guard.state = ReadyState::Open;
                guard.client.emit(TransportSignal::Open);
                signals.emit(TransportSignal::Open);
                guard.server = Some(signals);
            }

            return Ok(Box::new(MemoryTransport {
                link,
                side: Side::Server,
            }));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// One end of an in-process link.
pub struct MemoryTransport {
    link: SharedLink,
    side: Side,
}

impl Transport for MemoryTransport {
    fn ready_state(&self) -> ReadyState {
        lock(&self.link).state
    }

    fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        let link = lock(&self.link);
        if link.state != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        let peer = match self.side {
            Side::Client => link.server.as_ref(),
            Side::Server => Some(&link.client),
        };
        match peer {
            Some(peer) if peer.emit(TransportSignal::Message(frame.to_string())) => Ok(()),
            _ => Err(TransportError::Send(anyhow::anyhow!("peer end is gone"))),
        }
    }

    fn close(&mut self, code: u16, reason: &str) {
        tracing::trace!("memory: {:?} end closing ({code} {reason})", self.side);
        close_link(&self.link);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        close_link(&self.link);
    }
}
