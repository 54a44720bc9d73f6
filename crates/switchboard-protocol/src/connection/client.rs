//! Client runtime: drives one [`Connection`] on its own task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use switchboard_transport::{Connector, SignalReceiver};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::{AckResult, Ackable, Connection, ConnectionConfig};
use crate::error::{AckError, ProtocolError};
use crate::events::{Event, EventKey};
use crate::runtime::sleep_until;
use crate::types::ConnectionId;

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

enum ClientCommand {
    Send {
        name: String,
        args: Vec<Value>,
        quality: bool,
    },
    SendData(Value),
    Request {
        name: String,
        args: Vec<Value>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<AckResult>,
    },
    Ack {
        channel: String,
        args: Vec<Value>,
        reply: oneshot::Sender<bool>,
    },
    Reopen(Option<Duration>),
    Close,
    Shutdown,
}

/// Handle to a running client session. Cheap to clone.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<ClientCommand>,
    id: ConnectionId,
}

impl ClientHandle {
    /// Durable id this client announces.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn command(&self, cmd: ClientCommand) -> Result<(), ProtocolError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ProtocolError::Shutdown)
    }

    /// Queue an event.
    pub async fn send(&self, name: &str, args: Vec<Value>) -> Result<(), ProtocolError> {
        self.command(ClientCommand::Send {
            name: name.to_string(),
            args,
            quality: false,
        })
        .await
    }

    /// Queue an event ahead of everything already queued.
    pub async fn send_quality(&self, name: &str, args: Vec<Value>) -> Result<(), ProtocolError> {
        self.command(ClientCommand::Send {
            name: name.to_string(),
            args,
            quality: true,
        })
        .await
    }

    /// Queue an opaque data frame.
    pub async fn send_data(&self, value: Value) -> Result<(), ProtocolError> {
        self.command(ClientCommand::SendData(value)).await
    }

    /// Send an event carrying an ack channel and wait for the peer's reply.
    pub async fn request(
        &self,
        name: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.command(ClientCommand::Request {
            name: name.to_string(),
            args,
            timeout,
            reply: tx,
        })
        .await?;
        let result = rx.await.map_err(|_| ProtocolError::Ack(AckError::Dropped))?;
        Ok(result?)
    }

    /// Answer an ack channel the peer sent. Returns whether it was sent.
    pub async fn ack(&self, channel: &str, args: Vec<Value>) -> Result<bool, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.command(ClientCommand::Ack {
            channel: channel.to_string(),
            args,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| ProtocolError::Shutdown)
    }

    pub async fn reopen(&self, delay: Option<Duration>) -> Result<(), ProtocolError> {
        self.command(ClientCommand::Reopen(delay)).await
    }

    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.command(ClientCommand::Close).await
    }

    /// Close the session and stop its task.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Shutdown).await;
    }
}

/// Channels returned when a client starts.
pub struct ClientChannels {
    pub handle: ClientHandle,
    /// Every event the session emits.
    pub events: mpsc::Receiver<Event>,
}

/// Spawns client session tasks.
pub struct Client;

impl Client {
    /// Build a session from `config`, open it, and drive it on a new task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: ConnectionConfig, connector: Arc<dyn Connector>) -> ClientChannels {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        let (mut conn, signals) = Connection::new(config, connector);
        conn.on(EventKey::Any, move |conn, event| {
            if let Err(e) = event_tx.try_send(event.clone()) {
                tracing::warn!("client: {} dropped event {:?}: {e}", conn.id(), event.key());
            }
        });
        let id = conn.id().clone();

        tokio::spawn(client_loop(conn, signals, cmd_rx));

        ClientChannels {
            handle: ClientHandle { cmd_tx, id },
            events: event_rx,
        }
    }
}

async fn client_loop(
    mut conn: Connection,
    mut signals: SignalReceiver,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
) {
    conn.open();
    loop {
        let deadline = conn.next_deadline();
        tokio::select! {
            Some((link, signal)) = signals.recv() => {
                conn.handle_signal(link, signal);
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    conn.close();
                    break;
                };
                if !handle_command(&mut conn, cmd) {
                    break;
                }
            }
            _ = sleep_until(deadline) => {
                conn.tick(Instant::now());
            }
        }
        if conn.has_pending_flush() {
            conn.flush();
        }
    }
    tracing::debug!("client: {} stopped", conn.id());
}

/// Apply one command. Returns `false` once the loop should stop.
fn handle_command(conn: &mut Connection, cmd: ClientCommand) -> bool {
    match cmd {
        ClientCommand::Send {
            name,
            args,
            quality,
        } => {
            if quality {
                conn.quality();
            }
            if let Err(e) = conn.send(&name, args) {
                tracing::warn!("client: failed to queue {name}: {e}");
            }
        }
        ClientCommand::SendData(value) => {
            if let Err(e) = conn.send_data(&value) {
                tracing::warn!("client: failed to queue data frame: {e}");
            }
        }
        ClientCommand::Request {
            name,
            args,
            timeout,
            reply,
        } => {
            if let Some(after) = timeout {
                conn.expire(after);
            }
            let result = conn.send_with_ack(&name, args, move |_, result| {
                let _ = reply.send(result);
            });
            if let Err(e) = result {
                tracing::warn!("client: failed to queue request {name}: {e}");
            }
        }
        ClientCommand::Ack {
            channel,
            args,
            reply,
        } => {
            let sent = conn.ack(&channel, &args).unwrap_or_else(|e| {
                tracing::warn!("client: failed to queue ack: {e}");
                false
            });
            let _ = reply.send(sent);
        }
        ClientCommand::Reopen(delay) => conn.reopen(delay),
        ClientCommand::Close => conn.close(),
        ClientCommand::Shutdown => {
            conn.close();
            return false;
        }
    }
    true
}
