//! Fan-out of streaming output to every connection watching a conversation.
//!
//! Connections join a room per conversation. Each attached connection owns a
//! bounded queue drained by its own forwarder task, so delivery order is
//! preserved per connection and one slow observer never holds up the others.
//! A connection whose queue fills up is evicted as lagging.

use crate::context::GenerationResult;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque handle for one observer connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// A fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
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

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Events delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Another connection joined the room.
    Joined { conversation_id: String, connection_id: ConnectionId },
    /// A connection left the room.
    Left { conversation_id: String, connection_id: ConnectionId },
    /// One piece of generated text; `sequence` starts at 0 per generation.
    Chunk { conversation_id: String, sequence: u64, delta: String },
    /// The generation failed. Terminal.
    Error { conversation_id: String, code: String, message: String },
    /// The generation finished. Terminal.
    Complete { conversation_id: String, result: GenerationResult },
}

impl StreamEvent {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::Left { .. } => "left",
            Self::Chunk { .. } => "chunk",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
        }
    }

    /// Whether no further events follow for this generation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Complete { .. })
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Joined { conversation_id, .. }
            | Self::Left { conversation_id, .. }
            | Self::Chunk { conversation_id, .. }
            | Self::Error { conversation_id, .. }
            | Self::Complete { conversation_id, .. } => conversation_id,
        }
    }
}

/// Errors reported by a [`Transport`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is gone; the broker detaches it.
    #[error("Connection closed")]
    Disconnected,

    /// This event could not be delivered; the connection stays attached.
    #[error("Send failed: {0}")]
    Send(String),
}

/// Callback the transport invokes once when a connection goes away.
pub type DisconnectCallback = Box<dyn FnOnce() + Send + 'static>;

/// The push channel to observer connections (WebSocket, SSE, stdout...).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Delivers one event to one connection.
    async fn send(&self, connection: &ConnectionId, event: &StreamEvent) -> Result<(), TransportError>;

    /// Registers `callback` to run when `connection` disconnects.
    fn on_disconnect(&self, connection: &ConnectionId, callback: DisconnectCallback);
}

struct BrokerInner {
    transport: Arc<dyn Transport>,
    rooms: DashMap<String, HashMap<ConnectionId, mpsc::Sender<StreamEvent>>>,
    attachments: DashMap<ConnectionId, String>,
    buffer: usize,
}

/// Room registry and fan-out for streaming events.
///
/// Cloning is cheap and clones share state. [`StreamingBroker::attach`]
/// spawns a task, so it must be called from within a tokio runtime.
#[derive(Clone)]
pub struct StreamingBroker {
    inner: Arc<BrokerInner>,
}

impl fmt::Debug for StreamingBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingBroker")
            .field("rooms", &self.inner.rooms.len())
            .field("connections", &self.inner.attachments.len())
            .field("buffer", &self.inner.buffer)
            .finish()
    }
}

impl StreamingBroker {
    /// Creates a broker queueing up to `buffer` events per connection.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, buffer: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                transport,
                rooms: DashMap::new(),
                attachments: DashMap::new(),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Adds `connection` to the conversation's room.
    ///
    /// Existing members are told with a `Joined` event. A connection attached
    /// elsewhere is detached first; attaching to the same room again is a no-op.
    pub fn attach(&self, connection: ConnectionId, conversation_id: &str) {
        if let Some(current) = self.inner.conversation_of(&connection) {
            if current == conversation_id {
                return;
            }
            self.inner.detach(&connection);
        }

        let (tx, rx) = mpsc::channel(self.inner.buffer);
        tokio::spawn(forward(Arc::downgrade(&self.inner), connection.clone(), rx));

        let joined = StreamEvent::Joined {
            conversation_id: conversation_id.to_string(),
            connection_id: connection.clone(),
        };
        let lagging = {
            let mut room = self.inner.rooms.entry(conversation_id.to_string()).or_default();
            let lagging = deliver(&room, &joined);
            room.insert(connection.clone(), tx);
            lagging
        };
        self.inner.attachments.insert(connection.clone(), conversation_id.to_string());
        info!(conversation_id, connection = %connection, "Connection attached");

        let weak = Arc::downgrade(&self.inner);
        let id = connection.clone();
        self.inner.transport.on_disconnect(
            &connection,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.detach(&id);
                }
            }),
        );

        self.inner.evict(lagging);
    }

    /// Removes `connection` from its room, telling the remaining members.
    ///
    /// Returns the conversation it was attached to.
    pub fn detach(&self, connection: &ConnectionId) -> Option<String> {
        self.inner.detach(connection)
    }

    /// Queues `event` for every member of the conversation's room.
    ///
    /// Returns how many connections accepted it.
    pub fn broadcast(&self, conversation_id: &str, event: &StreamEvent) -> usize {
        self.inner.broadcast(conversation_id, event)
    }

    pub fn broadcast_chunk(&self, conversation_id: &str, sequence: u64, delta: &str) -> usize {
        self.broadcast(
            conversation_id,
            &StreamEvent::Chunk { conversation_id: conversation_id.to_string(), sequence, delta: delta.to_string() },
        )
    }

    pub fn broadcast_error(&self, conversation_id: &str, code: &str, message: &str) -> usize {
        self.broadcast(
            conversation_id,
            &StreamEvent::Error {
                conversation_id: conversation_id.to_string(),
                code: code.to_string(),
                message: message.to_string(),
            },
        )
    }

    pub fn broadcast_complete(&self, conversation_id: &str, result: &GenerationResult) -> usize {
        self.broadcast(
            conversation_id,
            &StreamEvent::Complete { conversation_id: conversation_id.to_string(), result: result.clone() },
        )
    }

    /// Connections in the conversation's room, sorted.
    pub fn room_members(&self, conversation_id: &str) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .inner
            .rooms
            .get(conversation_id)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn conversation_of(&self, connection: &ConnectionId) -> Option<String> {
        self.inner.conversation_of(connection)
    }
}

impl BrokerInner {
    fn conversation_of(&self, connection: &ConnectionId) -> Option<String> {
        self.attachments.get(connection).map(|c| c.clone())
    }

    fn detach(&self, connection: &ConnectionId) -> Option<String> {
        let (_, conversation_id) = self.attachments.remove(connection)?;

        let left = StreamEvent::Left { conversation_id: conversation_id.clone(), connection_id: connection.clone() };
        let (lagging, empty) = match self.rooms.get_mut(&conversation_id) {
            Some(mut room) => {
                // Dropping the sender ends the forwarder once its queue drains.
                room.remove(connection);
                (deliver(&room, &left), room.is_empty())
            }
            None => (Vec::new(), false),
        };
        if empty {
            self.rooms.remove_if(&conversation_id, |_, room| room.is_empty());
        }
        info!(conversation_id = %conversation_id, connection = %connection, "Connection detached");

        self.evict(lagging);
        Some(conversation_id)
    }

    fn broadcast(&self, conversation_id: &str, event: &StreamEvent) -> usize {
        let (delivered, lagging) = match self.rooms.get(conversation_id) {
            Some(room) => {
                let lagging = deliver(&room, event);
                (room.len() - lagging.len(), lagging)
            }
            None => (0, Vec::new()),
        };
        debug!(conversation_id, kind = event.kind(), delivered, "Broadcast event");
        self.evict(lagging);
        delivered
    }

    fn evict(&self, lagging: Vec<ConnectionId>) {
        for connection in lagging {
            warn!(connection = %connection, "Evicting lagging connection");
            self.detach(&connection);
        }
    }
}

/// Queues `event` on every sender, returning the connections that could not take it.
fn deliver(room: &HashMap<ConnectionId, mpsc::Sender<StreamEvent>>, event: &StreamEvent) -> Vec<ConnectionId> {
    room.iter()
        .filter_map(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => None,
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => Some(id.clone()),
        })
        .collect()
}

/// Drains one connection's queue into the transport.
async fn forward(broker: Weak<BrokerInner>, connection: ConnectionId, mut rx: mpsc::Receiver<StreamEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = broker.upgrade() else { break };
        let transport = Arc::clone(&inner.transport);
        drop(inner);

        match transport.send(&connection, &event).await {
            Ok(()) => {}
            Err(TransportError::Disconnected) => {
                debug!(connection = %connection, "Transport reports connection closed");
                if let Some(inner) = broker.upgrade() {
                    inner.detach(&connection);
                }
                break;
            }
            Err(TransportError::Send(reason)) => {
                warn!(connection = %connection, kind = event.kind(), reason = %reason, "Failed to deliver event");
            }
        }
    }
    debug!(connection = %connection, "Forwarder stopped");
}
