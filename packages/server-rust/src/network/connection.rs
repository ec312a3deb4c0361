//! Sync connections and the registry that tracks them.
//!
//! Every websocket gets a bounded outbound channel. The view syncer that owns
//! the client group only ever enqueues [`Downstream`] messages; the socket's
//! writer task encodes them in the connection's current [`Encoding`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify, RwLock};
use viewsync_core::messages::{Downstream, Encoding};

use super::config::ConnectionConfig;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Message queued for a connection's writer task.
#[derive(Debug)]
pub enum OutboundMessage {
    Message(Box<Downstream>),
    /// A close frame with an optional reason.
    Close(Option<String>),
}

/// Error returned when sending a message to a connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The channel stayed full for the whole timeout.
    Timeout,
    /// The writer task has exited.
    Disconnected,
    /// The channel is full (`try_send` only).
    Full,
}

/// Sending half of one client's socket.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<OutboundMessage>,
    pub metadata: Arc<RwLock<ConnectionMetadata>>,
    pub connected_at: Instant,
    /// Woken when a close could not be queued; the session ends its read
    /// loop on its own.
    pub evicted: Notify,
}

impl ConnectionHandle {
    /// Enqueues a message without blocking.
    ///
    /// # Errors
    ///
    /// [`SendError::Full`] when the client is not keeping up, and
    /// [`SendError::Disconnected`] once the writer has exited.
    pub fn try_send(&self, msg: OutboundMessage) -> Result<(), SendError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Enqueues a downstream message.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionHandle::try_send`].
    pub fn send(&self, msg: Downstream) -> Result<(), SendError> {
        self.try_send(OutboundMessage::Message(Box::new(msg)))
    }

    /// Asks the writer to close the socket. A client too slow to take the
    /// close frame is evicted instead.
    pub fn close(&self, reason: impl Into<String>) {
        if self
            .try_send(OutboundMessage::Close(Some(reason.into())))
            .is_err()
        {
            self.evicted.notify_one();
        }
    }

    /// Sends a message, waiting up to `timeout` for channel capacity.
    ///
    /// # Errors
    ///
    /// [`SendError::Timeout`] if the channel stays full,
    /// [`SendError::Disconnected`] if the writer has exited.
    pub async fn send_timeout(
        &self,
        msg: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// `false` once the writer task has dropped its receiver.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// What the server knows about the client behind a connection.
#[derive(Debug)]
pub struct ConnectionMetadata {
    pub client_id: String,
    pub client_group_id: String,
    pub wsid: String,
    /// Encoding of the client's last frame; replies use the same one.
    pub encoding: Encoding,
    pub last_message: Instant,
}

impl Default for ConnectionMetadata {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_group_id: String::new(),
            wsid: String::new(),
            encoding: Encoding::default(),
            last_message: Instant::now(),
        }
    }
}

/// All open sync connections of a process.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Connection ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection. The receiver goes to the socket's writer task.
    pub fn register(
        &self,
        config: &ConnectionConfig,
        metadata: ConnectionMetadata,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_capacity);

        let handle = Arc::new(ConnectionHandle {
            id,
            tx,
            metadata: Arc::new(RwLock::new(metadata)),
            connected_at: Instant::now(),
            evicted: Notify::new(),
        });

        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Removes and returns every connection. Used during graceful shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| *entry.key())
            .collect();

        keys.into_iter()
            .filter_map(|key| self.connections.remove(&key).map(|(_, handle)| handle))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
