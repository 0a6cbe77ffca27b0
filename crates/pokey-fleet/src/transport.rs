//! The seam between the fleet and the network.
//!
//! The fleet never touches sockets. It names connections by [`ConnectionId`],
//! asks a [`Transport`] to open, close and write to them, and receives
//! decoded messages back as [`InboundReply`] values.
//! [`TokioTransport`](crate::TokioTransport) is the network implementation
//! and [`MemoryTransport`] records everything for tests.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use pokey_protocol::Message;
use serde::Serialize;
use thiserror::Error;

/// Connection id used for discovery broadcasts and their replies.
pub const BROADCAST_CONNECTION: &str = "broadcast";

/// Opaque name of a transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(name: impl Into<String>) -> Self {
        ConnectionId(name.into())
    }

    pub fn broadcast() -> Self {
        ConnectionId::new(BROADCAST_CONNECTION)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(name: &str) -> Self {
        ConnectionId::new(name)
    }
}

/// Errors raised by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("unknown connection '{0}'")]
    UnknownConnection(ConnectionId),

    #[error("connection '{0}' already exists")]
    DuplicateConnection(ConnectionId),

    #[error("send queue full for '{0}'")]
    QueueFull(ConnectionId),

    #[error("connection '{0}' is closed")]
    Closed(ConnectionId),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded message and the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundReply {
    pub connection: ConnectionId,
    pub message: Message,
}

impl InboundReply {
    pub fn new(connection: ConnectionId, message: Message) -> Self {
        InboundReply { connection, message }
    }
}

/// Outbound side of the network.
///
/// All methods return immediately. Sends are fire-and-forget: an `Ok` means
/// the bytes were queued, not delivered.
pub trait Transport: Send + Sync {
    /// Open a connection to `address` (`host:port`) under `id`.
    fn create_connection(&self, id: &ConnectionId, address: &str) -> Result<(), TransportError>;

    /// Close and forget a connection.
    fn close_connection(&self, id: &ConnectionId) -> Result<(), TransportError>;

    /// Queue bytes on a connection.
    fn send(&self, id: &ConnectionId, data: &[u8]) -> Result<(), TransportError>;

    /// Send bytes on the broadcast channel.
    fn broadcast(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Whether the connection currently has a live socket.
    fn is_connected(&self, id: &ConnectionId) -> bool;

    /// Every open connection, connected or not.
    fn connection_ids(&self) -> Vec<ConnectionId>;
}

#[derive(Debug)]
struct MemoryConnection {
    address: String,
    connected: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    connections: BTreeMap<ConnectionId, MemoryConnection>,
    sent: Vec<(ConnectionId, Vec<u8>)>,
    broadcasts: Vec<Vec<u8>>,
    closed: Vec<ConnectionId>,
    refuse_connections: bool,
}

/// In-memory transport that records traffic.
#[derive(Debug)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    connect_immediately: bool,
}

impl MemoryTransport {
    /// New connections report connected straight away.
    pub fn new() -> Self {
        MemoryTransport {
            state: Mutex::new(MemoryState::default()),
            connect_immediately: true,
        }
    }

    /// New connections stay disconnected until [`Self::set_connected`].
    pub fn disconnected() -> Self {
        MemoryTransport {
            state: Mutex::new(MemoryState::default()),
            connect_immediately: false,
        }
    }

    pub fn set_connected(&self, id: &ConnectionId, connected: bool) {
        if let Some(connection) = self.state.lock().connections.get_mut(id) {
            connection.connected = connected;
        }
    }

    /// Make `create_connection` fail until switched back.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    pub fn address_of(&self, id: &ConnectionId) -> Option<String> {
        self.state.lock().connections.get(id).map(|c| c.address.clone())
    }

    /// Drain recorded unicast sends.
    pub fn take_sent(&self) -> Vec<(ConnectionId, Vec<u8>)> {
        std::mem::take(&mut self.state.lock().sent)
    }

    /// Drain recorded broadcasts.
    pub fn take_broadcasts(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().broadcasts)
    }

    /// Connections closed so far.
    pub fn closed(&self) -> Vec<ConnectionId> {
        self.state.lock().closed.clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn create_connection(&self, id: &ConnectionId, address: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.connections.contains_key(id) {
            return Err(TransportError::DuplicateConnection(id.clone()));
        }
        if state.refuse_connections {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("refused connection to {}", address),
            )));
        }
        state.connections.insert(
            id.clone(),
            MemoryConnection {
                address: address.to_string(),
                connected: self.connect_immediately,
            },
        );
        Ok(())
    }

    fn close_connection(&self, id: &ConnectionId) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.connections.remove(id).is_none() {
            return Err(TransportError::UnknownConnection(id.clone()));
        }
        state.closed.push(id.clone());
        Ok(())
    }

    fn send(&self, id: &ConnectionId, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.connections.contains_key(id) {
            return Err(TransportError::UnknownConnection(id.clone()));
        }
        state.sent.push((id.clone(), data.to_vec()));
        Ok(())
    }

    fn broadcast(&self, data: &[u8]) -> Result<(), TransportError> {
        self.state.lock().broadcasts.push(data.to_vec());
        Ok(())
    }

    fn is_connected(&self, id: &ConnectionId) -> bool {
        self.state
            .lock()
            .connections
            .get(id)
            .map(|c| c.connected)
            .unwrap_or(false)
    }

    fn connection_ids(&self) -> Vec<ConnectionId> {
        self.state.lock().connections.keys().cloned().collect()
    }
}
