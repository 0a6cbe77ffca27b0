//! Network transport on tokio.
//!
//! Each device connection is a task that connects, then shuttles bytes
//! between the socket and the fleet until the socket drops, then waits and
//! reconnects. Writes go through a bounded queue per connection. Reads are
//! decoded with a [`FrameCodec`] per connection and delivered as
//! [`InboundReply`] values on a crossbeam channel, so the reply dispatcher
//! does not need to be async.
//!
//! Discovery uses a single UDP socket with broadcast enabled. Every datagram
//! it receives is decoded on its own and delivered under the
//! [`BROADCAST_CONNECTION`] id.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use pokey_metrics::metric_defs;
use pokey_protocol::{DecodeResult, FrameCodec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FleetConfig;
use crate::transport::{ConnectionId, InboundReply, Transport, TransportError, BROADCAST_CONNECTION};

/// Connections with a live socket, tagged with the task that owns it.
type ConnectedSet = Arc<RwLock<HashMap<ConnectionId, u64>>>;

static NEXT_TASK: AtomicU64 = AtomicU64::new(1);

/// Marks a connection connected while a session runs and clears the mark
/// when the task ends, aborted or not. A later task that reuses the id
/// keeps its own mark.
struct ConnectedGuard {
    id: ConnectionId,
    task: u64,
    connected: ConnectedSet,
}

impl ConnectedGuard {
    fn new(id: ConnectionId, connected: ConnectedSet) -> Self {
        ConnectedGuard {
            id,
            task: NEXT_TASK.fetch_add(1, Ordering::Relaxed),
            connected,
        }
    }

    fn mark(&self) {
        self.connected.write().insert(self.id.clone(), self.task);
    }

    fn clear(&self) {
        let mut connected = self.connected.write();
        if connected.get(&self.id) == Some(&self.task) {
            connected.remove(&self.id);
        }
    }
}

impl Drop for ConnectedGuard {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Capacity of each connection's write queue.
const WRITE_QUEUE_DEPTH: usize = 256;

/// Settings for [`TokioTransport`].
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Local address of the broadcast socket.
    pub broadcast_bind: String,
    /// Destination of broadcasts.
    pub broadcast_address: String,
    /// Delay before reconnecting a dropped connection.
    pub reconnect_interval: Duration,
}

impl From<&FleetConfig> for TransportOptions {
    fn from(config: &FleetConfig) -> Self {
        TransportOptions {
            broadcast_bind: config.broadcast_bind.clone(),
            broadcast_address: config.broadcast_address.clone(),
            reconnect_interval: config.reconnect_interval(),
        }
    }
}

struct ConnectionHandle {
    address: SocketAddr,
    tx_sender: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
}

/// Why a connected session ended.
enum SessionEnd {
    /// The device closed the socket.
    Remote,
    /// The connection was closed locally.
    Shutdown,
}

/// [`Transport`] over TCP and UDP broadcast.
pub struct TokioTransport {
    runtime: tokio::runtime::Handle,
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    connected: ConnectedSet,
    inbound: Sender<InboundReply>,
    broadcast_socket: Arc<UdpSocket>,
    broadcast_target: SocketAddr,
    broadcast_task: JoinHandle<()>,
    reconnect_interval: Duration,
}

impl TokioTransport {
    /// Bind the broadcast socket and start listening for discovery replies.
    pub fn new(
        runtime: tokio::runtime::Handle,
        inbound: Sender<InboundReply>,
        options: TransportOptions,
    ) -> Result<Self, TransportError> {
        let bind: SocketAddr = options
            .broadcast_bind
            .parse()
            .map_err(|_| TransportError::InvalidAddress(options.broadcast_bind.clone()))?;
        let broadcast_target: SocketAddr = options
            .broadcast_address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(options.broadcast_address.clone()))?;

        let socket = std::net::UdpSocket::bind(bind)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;

        let _guard = runtime.enter();
        let broadcast_socket = Arc::new(UdpSocket::from_std(socket)?);
        let broadcast_task = runtime.spawn(run_broadcast_listener(
            broadcast_socket.clone(),
            inbound.clone(),
        ));
        info!(bind = %bind, target = %broadcast_target, "broadcast socket ready");

        Ok(TokioTransport {
            runtime: runtime.clone(),
            connections: Mutex::new(HashMap::new()),
            connected: Arc::new(RwLock::new(HashMap::new())),
            inbound,
            broadcast_socket,
            broadcast_target,
            broadcast_task,
            reconnect_interval: options.reconnect_interval,
        })
    }

    /// Address a connection was opened to.
    pub fn address_of(&self, id: &ConnectionId) -> Option<SocketAddr> {
        self.connections.lock().get(id).map(|c| c.address)
    }
}

impl Transport for TokioTransport {
    fn create_connection(&self, id: &ConnectionId, address: &str) -> Result<(), TransportError> {
        let address: SocketAddr = address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;

        let mut connections = self.connections.lock();
        if connections.contains_key(id) {
            return Err(TransportError::DuplicateConnection(id.clone()));
        }

        let (tx_sender, tx_receiver) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        let task = self.runtime.spawn(run_device_connection(
            id.clone(),
            address,
            tx_receiver,
            self.inbound.clone(),
            self.connected.clone(),
            self.reconnect_interval,
        ));
        connections.insert(
            id.clone(),
            ConnectionHandle {
                address,
                tx_sender,
                task,
            },
        );
        Ok(())
    }

    fn close_connection(&self, id: &ConnectionId) -> Result<(), TransportError> {
        let handle = self
            .connections
            .lock()
            .remove(id)
            .ok_or_else(|| TransportError::UnknownConnection(id.clone()))?;
        handle.task.abort();
        self.connected.write().remove(id);
        debug!(connection = %id, address = %handle.address, "connection closed");
        Ok(())
    }

    fn send(&self, id: &ConnectionId, data: &[u8]) -> Result<(), TransportError> {
        let connections = self.connections.lock();
        let handle = connections
            .get(id)
            .ok_or_else(|| TransportError::UnknownConnection(id.clone()))?;

        // Never block the caller; drop the write if the queue is full.
        handle.tx_sender.try_send(data.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(id.clone()),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed(id.clone()),
        })
    }

    fn broadcast(&self, data: &[u8]) -> Result<(), TransportError> {
        self.broadcast_socket.try_send_to(data, self.broadcast_target)?;
        Ok(())
    }

    fn is_connected(&self, id: &ConnectionId) -> bool {
        self.connected.read().contains_key(id)
    }

    fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.lock().keys().cloned().collect()
    }
}

impl Drop for TokioTransport {
    fn drop(&mut self) {
        self.broadcast_task.abort();
        for (_, handle) in self.connections.lock().drain() {
            handle.task.abort();
        }
    }
}

/// Deliver every complete message buffered in `codec`.
fn deliver(codec: &mut FrameCodec, connection: &ConnectionId, inbound: &Sender<InboundReply>) -> bool {
    loop {
        match codec.decode() {
            DecodeResult::Waiting => return true,
            DecodeResult::Success(message) => {
                if inbound.send(InboundReply::new(connection.clone(), message)).is_err() {
                    // Dispatcher gone
                    return false;
                }
            }
            DecodeResult::Ignore => {
                metrics::counter!(metric_defs::FRAMES_IGNORED.name).increment(1);
            }
            DecodeResult::Error(e) => {
                warn!(connection = %connection, "decode error: {}", e);
            }
        }
    }
}

/// Receive discovery replies until the inbound channel closes.
async fn run_broadcast_listener(socket: Arc<UdpSocket>, inbound: Sender<InboundReply>) {
    let connection = ConnectionId::new(BROADCAST_CONNECTION);
    let mut buf = [0u8; 1500];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, peer)) => {
                // Our own discovery request comes back as a single byte.
                if n <= 1 {
                    continue;
                }
                debug!(%peer, len = n, "broadcast datagram");
                let mut codec = FrameCodec::new();
                codec.push(&buf[..n]);
                if !deliver(&mut codec, &connection, &inbound) {
                    return;
                }
            }
            Err(e) => {
                warn!("broadcast receive failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Keep one device connection alive until it is closed.
async fn run_device_connection(
    id: ConnectionId,
    address: SocketAddr,
    mut tx_receiver: mpsc::Receiver<Vec<u8>>,
    inbound: Sender<InboundReply>,
    connected: ConnectedSet,
    reconnect_interval: Duration,
) {
    let guard = ConnectedGuard::new(id.clone(), connected);
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(connection = %id, "set_nodelay failed: {}", e);
                }
                guard.mark();
                info!(connection = %id, %address, "connected");

                let result = handle_device_connection(&id, stream, &mut tx_receiver, &inbound).await;

                guard.clear();
                match result {
                    Ok(SessionEnd::Shutdown) => return,
                    Ok(SessionEnd::Remote) => warn!(connection = %id, "connection closed by device"),
                    Err(e) => warn!(connection = %id, "connection error: {}", e),
                }
            }
            Err(e) => {
                debug!(connection = %id, %address, "connect failed: {}", e);
            }
        }
        tokio::time::sleep(reconnect_interval).await;
    }
}

/// Handle a single connected session.
async fn handle_device_connection(
    id: &ConnectionId,
    mut stream: TcpStream,
    tx_receiver: &mut mpsc::Receiver<Vec<u8>>,
    inbound: &Sender<InboundReply>,
) -> io::Result<SessionEnd> {
    let (mut reader, mut writer) = stream.split();
    let mut codec = FrameCodec::new();
    let mut read_buf = [0u8; 1024];

    loop {
        tokio::select! {
            // Device -> fleet
            result = reader.read(&mut read_buf) => {
                let n = result?;
                if n == 0 {
                    return Ok(SessionEnd::Remote);
                }
                codec.push(&read_buf[..n]);
                if !deliver(&mut codec, id, inbound) {
                    return Ok(SessionEnd::Shutdown);
                }
            }

            // Fleet -> device
            data = tx_receiver.recv() => {
                let Some(data) = data else {
                    return Ok(SessionEnd::Shutdown);
                };
                writer.write_all(&data).await?;
                writer.flush().await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pokey_protocol::{calculate_checksum, Message, PinMask, CMD_GET_DEVICE_STATE, FRAME_SIZE, OFFSET_CHECKSUM, OFFSET_COMMAND, REPLY_MARKER};
    use tokio::net::TcpListener;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn options() -> TransportOptions {
        TransportOptions {
            broadcast_bind: "127.0.0.1:0".to_string(),
            broadcast_address: "127.0.0.1:9".to_string(),
            reconnect_interval: Duration::from_millis(20),
        }
    }

    fn state_frame(down: &[usize]) -> Vec<u8> {
        let mut frame = [0u8; FRAME_SIZE];
        frame[0] = REPLY_MARKER;
        frame[OFFSET_COMMAND] = CMD_GET_DEVICE_STATE;
        frame[OFFSET_CHECKSUM] = calculate_checksum(&frame);
        PinMask::with_down(down).write_to_frame(&mut frame);
        frame.to_vec()
    }

    #[test]
    fn test_connected_guard_clears_only_its_own_mark() {
        let connected: ConnectedSet = Arc::new(RwLock::new(HashMap::new()));
        let id = ConnectionId::new("pokey3");

        let old = ConnectedGuard::new(id.clone(), connected.clone());
        old.mark();
        assert!(connected.read().contains_key(&id));
        drop(old);
        assert!(!connected.read().contains_key(&id));

        // A task for a reused id marks itself; a stale task ending later
        // must not clear it.
        let stale = ConnectedGuard::new(id.clone(), connected.clone());
        let fresh = ConnectedGuard::new(id.clone(), connected.clone());
        stale.mark();
        fresh.mark();
        drop(stale);
        assert!(connected.read().contains_key(&id));
        drop(fresh);
        assert!(connected.read().is_empty());
    }

    #[test]
    fn test_aborted_connection_is_not_reported_connected() {
        let rt = runtime();
        let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let device_addr = listener.local_addr().unwrap();
        let accept = rt.spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let (tx, _rx) = crossbeam_channel::unbounded();
        let transport = TokioTransport::new(rt.handle().clone(), tx, options()).unwrap();
        let id = ConnectionId::new("pokey4");
        transport.create_connection(&id, &device_addr.to_string()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !transport.is_connected(&id) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(transport.is_connected(&id));

        transport.close_connection(&id).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!transport.is_connected(&id));
        accept.abort();
    }

    #[test]
    fn test_rejects_bad_addresses() {
        let rt = runtime();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let transport = TokioTransport::new(rt.handle().clone(), tx, options()).unwrap();
        let id = ConnectionId::new("pokey1");

        assert!(matches!(
            transport.create_connection(&id, "not-an-address"),
            Err(TransportError::InvalidAddress(_))
        ));
        assert!(matches!(
            transport.send(&id, &[1]),
            Err(TransportError::UnknownConnection(_))
        ));
        assert!(matches!(
            transport.close_connection(&id),
            Err(TransportError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_round_trip_with_device() {
        let rt = runtime();
        let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let device_addr = listener.local_addr().unwrap();

        // Fake device: wait for one request, answer with a state frame.
        let device = rt.spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; FRAME_SIZE];
            socket.read_exact(&mut request).await.unwrap();
            let reply = state_frame(&[3]);
            // Split the reply to exercise reassembly.
            socket.write_all(&reply[..10]).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            socket.write_all(&reply[10..]).await.unwrap();
            request
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        let transport = TokioTransport::new(rt.handle().clone(), tx, options()).unwrap();
        let id = ConnectionId::new("pokey22961");
        transport
            .create_connection(&id, &device_addr.to_string())
            .unwrap();

        let request = pokey_protocol::Command::GetDeviceState.encode().unwrap();
        transport.send(&id, &request).unwrap();

        let reply = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reply.connection, id);
        match reply.message {
            Message::DeviceState(state) => assert_eq!(state.pins.down_pins(), vec![3]),
            other => panic!("unexpected {:?}", other),
        }

        let received = rt.block_on(device).unwrap();
        assert_eq!(received[OFFSET_COMMAND], CMD_GET_DEVICE_STATE);

        transport.close_connection(&id).unwrap();
        assert!(!transport.is_connected(&id));
        assert!(transport.connection_ids().is_empty());
    }
}
