//! TCP server bridging client connections to the session registry.
//!
//! Each accepted connection runs one task:
//!
//! 1. Handshake: the first frame must be [`ClientMessage::Join`]. A refused
//!    join is answered with [`ServerMessage::JoinRejected`] and the
//!    connection is closed.
//! 2. A writer task drains the participant's room outbox and heartbeat
//!    answers into the socket.
//! 3. The reader loop forwards intents to the room, awaiting inbox space, so
//!    a busy room slows the socket reader down.
//! 4. Whatever ends the connection (leave, idle timeout, transport error,
//!    eviction, server shutdown), the participant leaves its room.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use larder_session::{Delivery, RoomError, SessionRegistry};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{WireConfig, read_message, write_message};
use crate::messages::{ClientMessage, ServerMessage};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 2567;

/// Queue depth for connection-level replies (pongs).
const CONTROL_QUEUE: usize = 16;

/// Unique identifier for a TCP connection within a server run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Monotonic [`ConnectionId`] source.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Starts at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Next unique id.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned when the connection map is full.
#[derive(Debug)]
pub struct ConnectionLimitReached;

/// Live connections and their peer addresses, bounded by a limit.
pub struct ConnectionMap {
    inner: RwLock<HashMap<ConnectionId, SocketAddr>>,
    max_connections: usize,
}

impl ConnectionMap {
    /// Creates an empty map holding at most `max_connections`.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Registers a connection unless the limit is reached.
    pub async fn insert(
        &self,
        id: ConnectionId,
        peer: SocketAddr,
    ) -> Result<(), ConnectionLimitReached> {
        let mut map = self.inner.write().await;
        if map.len() >= self.max_connections {
            return Err(ConnectionLimitReached);
        }
        map.insert(id, peer);
        Ok(())
    }

    /// Unregisters a connection.
    pub async fn remove(&self, id: &ConnectionId) -> Option<SocketAddr> {
        self.inner.write().await.remove(id)
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether no connection is live.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listening address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// A connection silent for this long is dropped.
    pub idle_timeout: Duration,
    /// Framing and codec settings.
    pub wire: WireConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 256,
            idle_timeout: Duration::from_secs(30),
            wire: WireConfig::default(),
        }
    }
}

/// Accepts TCP connections and routes them into rooms.
pub struct GameServer {
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    /// Active connections (public for test inspection).
    pub connections: Arc<ConnectionMap>,
    id_gen: Arc<IdGenerator>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GameServer {
    /// Creates a server over `registry`.
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            connections: Arc::new(ConnectionMap::new(config.max_connections)),
            id_gen: Arc::new(IdGenerator::new()),
            config: Arc::new(config),
            registry,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// The registry connections are routed into.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Binds the configured address and runs the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("Server listening on {}", listener.local_addr()?);
        self.run_with_listener(listener).await
    }

    /// Runs the accept loop on a pre-bound listener.
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = result?;
                    stream.set_nodelay(true)?;

                    let id = self.id_gen.next_id();
                    if self.connections.insert(id, peer_addr).await.is_err() {
                        warn!("Connection limit reached, rejecting {peer_addr}");
                        continue;
                    }
                    info!("Accepted connection {id:?} from {peer_addr}");

                    let connections = Arc::clone(&self.connections);
                    let registry = Arc::clone(&self.registry);
                    let config = Arc::clone(&self.config);
                    let task_shutdown = self.shutdown_rx.clone();

                    tokio::spawn(async move {
                        handle_connection(id, stream, &registry, &config, task_shutdown).await;
                        connections.remove(&id).await;
                        info!("Connection {id:?} closed");
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Signals the accept loop and every connection to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Per-connection handling
// ---------------------------------------------------------------------------

async fn handle_connection(
    id: ConnectionId,
    stream: TcpStream,
    registry: &SessionRegistry,
    config: &ServerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let first = timeout(
        config.idle_timeout,
        read_message::<_, ClientMessage>(&mut reader, &config.wire),
    )
    .await;
    let (room, room_id, options) = match first {
        Ok(Ok(ClientMessage::Join {
            room,
            room_id,
            options,
        })) => (room, room_id, options),
        Ok(Ok(_)) => {
            warn!("Connection {id:?} did not open with a join");
            return;
        }
        Ok(Err(err)) => {
            debug!("Connection {id:?} failed during handshake: {err}");
            return;
        }
        Err(_) => {
            info!("Connection {id:?} sent no join within {:?}", config.idle_timeout);
            return;
        }
    };

    let (outbox_tx, outbox_rx) = mpsc::channel(registry.room_settings().outbox_capacity.max(1));
    let joined = match room_id {
        Some(room_id) => registry.join_by_id(&room_id, options, outbox_tx).await,
        None => registry.join_or_create(&room, options, outbox_tx).await,
    };
    let membership = match joined {
        Ok(membership) => membership,
        Err(err) => {
            warn!("Connection {id:?} join refused: {err}");
            let reply = ServerMessage::JoinRejected {
                reason: err.to_string(),
            };
            let _ = write_message(&mut writer, &reply, &config.wire).await;
            return;
        }
    };
    info!(
        "Connection {id:?} is {} in room {}",
        membership.session_id(),
        membership.room_id()
    );

    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
    let mut writer_task = tokio::spawn(write_loop(
        id,
        writer,
        outbox_rx,
        control_rx,
        config.wire.clone(),
    ));

    loop {
        tokio::select! {
            result = timeout(config.idle_timeout, read_message::<_, ClientMessage>(&mut reader, &config.wire)) => {
                let message = match result {
                    Ok(Ok(message)) => message,
                    Ok(Err(err)) => {
                        debug!("Connection {id:?} read ended: {err}");
                        break;
                    }
                    Err(_) => {
                        info!("Connection {id:?} idle for {:?}, dropping", config.idle_timeout);
                        break;
                    }
                };
                match message {
                    ClientMessage::Intent(intent) => match membership.send(intent).await {
                        Ok(()) | Err(RoomError::Rejected(_)) => {}
                        Err(RoomError::Closed(_)) => break,
                    },
                    ClientMessage::Ping { sequence } => {
                        let _ = control_tx.try_send(ServerMessage::Pong { sequence });
                    }
                    ClientMessage::Leave => break,
                    ClientMessage::Join { .. } => {
                        warn!("Connection {id:?} sent a second join, ignoring");
                    }
                }
            }
            _ = &mut writer_task => {
                // Outbox closed (eviction or disposal) or the socket failed.
                break;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    registry.leave(membership).await;
    writer_task.abort();
}

/// Writes room deliveries and control replies until the outbox closes or the
/// socket fails.
async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Delivery>,
    mut control: mpsc::Receiver<ServerMessage>,
    wire: WireConfig,
) {
    loop {
        let message = tokio::select! {
            delivery = outbox.recv() => match delivery {
                Some(delivery) => ServerMessage::from(delivery),
                None => break,
            },
            Some(reply) = control.recv() => reply,
        };
        if let Err(err) = write_message(&mut writer, &message, &wire).await {
            debug!("Connection {id:?} write failed: {err}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_session::{RoomSettings, WorldSettings};
    use tokio::io::AsyncReadExt;

    async fn start_test_server(
        max_connections: usize,
        room: RoomSettings,
    ) -> (SocketAddr, Arc<GameServer>) {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections,
            ..ServerConfig::default()
        };
        let registry = Arc::new(SessionRegistry::new(room, WorldSettings::default()));
        let server = Arc::new(GameServer::new(config, registry));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = Arc::clone(&server);
        tokio::spawn(async move {
            srv.run_with_listener(listener).await.unwrap();
        });
        (addr, server)
    }

    async fn send_join(stream: &mut TcpStream, room_id: Option<&str>) {
        let join = ClientMessage::Join {
            room: "kitchen".to_string(),
            room_id: room_id.map(str::to_string),
            options: larder_session::JoinOptions::named("tester"),
        };
        write_message(stream, &join, &WireConfig::default())
            .await
            .unwrap();
    }

    async fn wait_for_connections(server: &GameServer, expected: usize) {
        for _ in 0..100 {
            if server.connections.len().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {expected} connections");
    }

    #[test]
    fn test_connection_id_uniqueness() {
        let id_gen = IdGenerator::new();
        let first = id_gen.next_id();
        let second = id_gen.next_id();
        assert_eq!(first, ConnectionId(1));
        assert_eq!(second, ConnectionId(2));
    }

    #[tokio::test]
    async fn test_connection_map_enforces_limit() {
        let map = ConnectionMap::new(1);
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(map.insert(ConnectionId(1), peer).await.is_ok());
        assert!(map.insert(ConnectionId(2), peer).await.is_err());
        assert_eq!(map.remove(&ConnectionId(1)).await, Some(peer));
        assert!(map.is_empty().await);
    }

    #[tokio::test]
    async fn test_join_receives_welcome() {
        let (addr, server) = start_test_server(16, RoomSettings::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_join(&mut stream, None).await;

        let reply: ServerMessage = read_message(&mut stream, &WireConfig::default())
            .await
            .unwrap();
        let ServerMessage::Welcome(welcome) = reply else {
            panic!("expected welcome, got {reply:?}");
        };
        assert!(welcome.state.players.contains_key(&welcome.session_id));
        assert_eq!(server.registry().room_count().await, 1);
    }

    #[tokio::test]
    async fn test_first_frame_must_be_join() {
        let (addr, _server) = start_test_server(16, RoomSettings::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(
            &mut stream,
            &ClientMessage::Ping { sequence: 1 },
            &WireConfig::default(),
        )
        .await
        .unwrap();

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "server should close a connection that skips the join");
    }

    #[tokio::test]
    async fn test_full_server_rejects_join() {
        let room = RoomSettings {
            capacity: 1,
            max_rooms: 1,
            ..RoomSettings::default()
        };
        let (addr, _server) = start_test_server(16, room).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        send_join(&mut first, None).await;
        let _: ServerMessage = read_message(&mut first, &WireConfig::default())
            .await
            .unwrap();

        let mut second = TcpStream::connect(addr).await.unwrap();
        send_join(&mut second, None).await;
        let reply: ServerMessage = read_message(&mut second, &WireConfig::default())
            .await
            .unwrap();
        assert!(matches!(reply, ServerMessage::JoinRejected { .. }));
    }

    #[tokio::test]
    async fn test_unknown_room_id_rejected() {
        let (addr, _server) = start_test_server(16, RoomSettings::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_join(&mut stream, Some("missing")).await;

        let reply: ServerMessage = read_message(&mut stream, &WireConfig::default())
            .await
            .unwrap();
        let ServerMessage::JoinRejected { reason } = reply else {
            panic!("expected rejection");
        };
        assert!(reason.contains("missing"));
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let (addr, server) = start_test_server(2, RoomSettings::default()).await;
        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        wait_for_connections(&server, 2).await;

        let _c3 = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connections.len().await, 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections_and_leaves_rooms() {
        let (addr, server) = start_test_server(16, RoomSettings::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_join(&mut stream, None).await;
        let _: ServerMessage = read_message(&mut stream, &WireConfig::default())
            .await
            .unwrap();

        server.shutdown();

        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        wait_for_connections(&server, 0).await;
        let rooms = server.registry().rooms().await;
        assert!(rooms.iter().all(|room| room.occupants == 0));
    }
}
