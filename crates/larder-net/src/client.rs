//! TCP client for a Larder server.
//!
//! [`GameClient::join`] performs the join handshake and returns once the
//! welcome snapshot has arrived. From then on a reader task queues every room
//! delivery (welcome first) for [`GameClient::next_delivery`], and a
//! heartbeat task pings the server, marking the connection disconnected when
//! pongs stop arriving. State changes are published through a [`watch`]
//! channel so any number of consumers can react without polling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use larder_session::{Delivery, Intent, IntentError, IntentHandler, JoinOptions};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::{WireConfig, WireError, read_message, write_message};
use crate::messages::{ClientMessage, ServerMessage};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connect and join handshake in progress.
    Connecting,
    /// Joined and exchanging messages.
    Connected,
    /// Connection lost or closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Starts in [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Publishes a new state.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// New subscriber.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Current state.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Interval between pings.
    pub heartbeat_interval: Duration,
    /// Pong-less intervals tolerated before giving up.
    pub missed_heartbeats: u32,
    /// Framing and codec settings.
    pub wire: WireConfig,
    /// Bound of the local delivery queue. While it is full the socket is not
    /// read, and the heartbeat timeout is suspended until it drains.
    pub delivery_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            missed_heartbeats: 3,
            wire: WireConfig::default(),
            delivery_capacity: 256,
        }
    }
}

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connecting failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A message could not be sent or received.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The server refused the join.
    #[error("join rejected: {0}")]
    Rejected(String),
    /// The server answered the join with something other than a welcome.
    #[error("unexpected handshake reply")]
    UnexpectedReply,
    /// The intent failed local validation.
    #[error(transparent)]
    InvalidIntent(#[from] IntentError),
    /// The connection is no longer usable.
    #[error("disconnected")]
    Disconnected,
}

/// A joined session with a server.
pub struct GameClient {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    wire: WireConfig,
    deliveries: mpsc::Receiver<Delivery>,
    state: Arc<ConnectionStateWatch>,
    shutdown_tx: watch::Sender<bool>,
    session_id: String,
    room_id: String,
}

impl GameClient {
    /// Joins or creates a room under `room` on the server at `addr`.
    pub async fn join(
        addr: SocketAddr,
        room: &str,
        options: JoinOptions,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        Self::connect(addr, room, None, options, config).await
    }

    /// Joins the room with id `room_id`.
    pub async fn join_by_id(
        addr: SocketAddr,
        room_id: &str,
        options: JoinOptions,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        Self::connect(addr, "", Some(room_id), options, config).await
    }

    async fn connect(
        addr: SocketAddr,
        room: &str,
        room_id: Option<&str>,
        options: JoinOptions,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::Connecting);

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let join = ClientMessage::Join {
            room: room.to_string(),
            room_id: room_id.map(str::to_string),
            options,
        };
        write_message(&mut writer, &join, &config.wire).await?;

        let welcome = match read_message::<_, ServerMessage>(&mut reader, &config.wire).await? {
            ServerMessage::Welcome(welcome) => welcome,
            ServerMessage::JoinRejected { reason } => {
                state.set(ConnectionState::Disconnected);
                return Err(ClientError::Rejected(reason));
            }
            _ => {
                state.set(ConnectionState::Disconnected);
                return Err(ClientError::UnexpectedReply);
            }
        };
        state.set(ConnectionState::Connected);

        let session_id = welcome.session_id.clone();
        let room_id = welcome.room_id.clone();
        let (delivery_tx, deliveries) = mpsc::channel(config.delivery_capacity.max(1));
        // Capacity is at least one, so the welcome always fits.
        let _ = delivery_tx.try_send(Delivery::Welcome(welcome));

        let writer = Arc::new(Mutex::new(writer));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (pong_tx, pong_rx) = watch::channel(Some(Instant::now()));

        let reader_state = Arc::clone(&state);
        let reader_wire = config.wire.clone();
        let mut reader_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            Self::read_loop(
                reader,
                &reader_wire,
                delivery_tx,
                pong_tx,
                &reader_state,
                &mut reader_shutdown,
            )
            .await;
        });

        let hb_writer = Arc::clone(&writer);
        let hb_state = Arc::clone(&state);
        let hb_config = config.clone();
        let mut hb_shutdown = shutdown_rx;
        tokio::spawn(async move {
            Self::heartbeat_loop(&hb_writer, &hb_config, pong_rx, &hb_state, &mut hb_shutdown)
                .await;
        });

        Ok(Self {
            writer,
            wire: config.wire,
            deliveries,
            state,
            shutdown_tx,
            session_id,
            room_id,
        })
    }

    /// Session id assigned by the server.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Joined room id.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Connection state watch.
    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    /// Validates and sends an intent.
    pub async fn send_intent(&self, intent: Intent) -> Result<(), ClientError> {
        IntentHandler::validate(&intent)?;
        self.send(&ClientMessage::Intent(intent)).await
    }

    /// Next room delivery. `None` once the connection is gone and the queue
    /// is drained.
    pub async fn next_delivery(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    /// Next already-received delivery, without waiting.
    pub fn try_next_delivery(&mut self) -> Option<Delivery> {
        self.deliveries.try_recv().ok()
    }

    /// Tells the server we are leaving, then disconnects.
    pub async fn leave(&self) -> Result<(), ClientError> {
        let result = self.send(&ClientMessage::Leave).await;
        self.disconnect();
        result
    }

    /// Stops background tasks and marks the connection disconnected.
    pub fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        self.state.set(ConnectionState::Disconnected);
    }

    async fn send(&self, message: &ClientMessage) -> Result<(), ClientError> {
        if self.state.current() != ConnectionState::Connected {
            return Err(ClientError::Disconnected);
        }
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, message, &self.wire).await?;
        Ok(())
    }

    /// Forwards deliveries and records pongs until the stream ends. `None`
    /// on the pong channel means the reader is parked on a full delivery
    /// queue.
    async fn read_loop(
        mut reader: OwnedReadHalf,
        wire: &WireConfig,
        deliveries: mpsc::Sender<Delivery>,
        pongs: watch::Sender<Option<Instant>>,
        state: &ConnectionStateWatch,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = read_message::<_, ServerMessage>(&mut reader, wire) => {
                    let message = match result {
                        Ok(message) => message,
                        Err(err) => {
                            debug!("Read loop ended: {err}");
                            state.set(ConnectionState::Disconnected);
                            break;
                        }
                    };
                    if let ServerMessage::Pong { .. } = message {
                        let _ = pongs.send(Some(Instant::now()));
                        continue;
                    }
                    let Some(delivery) = message.into_delivery() else {
                        continue;
                    };
                    let delivery = match deliveries.try_send(delivery) {
                        Ok(()) => continue,
                        Err(TrySendError::Closed(_)) => break,
                        Err(TrySendError::Full(delivery)) => delivery,
                    };
                    debug!("Delivery queue full, pausing reads");
                    let _ = pongs.send(None);
                    if deliveries.send(delivery).await.is_err() {
                        break;
                    }
                    let _ = pongs.send(Some(Instant::now()));
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Pings every interval. Without a pong for `missed_heartbeats`
    /// intervals the connection is declared dead.
    async fn heartbeat_loop(
        writer: &Mutex<OwnedWriteHalf>,
        config: &ClientConfig,
        last_pong: watch::Receiver<Option<Instant>>,
        state: &ConnectionStateWatch,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let limit = config.heartbeat_interval * config.missed_heartbeats.max(1);
        let mut interval = tokio::time::interval(config.heartbeat_interval);
        let mut sequence: u32 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if state.current() != ConnectionState::Connected {
                        break;
                    }
                    let silent_for = last_pong
                        .borrow()
                        .map_or(Duration::ZERO, |at| at.elapsed());
                    if silent_for > limit {
                        warn!("Heartbeat timeout: no pong in {silent_for:?}");
                        state.set(ConnectionState::Disconnected);
                        break;
                    }

                    sequence = sequence.wrapping_add(1);
                    let ping = ClientMessage::Ping { sequence };
                    let mut w = writer.lock().await;
                    if write_message(&mut *w, &ping, &config.wire).await.is_err() {
                        state.set(ConnectionState::Disconnected);
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_session::{BroadcastEvent, SessionState, Welcome};
    use tokio::net::TcpListener;

    /// Accepts one connection, answers its join with `reply`, then stays
    /// silent without reading.
    async fn scripted_server(reply: ServerMessage) -> SocketAddr {
        scripted_stream(vec![reply]).await
    }

    /// Like [`scripted_server`], writing every message in `replies`.
    async fn scripted_stream(replies: Vec<ServerMessage>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let wire = WireConfig::default();
            let _: ClientMessage = read_message(&mut stream, &wire).await.unwrap();
            for reply in &replies {
                write_message(&mut stream, reply, &wire).await.unwrap();
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(stream);
        });
        addr
    }

    fn welcome() -> ServerMessage {
        ServerMessage::Welcome(Welcome {
            room_id: "room-1".to_string(),
            session_id: "abc".to_string(),
            state: SessionState::new(),
        })
    }

    #[test]
    fn test_connection_state_transitions() {
        let watch = ConnectionStateWatch::new();
        assert_eq!(watch.current(), ConnectionState::Disconnected);
        watch.set(ConnectionState::Connecting);
        assert_eq!(watch.current(), ConnectionState::Connecting);
        watch.set(ConnectionState::Connected);
        assert_eq!(watch.current(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_welcome_is_first_delivery() {
        let addr = scripted_server(welcome()).await;
        let mut client = GameClient::join(
            addr,
            "kitchen",
            JoinOptions::named("Alice"),
            ClientConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(client.session_id(), "abc");
        assert_eq!(client.room_id(), "room-1");
        assert_eq!(client.state().current(), ConnectionState::Connected);
        assert!(matches!(
            client.next_delivery().await,
            Some(Delivery::Welcome(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_join_surfaces_reason() {
        let addr = scripted_server(ServerMessage::JoinRejected {
            reason: "no seat available in kitchen".to_string(),
        })
        .await;
        let result = GameClient::join(
            addr,
            "kitchen",
            JoinOptions::named("Alice"),
            ClientConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(ClientError::Rejected(reason)) if reason.contains("kitchen")));
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_without_pongs() {
        let addr = scripted_server(welcome()).await;
        let config = ClientConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..ClientConfig::default()
        };
        let client = GameClient::join(addr, "kitchen", JoinOptions::named("Alice"), config)
            .await
            .unwrap();

        let mut rx = client.state().subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            while *rx.borrow_and_update() != ConnectionState::Disconnected {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("heartbeat should time out");
    }

    #[tokio::test]
    async fn test_slow_consumer_is_not_a_heartbeat_timeout() {
        let left = |id: &str| {
            ServerMessage::Event(BroadcastEvent::PlayerLeft {
                session_id: id.to_string(),
            })
        };
        let addr = scripted_stream(vec![welcome(), left("x"), left("y")]).await;
        let config = ClientConfig {
            heartbeat_interval: Duration::from_millis(20),
            delivery_capacity: 1,
            ..ClientConfig::default()
        };
        let mut client = GameClient::join(addr, "kitchen", JoinOptions::named("Alice"), config)
            .await
            .unwrap();

        // The queue holds only the welcome; the reader stalls on the events.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(client.state().current(), ConnectionState::Connected);

        assert!(matches!(
            client.next_delivery().await,
            Some(Delivery::Welcome(_))
        ));
        for id in ["x", "y"] {
            let Some(Delivery::Event(BroadcastEvent::PlayerLeft { session_id })) =
                client.next_delivery().await
            else {
                panic!("expected playerLeft");
            };
            assert_eq!(session_id, id);
        }
    }

    #[tokio::test]
    async fn test_invalid_intent_not_sent() {
        let addr = scripted_server(welcome()).await;
        let client = GameClient::join(
            addr,
            "kitchen",
            JoinOptions::named("Alice"),
            ClientConfig::default(),
        )
        .await
        .unwrap();
        let result = client
            .send_intent(Intent::ItemPickup {
                item_id: String::new(),
            })
            .await;
        assert!(matches!(result, Err(ClientError::InvalidIntent(_))));
    }

    #[tokio::test]
    async fn test_disconnect_blocks_sends() {
        let addr = scripted_server(welcome()).await;
        let client = GameClient::join(
            addr,
            "kitchen",
            JoinOptions::named("Alice"),
            ClientConfig::default(),
        )
        .await
        .unwrap();
        client.disconnect();
        let result = client
            .send_intent(Intent::PlayerFinished { play_duration: 1 })
            .await;
        assert!(matches!(result, Err(ClientError::Disconnected)));
    }
}
