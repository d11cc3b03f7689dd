//! Server network layer: TCP handshakes and reliable streams, the UDP relay
//! and the tick loop that flushes each participant's reliable outbox.

use crate::client_manager::{ClientManager, DEFAULT_CLIENT_TIMEOUT};
use crate::registry::EntityRegistry;
use crate::relay::{filter_state, route_departure, route_reliable, Routed};
use log::{debug, error, info, warn};
use shared::framing::{read_frame, write_frame, FrameError};
use shared::protocol::{Connect, Disconnect, Welcome};
use shared::{
    decode_datagram, encode_datagram, Message, MessageReader, ParticipantId, ProtocolError,
    MAX_DATAGRAM_BYTES, PROTOCOL_VERSION,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tick_duration: Duration,
    pub max_clients: usize,
    pub client_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_duration: Duration::from_millis(33),
            max_clients: 16,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }
}

/// Wrapping milliseconds since the server started; the shared time base
/// for ownership stamps.
#[derive(Debug, Clone, Copy)]
pub struct ServerClock {
    started: Instant,
}

impl ServerClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u32 {
        // truncation is the wraparound
        self.started.elapsed().as_millis() as u32
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    Joined {
        participant: ParticipantId,
    },
    Reliable {
        participant: ParticipantId,
        bytes: Vec<u8>,
    },
    Datagram {
        participant: ParticipantId,
        addr: SocketAddr,
        payload: Vec<u8>,
    },
    Left {
        participant: ParticipantId,
        reason: String,
    },
    TimedOut {
        participant: ParticipantId,
    },
    Shutdown,
}

#[derive(Debug)]
struct OutgoingDatagram {
    addr: SocketAddr,
    bytes: Vec<u8>,
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no hello within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("first message was not a connect")]
    UnexpectedHello,
}

/// Stops a running server from outside the loop.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(ServerMessage::Shutdown);
    }
}

/// Relay server coordinating participants and the entity registry
pub struct Server {
    listener: Arc<TcpListener>,
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    registry: EntityRegistry,
    config: ServerConfig,
    clock: ServerClock,
    tick: u64,
    tasks: Vec<JoinHandle<()>>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    relay_tx: mpsc::UnboundedSender<OutgoingDatagram>,
    relay_rx: Option<mpsc::UnboundedReceiver<OutgoingDatagram>>,
}

impl Server {
    /// Binds TCP and UDP on the same address.
    pub async fn bind(addr: &str, config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let socket = UdpSocket::bind(local).await?;
        info!("Server listening on {} (tcp + udp)", local);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let clients = ClientManager::with_timeout(config.max_clients, config.client_timeout);

        Ok(Server {
            listener: Arc::new(listener),
            socket: Arc::new(socket),
            clients: Arc::new(RwLock::new(clients)),
            registry: EntityRegistry::new(),
            config,
            clock: ServerClock::new(),
            tick: 0,
            tasks: Vec::new(),
            server_tx,
            server_rx,
            relay_tx,
            relay_rx: Some(relay_rx),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.server_tx.clone(),
        }
    }

    /// Accepts connections and runs one handshake task per stream
    fn spawn_acceptor(&mut self) {
        let listener = Arc::clone(&self.listener);
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();
        let clock = self.clock;

        self.tasks.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let clients = Arc::clone(&clients);
                        let server_tx = server_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                serve_connection(stream, addr, clients, server_tx, clock).await
                            {
                                warn!("Connection from {} failed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }));
    }

    /// Forwards datagrams to the main loop
    fn spawn_network_receiver(&mut self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM_BYTES];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let Some((participant, payload)) = decode_datagram(&buffer[..len]) else {
                            warn!("Dropping {} byte runt datagram from {}", len, addr);
                            continue;
                        };
                        let message = ServerMessage::Datagram {
                            participant,
                            addr,
                            payload: payload.to_vec(),
                        };
                        if server_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }));
    }

    fn spawn_network_sender(&mut self) {
        let Some(mut relay_rx) = self.relay_rx.take() else {
            return;
        };
        let socket = Arc::clone(&self.socket);

        self.tasks.push(tokio::spawn(async move {
            while let Some(OutgoingDatagram { addr, bytes }) = relay_rx.recv().await {
                if let Err(e) = socket.send_to(&bytes, addr).await {
                    debug!("Failed to send datagram to {}: {}", addr, e);
                }
            }
        }));
    }

    fn spawn_timeout_checker(&mut self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let timed_out = clients.write().await.check_timeouts();
                for participant in timed_out {
                    if server_tx.send(ServerMessage::TimedOut { participant }).is_err() {
                        return;
                    }
                }
            }
        }));
    }

    async fn deliver(&self, routed: &[Routed]) {
        if !routed.is_empty() {
            self.clients.write().await.deliver(routed);
        }
    }

    /// Returns false once the loop should stop.
    async fn handle_message(&mut self, message: ServerMessage) -> bool {
        match message {
            ServerMessage::Joined { participant } => {
                let snapshot: Vec<Routed> = self
                    .registry
                    .snapshot()
                    .into_iter()
                    .map(|spawned| Routed::to(participant, Message::EntitySpawned(spawned)))
                    .collect();
                debug!(
                    "Sending {} entities to participant {}",
                    snapshot.len(),
                    participant
                );
                self.deliver(&snapshot).await;
            }
            ServerMessage::Reliable { participant, bytes } => {
                self.handle_reliable(participant, &bytes).await;
            }
            ServerMessage::Datagram {
                participant,
                addr,
                payload,
            } => self.handle_datagram(participant, addr, &payload).await,
            ServerMessage::Left {
                participant,
                reason,
            } => {
                if self.clients.write().await.remove(participant) {
                    debug!("Participant {} left: {}", participant, reason);
                    self.depart(participant).await;
                }
            }
            ServerMessage::TimedOut { participant } => self.depart(participant).await,
            ServerMessage::Shutdown => {
                info!("Server shutting down");
                return false;
            }
        }
        true
    }

    async fn handle_reliable(&mut self, participant: ParticipantId, bytes: &[u8]) {
        if !self.clients.write().await.touch(participant, None) {
            debug!("Reliable message from departed participant {}", participant);
            return;
        }

        let now = self.clock.now_ms();
        let mut routed = Vec::new();
        for message in MessageReader::new(bytes) {
            match message {
                Ok(Message::Disconnect(Disconnect { reason })) => {
                    info!("Participant {} is leaving: {}", participant, reason);
                    self.deliver(&routed).await;
                    if self.clients.write().await.remove(participant) {
                        self.depart(participant).await;
                    }
                    return;
                }
                Ok(Message::Connect(_)) => {
                    warn!("Participant {} sent a second connect", participant);
                }
                Ok(message) => {
                    routed.extend(route_reliable(&mut self.registry, participant, message, now));
                }
                Err(e) => {
                    warn!("Malformed message from participant {}: {}", participant, e);
                    break;
                }
            }
        }
        self.deliver(&routed).await;
    }

    async fn handle_datagram(&mut self, participant: ParticipantId, addr: SocketAddr, payload: &[u8]) {
        if !self.clients.write().await.touch(participant, Some(addr)) {
            debug!("Datagram from unknown participant {} at {}", participant, addr);
            return;
        }
        if payload.is_empty() {
            return;
        }

        let Some(relayed) = filter_state(&mut self.registry, participant, payload) else {
            return;
        };
        let datagram = encode_datagram(participant, &relayed);
        let targets = self.clients.read().await.udp_targets(participant);
        for (_, addr) in targets {
            let outgoing = OutgoingDatagram {
                addr,
                bytes: datagram.clone(),
            };
            if self.relay_tx.send(outgoing).is_err() {
                error!("Datagram sender is gone");
                return;
            }
        }
    }

    /// Releases what a departed participant held and tells everyone.
    async fn depart(&mut self, participant: ParticipantId) {
        let departure = self
            .registry
            .release_participant(participant, self.clock.now_ms());
        let routed = route_departure(departure);
        self.deliver(&routed).await;
    }

    async fn on_tick(&mut self) {
        self.tick += 1;
        let (frames, bytes) = self.clients.write().await.flush_reliable();

        if self.tick % 300 == 0 {
            let participants = self.clients.read().await.len();
            if participants > 0 {
                debug!(
                    "Tick {}: {} participants, {} entities, {} frames ({} bytes) this tick",
                    self.tick,
                    participants,
                    self.registry.len(),
                    frames,
                    bytes
                );
            }
        }
    }

    /// Main server loop
    pub async fn run(mut self) -> io::Result<()> {
        self.spawn_acceptor();
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut tick_interval = interval(self.config.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    let keep_running = match message {
                        Some(message) => self.handle_message(message).await,
                        None => false,
                    };
                    if !keep_running {
                        break;
                    }
                },
                _ = tick_interval.tick() => self.on_tick().await,
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }
}

async fn refuse(stream: &mut TcpStream, reason: &str) -> Result<(), ConnectionError> {
    let bytes = Message::Disconnect(Disconnect {
        reason: reason.to_string(),
    })
    .encode()?;
    write_frame(stream, &bytes).await?;
    Ok(())
}

/// Handshake, then forwards the participant's frames until the stream ends.
async fn serve_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    clients: Arc<RwLock<ClientManager>>,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    clock: ServerClock,
) -> Result<(), ConnectionError> {
    stream.set_nodelay(true)?;
    let hello = timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout(HANDSHAKE_TIMEOUT))??;

    match MessageReader::new(&hello).next() {
        Some(Ok(Message::Connect(Connect { protocol_version }))) => {
            if protocol_version != PROTOCOL_VERSION {
                info!(
                    "Refusing {}: protocol version {} (expected {})",
                    addr, protocol_version, PROTOCOL_VERSION
                );
                return refuse(&mut stream, "Protocol version mismatch").await;
            }
        }
        _ => return Err(ConnectionError::UnexpectedHello),
    }

    let (reliable_tx, reliable_rx) = mpsc::unbounded_channel();
    let added = clients.write().await.add(addr, reliable_tx);
    let Some(participant) = added else {
        info!("Refusing {}: server full", addr);
        return refuse(&mut stream, "Server full").await;
    };

    // the welcome must travel alone, ahead of anything queued for us
    let welcome = Message::Welcome(Welcome {
        participant,
        server_time_ms: clock.now_ms(),
    })
    .encode()?;
    if let Err(e) = write_frame(&mut stream, &welcome).await {
        let _ = server_tx.send(ServerMessage::Left {
            participant,
            reason: e.to_string(),
        });
        return Err(e.into());
    }

    let (mut reader, writer) = stream.into_split();
    tokio::spawn(write_frames(writer, reliable_rx, participant));
    if server_tx.send(ServerMessage::Joined { participant }).is_err() {
        return Ok(());
    }

    let reason = loop {
        match read_frame(&mut reader).await {
            Ok(bytes) => {
                if server_tx
                    .send(ServerMessage::Reliable { participant, bytes })
                    .is_err()
                {
                    return Ok(());
                }
            }
            Err(FrameError::ConnectionClosed) => break "connection closed".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    let _ = server_tx.send(ServerMessage::Left {
        participant,
        reason,
    });
    Ok(())
}

/// Writes outbox frames until the participant is dropped, then closes.
async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    participant: ParticipantId,
) {
    while let Some(bytes) = frames.recv().await {
        if let Err(e) = write_frame(&mut writer, &bytes).await {
            warn!("Failed to write to participant {}: {}", participant, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
