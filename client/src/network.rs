//! Reference transport for the replication session.
//!
//! Reliable traffic runs over one TCP stream of length-prefixed frames,
//! unreliable traffic over a connected UDP socket whose datagrams carry the
//! participant id in front. Background tasks move bytes between the sockets
//! and the session's queues; the session itself never awaits.

use crate::channel::{inbound_queue, Delivery, Inbound, InboundQueue, InboundSender, Outbound, QueuedChannel};
use log::{debug, error, info, warn};
use shared::framing::{read_frame, write_frame, FrameError};
use shared::protocol::{Connect, Disconnect};
use shared::{
    decode_datagram, encode_datagram, Message, MessageReader, ParticipantId, ProtocolError,
    MAX_DATAGRAM_BYTES, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Empty datagrams keep the server's view of our UDP address fresh.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no welcome from server within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("server refused connection: {0}")]
    Refused(String),
    #[error("unexpected handshake reply")]
    UnexpectedReply,
}

/// A live connection, ready to be handed to a session.
pub struct Connection {
    pub participant: ParticipantId,
    pub server_time_ms: u32,
    pub channel: QueuedChannel,
    pub inbound: InboundQueue,
    pub tasks: TransportTasks,
}

/// Background I/O tasks of one connection; aborted when dropped.
pub struct TransportTasks(Vec<JoinHandle<()>>);

impl TransportTasks {
    /// Stops every task. Queued outbound bytes are dropped.
    pub fn close(&mut self) {
        for task in self.0.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TransportTasks {
    fn drop(&mut self) {
        self.close();
    }
}

/// Performs the `Connect` / `Welcome` handshake and starts the I/O tasks.
pub async fn connect(server: SocketAddr, inbound_capacity: usize) -> Result<Connection, TransportError> {
    info!("Connecting to {}", server);
    let mut stream = TcpStream::connect(server).await?;
    stream.set_nodelay(true)?;

    let hello = Message::Connect(Connect {
        protocol_version: PROTOCOL_VERSION,
    })
    .encode()?;
    write_frame(&mut stream, &hello).await?;

    let reply = timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| TransportError::HandshakeTimeout(HANDSHAKE_TIMEOUT))??;
    let (participant, server_time_ms) = match MessageReader::new(&reply).next() {
        Some(Ok(Message::Welcome(welcome))) => (welcome.participant, welcome.server_time_ms),
        Some(Ok(Message::Disconnect(Disconnect { reason }))) => {
            return Err(TransportError::Refused(reason))
        }
        Some(Err(e)) => return Err(e.into()),
        _ => return Err(TransportError::UnexpectedReply),
    };
    info!("Connected as participant {}", participant);

    let bind_addr: SocketAddr = if server.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    socket.connect(server).await?;
    socket.send(&encode_datagram(participant, &[])).await?;

    let (inbound_tx, inbound) = inbound_queue(inbound_capacity);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (read_half, write_half) = stream.into_split();

    let tasks = vec![
        spawn_reliable_reader(read_half, inbound_tx.clone()),
        spawn_unreliable_reader(Arc::clone(&socket), inbound_tx),
        spawn_writer(write_half, Arc::clone(&socket), participant, outbound_rx),
        spawn_keepalive(socket, participant),
    ];

    Ok(Connection {
        participant,
        server_time_ms,
        channel: QueuedChannel::new(outbound_tx),
        inbound,
        tasks: TransportTasks(tasks),
    })
}

/// Forwards reliable frames; a closed stream becomes a `Disconnect`.
fn spawn_reliable_reader(mut reader: OwnedReadHalf, inbound_tx: InboundSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = loop {
            match read_frame(&mut reader).await {
                Ok(bytes) => {
                    let inbound = Inbound {
                        delivery: Delivery::Reliable,
                        bytes,
                    };
                    if inbound_tx.send(inbound).await.is_err() {
                        debug!("Session gone, stopping reliable reader");
                        return;
                    }
                }
                Err(FrameError::ConnectionClosed) => break "connection closed".to_string(),
                Err(e) => {
                    error!("Reliable stream failed: {}", e);
                    break e.to_string();
                }
            }
        };

        match Message::Disconnect(Disconnect { reason }).encode() {
            Ok(bytes) => {
                let _ = inbound_tx
                    .send(Inbound {
                        delivery: Delivery::Reliable,
                        bytes,
                    })
                    .await;
            }
            Err(e) => error!("Failed to encode disconnect notice: {}", e),
        }
    })
}

fn spawn_unreliable_reader(socket: Arc<UdpSocket>, inbound_tx: InboundSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = [0u8; MAX_DATAGRAM_BYTES];
        loop {
            match socket.recv(&mut buffer).await {
                Ok(len) => {
                    let Some((_, payload)) = decode_datagram(&buffer[..len]) else {
                        warn!("Dropping {} byte runt datagram", len);
                        continue;
                    };
                    if payload.is_empty() {
                        continue;
                    }
                    let inbound = Inbound {
                        delivery: Delivery::Unreliable,
                        bytes: payload.to_vec(),
                    };
                    match inbound_tx.try_send(inbound) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("Inbound queue full, dropping datagram");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
                Err(e) => {
                    debug!("Error receiving datagram: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    })
}

fn spawn_writer(
    mut writer: OwnedWriteHalf,
    socket: Arc<UdpSocket>,
    participant: ParticipantId,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Reliable(bytes) => {
                    if let Err(e) = write_frame(&mut writer, &bytes).await {
                        error!("Failed to send reliable message: {}", e);
                        break;
                    }
                }
                Outbound::Unreliable(bytes) => {
                    if let Err(e) = socket.send(&encode_datagram(participant, &bytes)).await {
                        debug!("Failed to send datagram: {}", e);
                    }
                }
            }
        }
    })
}

fn spawn_keepalive(socket: Arc<UdpSocket>, participant: ParticipantId) -> JoinHandle<()> {
    tokio::spawn(async move {
        let keepalive = encode_datagram(participant, &[]);
        let mut ticker = interval(KEEPALIVE_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = socket.send(&keepalive).await {
                debug!("Keepalive failed: {}", e);
            }
        }
    })
}
