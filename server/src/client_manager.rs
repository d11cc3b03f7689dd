//! Participant bookkeeping for the relay server
//!
//! This module tracks everyone connected to the server:
//! - Participant lifecycle (handshake, disconnect, timeout)
//! - The UDP address each participant sends datagrams from
//! - Per-participant reliable outboxes, coalesced into one frame per tick
//!
//! The manager is shared between the network tasks and the tick loop behind
//! a `tokio::sync::RwLock`.

use crate::relay::{Route, Routed};
use log::{debug, info, warn};
use shared::{Message, ParticipantId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Silence after which a participant is dropped.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// One connected participant
///
/// The reliable sender feeds the connection's writer task; dropping the
/// participant drops the sender, which closes the stream.
#[derive(Debug)]
pub struct Participant {
    pub id: ParticipantId,
    pub tcp_addr: SocketAddr,
    /// Learned from the first datagram carrying our id.
    pub udp_addr: Option<SocketAddr>,
    pub last_seen: Instant,
    /// Reliable messages queued this tick, tag-prefixed back to back.
    pub outbox: Vec<u8>,
    reliable_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Participant {
    pub fn new(id: ParticipantId, tcp_addr: SocketAddr, reliable_tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id,
            tcp_addr,
            udp_addr: None,
            last_seen: Instant::now(),
            outbox: Vec::new(),
            reliable_tx,
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    pub fn queue(&mut self, message: &Message) {
        if let Err(e) = message.write_to(&mut self.outbox) {
            warn!("Dropping message for participant {}: {}", self.id, e);
        }
    }

    /// Hands the outbox to the writer task as one frame.
    fn flush(&mut self) -> Option<usize> {
        if self.outbox.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.outbox);
        let len = bytes.len();
        match self.reliable_tx.send(bytes) {
            Ok(()) => Some(len),
            Err(_) => {
                debug!("Writer for participant {} is gone", self.id);
                None
            }
        }
    }
}

/// Everyone connected, keyed by participant id
///
/// Ids start at 1; 0 is the server itself.
pub struct ClientManager {
    participants: HashMap<ParticipantId, Participant>,
    next_id: ParticipantId,
    max_clients: usize,
    timeout: Duration,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self::with_timeout(max_clients, DEFAULT_CLIENT_TIMEOUT)
    }

    pub fn with_timeout(max_clients: usize, timeout: Duration) -> Self {
        Self {
            participants: HashMap::new(),
            next_id: 1,
            max_clients,
            timeout,
        }
    }

    /// Returns the new id, or `None` when the server is full.
    pub fn add(&mut self, tcp_addr: SocketAddr, reliable_tx: mpsc::UnboundedSender<Vec<u8>>) -> Option<ParticipantId> {
        if self.participants.len() >= self.max_clients {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        info!("Participant {} connected from {}", id, tcp_addr);
        self.participants
            .insert(id, Participant::new(id, tcp_addr, reliable_tx));
        Some(id)
    }

    pub fn remove(&mut self, id: ParticipantId) -> bool {
        if let Some(participant) = self.participants.remove(&id) {
            info!("Participant {} disconnected", participant.id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.participants.contains_key(&id)
    }

    pub fn get(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.get(&id)
    }

    /// Records activity, learning the UDP address on first contact.
    ///
    /// Datagrams from a different host than the stream are refused.
    pub fn touch(&mut self, id: ParticipantId, udp_addr: Option<SocketAddr>) -> bool {
        let Some(participant) = self.participants.get_mut(&id) else {
            return false;
        };
        if let Some(addr) = udp_addr {
            if addr.ip() != participant.tcp_addr.ip() {
                warn!(
                    "Datagram for participant {} from foreign address {}",
                    id, addr
                );
                return false;
            }
            if participant.udp_addr != Some(addr) {
                debug!("Participant {} sends datagrams from {}", id, addr);
                participant.udp_addr = Some(addr);
            }
        }
        participant.last_seen = Instant::now();
        true
    }

    /// Queues routed messages into the matching outboxes.
    pub fn deliver(&mut self, routed: &[Routed]) {
        for Routed { route, message } in routed {
            match *route {
                Route::To(id) => {
                    if let Some(participant) = self.participants.get_mut(&id) {
                        participant.queue(message);
                    }
                }
                Route::Others(sender) => {
                    for participant in self.participants.values_mut().filter(|p| p.id != sender) {
                        participant.queue(message);
                    }
                }
                Route::Everyone => {
                    for participant in self.participants.values_mut() {
                        participant.queue(message);
                    }
                }
            }
        }
    }

    /// Sends every non-empty outbox; returns frames and bytes sent.
    pub fn flush_reliable(&mut self) -> (usize, usize) {
        self.participants
            .values_mut()
            .filter_map(Participant::flush)
            .fold((0, 0), |(frames, bytes), len| (frames + 1, bytes + len))
    }

    /// UDP addresses of everyone but `exclude`.
    pub fn udp_targets(&self, exclude: ParticipantId) -> Vec<(ParticipantId, SocketAddr)> {
        self.participants
            .values()
            .filter(|p| p.id != exclude)
            .filter_map(|p| p.udp_addr.map(|addr| (p.id, addr)))
            .collect()
    }

    /// Removes silent participants and returns their ids.
    pub fn check_timeouts(&mut self) -> Vec<ParticipantId> {
        let timed_out: Vec<ParticipantId> = self
            .participants
            .values()
            .filter(|p| p.is_timed_out(self.timeout))
            .map(|p| p.id)
            .collect();

        for id in &timed_out {
            warn!("Participant {} timed out", id);
            self.remove(*id);
        }

        timed_out
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
