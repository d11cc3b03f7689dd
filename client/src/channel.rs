//! The seam between the tick loop and whatever moves bytes.
//!
//! Outbound sends are non-blocking hand-offs; inbound traffic is parked in a
//! bounded queue by the I/O tasks and drained by the session once per tick.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("transport is closed")]
    Closed,
}

pub trait Channel {
    /// Ordered, exactly-once delivery.
    fn send_reliable(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError>;

    /// May be dropped or reordered.
    fn send_unreliable(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Reliable,
    Unreliable,
}

/// One physical inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub delivery: Delivery,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Reliable(Vec<u8>),
    Unreliable(Vec<u8>),
}

/// Hands outbound bytes to the transport's writer task.
#[derive(Debug, Clone)]
pub struct QueuedChannel {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl QueuedChannel {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }
}

impl Channel for QueuedChannel {
    fn send_reliable(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        self.tx
            .send(Outbound::Reliable(bytes))
            .map_err(|_| ChannelError::Closed)
    }

    fn send_unreliable(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        self.tx
            .send(Outbound::Unreliable(bytes))
            .map_err(|_| ChannelError::Closed)
    }
}

/// Records every send; used by tests and offline tools.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    pub reliable: Vec<Vec<u8>>,
    pub unreliable: Vec<Vec<u8>>,
    pub closed: bool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Channel for MemoryChannel {
    fn send_reliable(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.reliable.push(bytes);
        Ok(())
    }

    fn send_unreliable(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.unreliable.push(bytes);
        Ok(())
    }
}

/// Producer half of the inbound queue, held by the I/O tasks.
pub type InboundSender = mpsc::Sender<Inbound>;

pub fn inbound_queue(capacity: usize) -> (InboundSender, InboundQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        tx,
        InboundQueue {
            rx,
            closed: false,
        },
    )
}

/// Consumer half, drained by the tick loop without blocking.
#[derive(Debug)]
pub struct InboundQueue {
    rx: mpsc::Receiver<Inbound>,
    closed: bool,
}

impl InboundQueue {
    /// Takes at most `max` queued messages.
    pub fn drain(&mut self, max: usize) -> Vec<Inbound> {
        let mut drained = Vec::new();
        while drained.len() < max {
            match self.rx.try_recv() {
                Ok(inbound) => drained.push(inbound),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        drained
    }

    /// Empties the queue and stops accepting new messages.
    pub fn discard_all(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        self.closed = true;
        discarded
    }

    /// All producers are gone.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
