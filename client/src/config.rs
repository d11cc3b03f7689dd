use crate::ownership::ArbitrationConfig;
use crate::priority::PriorityPolicy;
use shared::DEFAULT_MAX_PACKET_BYTES;
use std::time::Duration;

/// Tunables for one replication session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound for one packed unreliable packet.
    pub max_packet_bytes: usize,
    /// Inbound physical messages handled per tick; the rest wait.
    pub max_inbound_per_tick: usize,
    /// Capacity of the queue between the I/O tasks and the tick loop.
    pub inbound_capacity: usize,
    pub ping_interval: Duration,
    pub policy: PriorityPolicy,
    pub arbitration: ArbitrationConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
            max_inbound_per_tick: 256,
            inbound_capacity: 1024,
            ping_interval: Duration::from_secs(1),
            policy: PriorityPolicy::default(),
            arbitration: ArbitrationConfig::default(),
        }
    }
}
