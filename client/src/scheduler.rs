//! Per-tick packing of entity updates into one bounded unreliable packet.
//!
//! Updates arrive two ways: pollable entities are asked for their state once
//! per tick, and collaborators may push a ready payload at any time. Both
//! land in one pending set keyed by entity, where a push always wins over a
//! poll of the same entity. [`UpdateScheduler::flush`] ranks the pending set
//! by priority and greedily fills the packet:
//!
//! ```text
//! +-----+----------+-----+----------+-----+
//! | tag | payload  | tag | payload  | ... |   <= max_packet_bytes
//! +-----+----------+-----+----------+-----+
//! ```
//!
//! Whatever does not fit keeps its priority and competes again next tick.

use crate::directory::{Directory, RekeyObserver};
use crate::priority::PriorityPolicy;
use log::{debug, warn};
use shared::protocol::{tag, StateUpdate};
use shared::{EntityKey, Message, ParticipantId};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub key: EntityKey,
    pub tag: u8,
    pub priority: u32,
    pub payload: Vec<u8>,
}

impl PendingUpdate {
    fn wire_len(&self) -> usize {
        1 + self.payload.len()
    }
}

/// Counters from the most recent flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub sent: usize,
    pub deferred: usize,
    pub bytes: usize,
}

#[derive(Debug, Default)]
pub struct UpdateScheduler {
    pollables: HashSet<EntityKey>,
    pending: HashMap<EntityKey, PendingUpdate>,
    last_flush: FlushStats,
}

impl UpdateScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pollable(&mut self, key: EntityKey) {
        self.pollables.insert(key);
    }

    pub fn unregister_pollable(&mut self, key: EntityKey) {
        self.pollables.remove(&key);
    }

    pub fn is_pollable(&self, key: EntityKey) -> bool {
        self.pollables.contains(&key)
    }

    /// Drops everything queued for an entity that no longer exists.
    pub fn forget(&mut self, key: EntityKey) {
        self.pollables.remove(&key);
        self.pending.remove(&key);
    }

    /// Push mode: replaces anything already pending for `key`.
    pub fn enqueue(&mut self, key: EntityKey, tag: u8, priority: u32, payload: Vec<u8>) {
        self.pending.insert(
            key,
            PendingUpdate {
                key,
                tag,
                priority,
                payload,
            },
        );
    }

    /// Pull mode: asks every due pollable entity for its state.
    /// Returns how many entities produced an update.
    pub fn poll(
        &mut self,
        directory: &Directory,
        policy: &PriorityPolicy,
        local: ParticipantId,
    ) -> usize {
        let mut polled = 0;
        for &key in &self.pollables {
            let Some(entity) = directory.entity(key) else {
                continue;
            };
            if !policy.is_due(entity, local) {
                continue;
            }

            let state = match entity.body.serialize() {
                Ok(state) => state,
                Err(e) => {
                    warn!("Skipping {} this tick: {}", key, e);
                    continue;
                }
            };
            let message = Message::StateUpdate(StateUpdate {
                key,
                stamp: entity.stamp(),
                state,
            });
            let payload = match message.body() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Skipping {} this tick: {}", key, e);
                    continue;
                }
            };

            self.pending.entry(key).or_insert(PendingUpdate {
                key,
                tag: tag::STATE_UPDATE,
                priority: entity.priority,
                payload,
            });
            polled += 1;
        }
        polled
    }

    /// Packs pending updates, highest priority first, into at most
    /// `max_packet_bytes`. The first entry always goes out, even oversized.
    pub fn flush(&mut self, directory: &mut Directory, max_packet_bytes: usize) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            self.last_flush = FlushStats::default();
            return None;
        }

        let mut entries: Vec<PendingUpdate> = self.pending.drain().map(|(_, update)| update).collect();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.key.cmp(&b.key)));

        let mut packet = Vec::with_capacity(max_packet_bytes);
        let mut stats = FlushStats::default();
        let mut full = false;

        for entry in entries {
            if !full && (stats.sent == 0 || packet.len() + entry.wire_len() <= max_packet_bytes) {
                packet.push(entry.tag);
                packet.extend_from_slice(&entry.payload);
                stats.sent += 1;
                if let Some(entity) = directory.entity_mut(entry.key) {
                    entity.priority = 0;
                    entity.changed_since_send = false;
                }
            } else {
                full = true;
                stats.deferred += 1;
                if let Some(entity) = directory.entity_mut(entry.key) {
                    entity.priority = entity.priority.max(entry.priority);
                }
            }
        }

        stats.bytes = packet.len();
        if stats.deferred > 0 {
            debug!(
                "Packed {} updates ({} bytes), deferred {}",
                stats.sent, stats.bytes, stats.deferred
            );
        }
        self.last_flush = stats;
        Some(packet)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_flush(&self) -> FlushStats {
        self.last_flush
    }

    pub fn clear(&mut self) {
        self.pollables.clear();
        self.pending.clear();
        self.last_flush = FlushStats::default();
    }
}

impl RekeyObserver for UpdateScheduler {
    fn on_rekeyed(&mut self, old: EntityKey, new: EntityKey) {
        if self.pollables.remove(&old) {
            self.pollables.insert(new);
        }

        if let Some(mut update) = self.pending.remove(&old) {
            update.key = new;
            if update.tag == tag::STATE_UPDATE {
                let mut body = update.payload.as_slice();
                if let Ok(Message::StateUpdate(mut state)) = Message::read_body(tag::STATE_UPDATE, &mut body) {
                    state.key = new;
                    match Message::StateUpdate(state).body() {
                        Ok(payload) => update.payload = payload,
                        Err(e) => warn!("Dropping pending update for {}: {}", old, e),
                    }
                }
            }
            self.pending.insert(new, update);
        }
    }
}
