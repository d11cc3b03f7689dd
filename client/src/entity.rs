//! Replicated entities and the collaborator seam for their state.
//!
//! The replication core never looks inside an entity's state: physics,
//! rendering or scripting collaborators implement [`Replicable`] and hand
//! back opaque bytes.

use shared::{can_take_ownership, EntityKey, EntityKind, OwnershipStamp, ParticipantId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicableError {
    #[error("failed to serialize entity state: {0}")]
    Serialize(String),
    #[error("failed to apply remote state: {0}")]
    Apply(String),
}

/// State supplied by a collaborator (rigid body, material, script instance).
pub trait Replicable: Send {
    /// Current state as opaque bytes for the wire.
    fn serialize(&self) -> Result<Vec<u8>, ReplicableError>;

    /// Overwrites local state with bytes produced by a remote `serialize`.
    fn apply_remote(&mut self, state: &[u8]) -> Result<(), ReplicableError>;

    /// Reports local changes since the previous call and clears the flag.
    fn take_changed(&mut self) -> bool;

    /// Entities without a rigid body get periodic heartbeat sends even
    /// when unchanged.
    fn has_rigid_body(&self) -> bool {
        true
    }
}

/// Builds local state for entities created by other participants.
pub trait EntityFactory: Send {
    fn spawn(&mut self, kind: EntityKind, state: &[u8]) -> Result<Box<dyn Replicable>, ReplicableError>;
}

pub struct ReplicatedEntity {
    key: EntityKey,
    pub owner: ParticipantId,
    pub ownership_timestamp: u32,
    pub grabber: Option<ParticipantId>,
    /// Scheduler urgency; grows while unsent, reset to 0 when packed.
    pub priority: u32,
    /// Set by the priority policy when the collaborator reported a change.
    pub changed_since_send: bool,
    pub body: Box<dyn Replicable>,
    /// The stamp has been taken from the owner's own traffic at least once.
    owner_restamped: bool,
}

impl ReplicatedEntity {
    pub fn new(key: EntityKey, stamp: OwnershipStamp, body: Box<dyn Replicable>) -> Self {
        Self {
            key,
            owner: stamp.owner,
            ownership_timestamp: stamp.timestamp,
            grabber: None,
            priority: 0,
            changed_since_send: false,
            body,
            owner_restamped: false,
        }
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    /// Only the directory moves entities between keys.
    pub(crate) fn set_key(&mut self, key: EntityKey) {
        self.key = key;
    }

    pub fn stamp(&self) -> OwnershipStamp {
        OwnershipStamp::new(self.owner, self.ownership_timestamp)
    }

    pub fn set_stamp(&mut self, stamp: OwnershipStamp) {
        self.owner = stamp.owner;
        self.ownership_timestamp = stamp.timestamp;
    }

    /// Adopts a stamp carried by the owner's state traffic. The first one
    /// replaces whatever the entity was spawned with; after that a stamp
    /// may only move forward. Returns whether it was adopted.
    pub fn restamp_from_owner(&mut self, stamp: OwnershipStamp) -> bool {
        let current = self.stamp();
        if self.owner_restamped && stamp != current && !can_take_ownership(&stamp, &current) {
            return false;
        }
        self.owner_restamped = true;
        self.set_stamp(stamp);
        true
    }

    pub fn is_owned_by(&self, participant: ParticipantId) -> bool {
        self.owner == participant
    }
}

impl std::fmt::Debug for ReplicatedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedEntity")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("ownership_timestamp", &self.ownership_timestamp)
            .field("grabber", &self.grabber)
            .field("priority", &self.priority)
            .finish()
    }
}
