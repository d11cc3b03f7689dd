//! Identifier types shared by client and server.
//!
//! Temporary and canonical entity ids share one 16-bit wire field. Values
//! below [`CANONICAL_ID_BASE`] belong to the temporary namespace of the
//! participant that created the entity; the server only ever hands out
//! canonical ids at or above the base.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a connected participant. The server itself is participant 0.
pub type ParticipantId = u32;

/// Owner assigned to entities nobody has claimed yet (or whose owner left).
pub const SERVER_PARTICIPANT: ParticipantId = 0;

/// Number of temporary id slots per entity kind.
pub const TEMPORARY_ID_SLOTS: u16 = 256;

/// First id the server may issue as a canonical id.
pub const CANONICAL_ID_BASE: u16 = TEMPORARY_ID_SLOTS;

/// Each kind has its own temporary id namespace and its own canonical ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Object,
    Material,
    Script,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Object, EntityKind::Material, EntityKind::Script];

    pub fn index(self) -> usize {
        match self {
            EntityKind::Object => 0,
            EntityKind::Material => 1,
            EntityKind::Script => 2,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Object => "object",
            EntityKind::Material => "material",
            EntityKind::Script => "script",
        };
        f.write_str(name)
    }
}

/// An entity id as seen locally: either still provisional or server-issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum EntityId {
    Temporary(u16),
    Canonical(u16),
}

impl EntityId {
    /// Value written into the shared 16-bit wire field.
    pub fn wire(self) -> u16 {
        match self {
            EntityId::Temporary(id) | EntityId::Canonical(id) => id,
        }
    }

    /// Classifies a wire value by namespace.
    pub fn from_wire(value: u16) -> Self {
        if value < CANONICAL_ID_BASE {
            EntityId::Temporary(value)
        } else {
            EntityId::Canonical(value)
        }
    }

    pub fn is_temporary(self) -> bool {
        matches!(self, EntityId::Temporary(_))
    }
}

impl From<u16> for EntityId {
    fn from(value: u16) -> Self {
        EntityId::from_wire(value)
    }
}

impl From<EntityId> for u16 {
    fn from(id: EntityId) -> Self {
        id.wire()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Temporary(id) => write!(f, "tmp#{}", id),
            EntityId::Canonical(id) => write!(f, "#{}", id),
        }
    }
}

/// Fully qualified entity reference: the id alone is ambiguous across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: EntityId) -> Self {
        Self { kind, id }
    }

    pub fn temporary(kind: EntityKind, id: u16) -> Self {
        Self::new(kind, EntityId::Temporary(id))
    }

    pub fn canonical(kind: EntityKind, id: u16) -> Self {
        Self::new(kind, EntityId::Canonical(id))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}
