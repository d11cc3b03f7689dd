//! Authoritative entity table.
//!
//! Issues canonical ids, detects redundant creations and arbitrates
//! ownership claims with the same tie-break the participants use.

use log::{debug, info, warn};
use shared::protocol::{CreateEntity, EntitySpawned, StateUpdate};
use shared::{
    can_take_ownership, EntityKey, EntityKind, OwnershipStamp, ParticipantId, CANONICAL_ID_BASE,
    SERVER_PARTICIPANT,
};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("canonical {kind} ids exhausted")]
    IdsExhausted { kind: EntityKind },
    #[error("unknown entity {0}")]
    UnknownEntity(EntityKey),
    #[error("{0} is not a canonical key")]
    NotCanonical(EntityKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub key: EntityKey,
    pub stamp: OwnershipStamp,
    pub grabber: Option<ParticipantId>,
    pub state: Vec<u8>,
    pub creator: ParticipantId,
    dedupe_key: Option<String>,
}

impl EntityRecord {
    pub fn spawn_message(&self) -> EntitySpawned {
        EntitySpawned {
            key: self.key,
            stamp: self.stamp,
            grabber: self.grabber,
            state: self.state.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(EntityKey),
    /// An entity with the same dedupe key already exists.
    Redundant { winner: EntityKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Accepted(OwnershipStamp),
    /// The claim lost; carries the stamp that stands.
    Rejected(OwnershipStamp),
}

/// Ownership or grab changes caused by a participant leaving.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Departure {
    pub released: Vec<(EntityKey, OwnershipStamp)>,
    pub ungrabbed: Vec<EntityKey>,
}

#[derive(Debug)]
pub struct EntityRegistry {
    // ordered so snapshots and departures come out deterministically
    records: BTreeMap<EntityKey, EntityRecord>,
    dedupe: HashMap<(EntityKind, String), EntityKey>,
    next_ids: [u16; 3],
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            dedupe: HashMap::new(),
            next_ids: [CANONICAL_ID_BASE; 3],
        }
    }
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        creator: ParticipantId,
        request: CreateEntity,
        now_ms: u32,
    ) -> Result<CreateOutcome, RegistryError> {
        let CreateEntity {
            kind,
            temp_id,
            dedupe_key,
            state,
        } = request;

        if let Some(name) = &dedupe_key {
            if let Some(winner) = self.dedupe.get(&(kind, name.clone())) {
                debug!(
                    "Participant {} tmp#{} duplicates {} ({})",
                    creator, temp_id, winner, name
                );
                return Ok(CreateOutcome::Redundant { winner: *winner });
            }
        }

        let next = &mut self.next_ids[kind.index()];
        let id = *next;
        *next = next
            .checked_add(1)
            .ok_or(RegistryError::IdsExhausted { kind })?;
        let key = EntityKey::canonical(kind, id);

        if let Some(name) = &dedupe_key {
            self.dedupe.insert((kind, name.clone()), key);
        }
        self.records.insert(
            key,
            EntityRecord {
                key,
                stamp: OwnershipStamp::new(creator, now_ms),
                grabber: None,
                state,
                creator,
                dedupe_key,
            },
        );
        info!("Participant {} created {} (tmp#{})", creator, key, temp_id);
        Ok(CreateOutcome::Created(key))
    }

    pub fn remove(&mut self, key: EntityKey) -> Result<EntityRecord, RegistryError> {
        let record = self
            .records
            .remove(&key)
            .ok_or(RegistryError::UnknownEntity(key))?;
        if let Some(name) = &record.dedupe_key {
            self.dedupe.remove(&(key.kind, name.clone()));
        }
        debug!("Removed {}", key);
        Ok(record)
    }

    /// Decides an ownership claim by `claimant`.
    ///
    /// The current owner, the grabber and anyone claiming a server-owned
    /// entity always win. A claim against someone else's grab always loses.
    /// Everything else goes to the shared tie-break.
    pub fn claim(
        &mut self,
        claimant: ParticipantId,
        key: EntityKey,
        stamp: OwnershipStamp,
    ) -> Result<ClaimOutcome, RegistryError> {
        if key.id.is_temporary() {
            return Err(RegistryError::NotCanonical(key));
        }
        let record = self
            .records
            .get_mut(&key)
            .ok_or(RegistryError::UnknownEntity(key))?;

        let current = record.stamp;
        let accept = if stamp.owner != claimant {
            warn!(
                "Participant {} claimed {} on behalf of {}",
                claimant, key, stamp.owner
            );
            false
        } else if current.owner == claimant || record.grabber == Some(claimant) {
            true
        } else if record.grabber.is_some() {
            false
        } else if current.owner == SERVER_PARTICIPANT {
            true
        } else {
            can_take_ownership(&stamp, &current)
        };

        if accept {
            record.stamp = stamp;
            debug!("{} now owned by {} at {}", key, stamp.owner, stamp.timestamp);
            Ok(ClaimOutcome::Accepted(stamp))
        } else {
            debug!(
                "Rejected claim on {} by {}; {} keeps it",
                key, claimant, current.owner
            );
            Ok(ClaimOutcome::Rejected(current))
        }
    }

    /// Stores state sent by the current owner; anything else is dropped.
    pub fn accept_state(&mut self, sender: ParticipantId, update: &StateUpdate) -> bool {
        let Some(record) = self.records.get_mut(&update.key) else {
            return false;
        };
        if record.stamp.owner != sender || update.stamp.owner != sender {
            return false;
        }
        record.stamp = update.stamp;
        record.state.clone_from(&update.state);
        true
    }

    /// Only the grabber may release; a grab can't be taken from someone else.
    pub fn set_grab(
        &mut self,
        participant: ParticipantId,
        key: EntityKey,
        grabber: Option<ParticipantId>,
    ) -> Result<bool, RegistryError> {
        let record = self
            .records
            .get_mut(&key)
            .ok_or(RegistryError::UnknownEntity(key))?;
        let allowed = match grabber {
            Some(who) => who == participant && record.grabber.map_or(true, |g| g == participant),
            None => record.grabber == Some(participant),
        };
        if allowed && record.grabber != grabber {
            record.grabber = grabber;
            return Ok(true);
        }
        Ok(false)
    }

    /// Hands everything `participant` owned to the server.
    pub fn release_participant(&mut self, participant: ParticipantId, now_ms: u32) -> Departure {
        let mut departure = Departure::default();
        for record in self.records.values_mut() {
            if record.stamp.owner == participant {
                record.stamp = OwnershipStamp::new(SERVER_PARTICIPANT, now_ms);
                departure.released.push((record.key, record.stamp));
            }
            if record.grabber == Some(participant) {
                record.grabber = None;
                departure.ungrabbed.push(record.key);
            }
        }
        if !departure.released.is_empty() {
            info!(
                "Released {} entities held by participant {}",
                departure.released.len(),
                participant
            );
        }
        departure
    }

    /// Spawn messages for everything, for a participant that just joined.
    pub fn snapshot(&self) -> Vec<EntitySpawned> {
        self.records.values().map(EntityRecord::spawn_message).collect()
    }

    pub fn get(&self, key: EntityKey) -> Option<&EntityRecord> {
        self.records.get(&key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
