//! Temporary identifiers for locally created entities and their
//! reconciliation with server-issued canonical ids.

use crate::directory::{Directory, DirectoryError, EntityHandle, RekeyObserver};
use log::{debug, warn};
use shared::{EntityKey, EntityKind, TEMPORARY_ID_SLOTS};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("all {} temporary {kind} ids are in flight", TEMPORARY_ID_SLOTS)]
    PoolExhausted { kind: EntityKind },
}

/// Slots `0..TEMPORARY_ID_SLOTS` for one entity kind.
#[derive(Debug, Default)]
pub struct IdentifierPool {
    outstanding: HashSet<u16>,
    cursor: u16,
}

impl IdentifierPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans forward from the cursor for a free slot.
    pub fn allocate(&mut self) -> Option<u16> {
        for offset in 0..TEMPORARY_ID_SLOTS {
            let slot = (self.cursor + offset) % TEMPORARY_ID_SLOTS;
            if self.outstanding.insert(slot) {
                self.cursor = (slot + 1) % TEMPORARY_ID_SLOTS;
                return Some(slot);
            }
        }
        None
    }

    pub fn release(&mut self, slot: u16) -> bool {
        self.outstanding.remove(&slot)
    }

    pub fn is_outstanding(&self, slot: u16) -> bool {
        self.outstanding.contains(&slot)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn reset(&mut self) {
        self.outstanding.clear();
        self.cursor = 0;
    }
}

/// What a confirmation or redundancy notice did to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The entity now lives under its canonical key.
    Rekeyed(EntityHandle),
    /// The provisional entity was dropped in favour of another canonical key.
    Redirected { winner: EntityKey },
    /// The slot was freed but the entity had already been removed locally.
    Orphaned { canonical: EntityKey },
    /// The temporary id was not in flight; nothing changed.
    Stale,
}

#[derive(Debug, Default)]
pub struct IdentifierAllocator {
    pools: [IdentifierPool; 3],
}

impl IdentifierAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, kind: EntityKind) -> Result<u16, IdError> {
        let slot = self.pools[kind.index()]
            .allocate()
            .ok_or(IdError::PoolExhausted { kind })?;
        debug!("Allocated temporary {} id {}", kind, slot);
        Ok(slot)
    }

    /// Gives back a slot whose entity never reached the server.
    pub fn release(&mut self, kind: EntityKind, slot: u16) -> bool {
        self.pools[kind.index()].release(slot)
    }

    pub fn pool(&self, kind: EntityKind) -> &IdentifierPool {
        &self.pools[kind.index()]
    }

    /// The server accepted our entity under `canonical`.
    pub fn confirm(
        &mut self,
        kind: EntityKind,
        temp: u16,
        canonical: u16,
        directory: &mut Directory,
        observers: &mut [&mut dyn RekeyObserver],
    ) -> Reconciliation {
        if !self.pools[kind.index()].release(temp) {
            warn!(
                "Ignoring confirmation of {} tmp#{} -> #{}: id not in flight",
                kind, temp, canonical
            );
            return Reconciliation::Stale;
        }

        let canonical_key = EntityKey::canonical(kind, canonical);
        match directory.rekey(kind, temp, canonical, observers) {
            Ok(handle) => Reconciliation::Rekeyed(handle),
            Err(DirectoryError::UnknownTemporary { .. }) => {
                debug!(
                    "Confirmed {} tmp#{} after local removal, canonical #{}",
                    kind, temp, canonical
                );
                Reconciliation::Orphaned {
                    canonical: canonical_key,
                }
            }
            Err(e) => {
                warn!("{}; folding tmp#{} into the existing entity", e, temp);
                directory.retire(EntityKey::temporary(kind, temp), canonical_key, observers);
                Reconciliation::Redirected {
                    winner: canonical_key,
                }
            }
        }
    }

    /// Another participant's entity won; ours is discarded and every
    /// reference is pointed at `winner`.
    pub fn reject_redundant(
        &mut self,
        kind: EntityKind,
        temp: u16,
        winner: u16,
        directory: &mut Directory,
        observers: &mut [&mut dyn RekeyObserver],
    ) -> Reconciliation {
        if !self.pools[kind.index()].release(temp) {
            warn!(
                "Ignoring redundancy notice for {} tmp#{}: id not in flight",
                kind, temp
            );
            return Reconciliation::Stale;
        }

        let winner_key = EntityKey::canonical(kind, winner);
        match directory.retire(EntityKey::temporary(kind, temp), winner_key, observers) {
            Some(_) => Reconciliation::Redirected { winner: winner_key },
            None => Reconciliation::Orphaned {
                canonical: winner_key,
            },
        }
    }

    pub fn reset(&mut self) {
        for pool in &mut self.pools {
            pool.reset();
        }
    }
}
