//! Replicated entity directory: the single owner of the id → entity map.
//!
//! Entities are stored once under a stable [`EntityHandle`]; two index maps
//! resolve temporary and canonical ids to that handle in O(1). Moving an
//! entity from its temporary to its canonical id goes through [`Directory::rekey`],
//! which lets every [`RekeyObserver`] migrate its own keys before the
//! temporary mapping disappears.

use crate::entity::ReplicatedEntity;
use log::debug;
use shared::{EntityId, EntityKey, EntityKind};
use std::collections::HashMap;
use thiserror::Error;

/// Anything outside the directory that keys data by entity.
pub trait RekeyObserver {
    fn on_rekeyed(&mut self, old: EntityKey, new: EntityKey);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle(u32);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("entity {0} is already registered")]
    Duplicate(EntityKey),
    #[error("no entity registered under temporary id {kind} {id}")]
    UnknownTemporary { kind: EntityKind, id: u16 },
    #[error("canonical id {kind} {id} is already taken")]
    CanonicalTaken { kind: EntityKind, id: u16 },
}

#[derive(Default)]
pub struct Directory {
    entities: HashMap<EntityHandle, ReplicatedEntity>,
    by_temporary: HashMap<(EntityKind, u16), EntityHandle>,
    by_canonical: HashMap<(EntityKind, u16), EntityHandle>,
    next_handle: u32,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: ReplicatedEntity) -> Result<EntityHandle, DirectoryError> {
        let key = entity.key();
        if self.resolve(key).is_some() {
            return Err(DirectoryError::Duplicate(key));
        }

        let handle = EntityHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);

        self.index_mut(key.id).insert((key.kind, key.id.wire()), handle);
        self.entities.insert(handle, entity);
        debug!("Directory: registered {}", key);
        Ok(handle)
    }

    pub fn remove(&mut self, key: EntityKey) -> Option<ReplicatedEntity> {
        let handle = self.index_mut(key.id).remove(&(key.kind, key.id.wire()))?;
        let entity = self.entities.remove(&handle);
        if entity.is_some() {
            debug!("Directory: removed {}", key);
        }
        entity
    }

    pub fn lookup_by_canonical(&self, kind: EntityKind, id: u16) -> Option<EntityHandle> {
        self.by_canonical.get(&(kind, id)).copied()
    }

    pub fn lookup_by_temporary(&self, kind: EntityKind, id: u16) -> Option<EntityHandle> {
        self.by_temporary.get(&(kind, id)).copied()
    }

    pub fn resolve(&self, key: EntityKey) -> Option<EntityHandle> {
        match key.id {
            EntityId::Temporary(id) => self.lookup_by_temporary(key.kind, id),
            EntityId::Canonical(id) => self.lookup_by_canonical(key.kind, id),
        }
    }

    pub fn get(&self, handle: EntityHandle) -> Option<&ReplicatedEntity> {
        self.entities.get(&handle)
    }

    pub fn get_mut(&mut self, handle: EntityHandle) -> Option<&mut ReplicatedEntity> {
        self.entities.get_mut(&handle)
    }

    pub fn entity(&self, key: EntityKey) -> Option<&ReplicatedEntity> {
        self.resolve(key).and_then(|handle| self.entities.get(&handle))
    }

    pub fn entity_mut(&mut self, key: EntityKey) -> Option<&mut ReplicatedEntity> {
        let handle = self.resolve(key)?;
        self.entities.get_mut(&handle)
    }

    /// Moves the entity at `Temporary(temp)` to `Canonical(canonical)`.
    ///
    /// Observers run first, while the temporary key is still resolvable.
    pub fn rekey(
        &mut self,
        kind: EntityKind,
        temp: u16,
        canonical: u16,
        observers: &mut [&mut dyn RekeyObserver],
    ) -> Result<EntityHandle, DirectoryError> {
        let handle = self
            .lookup_by_temporary(kind, temp)
            .ok_or(DirectoryError::UnknownTemporary { kind, id: temp })?;
        if self.by_canonical.contains_key(&(kind, canonical)) {
            return Err(DirectoryError::CanonicalTaken { kind, id: canonical });
        }

        let old = EntityKey::temporary(kind, temp);
        let new = EntityKey::canonical(kind, canonical);
        notify(observers, old, new);

        self.by_temporary.remove(&(kind, temp));
        self.by_canonical.insert((kind, canonical), handle);
        if let Some(entity) = self.entities.get_mut(&handle) {
            entity.set_key(new);
        }
        debug!("Directory: rekeyed {} -> {}", old, new);
        Ok(handle)
    }

    /// Drops the provisional entity at `old` and points every observer at
    /// `replacement` instead.
    pub fn retire(
        &mut self,
        old: EntityKey,
        replacement: EntityKey,
        observers: &mut [&mut dyn RekeyObserver],
    ) -> Option<ReplicatedEntity> {
        notify(observers, old, replacement);
        self.remove(old)
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        self.entities.values().map(|entity| entity.key()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicatedEntity> {
        self.entities.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ReplicatedEntity> {
        self.entities.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.by_temporary.clear();
        self.by_canonical.clear();
    }

    fn index_mut(&mut self, id: EntityId) -> &mut HashMap<(EntityKind, u16), EntityHandle> {
        match id {
            EntityId::Temporary(_) => &mut self.by_temporary,
            EntityId::Canonical(_) => &mut self.by_canonical,
        }
    }
}

fn notify(observers: &mut [&mut dyn RekeyObserver], old: EntityKey, new: EntityKey) {
    for observer in observers.iter_mut() {
        observer.on_rekeyed(old, new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::test_support::TestBody;
    use shared::OwnershipStamp;

    fn entity(key: EntityKey) -> ReplicatedEntity {
        ReplicatedEntity::new(key, OwnershipStamp::new(1, 0), TestBody::sized(4))
    }

    /// Records what it saw and whether the old key still resolved then.
    struct Probe {
        seen: Vec<(EntityKey, EntityKey)>,
    }

    impl RekeyObserver for Probe {
        fn on_rekeyed(&mut self, old: EntityKey, new: EntityKey) {
            self.seen.push((old, new));
        }
    }

    #[test]
    fn test_insert_and_lookup_both_namespaces() {
        let mut directory = Directory::new();
        let temp = directory
            .insert(entity(EntityKey::temporary(EntityKind::Object, 7)))
            .unwrap();
        let canon = directory
            .insert(entity(EntityKey::canonical(EntityKind::Object, 300)))
            .unwrap();

        assert_eq!(directory.lookup_by_temporary(EntityKind::Object, 7), Some(temp));
        assert_eq!(directory.lookup_by_canonical(EntityKind::Object, 300), Some(canon));
        assert_eq!(directory.lookup_by_canonical(EntityKind::Object, 7), None);
        assert_eq!(directory.lookup_by_temporary(EntityKind::Material, 7), None);
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let mut directory = Directory::new();
        let key = EntityKey::canonical(EntityKind::Script, 400);
        directory.insert(entity(key)).unwrap();
        assert_eq!(
            directory.insert(entity(key)).unwrap_err(),
            DirectoryError::Duplicate(key)
        );
    }

    #[test]
    fn test_rekey_moves_entity_and_notifies_observers() {
        let mut directory = Directory::new();
        let handle = directory
            .insert(entity(EntityKey::temporary(EntityKind::Object, 7)))
            .unwrap();
        let mut probe = Probe { seen: Vec::new() };

        let rekeyed = directory
            .rekey(EntityKind::Object, 7, 4021, &mut [&mut probe])
            .unwrap();

        assert_eq!(rekeyed, handle);
        assert_eq!(directory.lookup_by_temporary(EntityKind::Object, 7), None);
        assert_eq!(directory.lookup_by_canonical(EntityKind::Object, 4021), Some(handle));
        assert_eq!(
            directory.get(handle).unwrap().key(),
            EntityKey::canonical(EntityKind::Object, 4021)
        );
        assert_eq!(
            probe.seen,
            vec![(
                EntityKey::temporary(EntityKind::Object, 7),
                EntityKey::canonical(EntityKind::Object, 4021)
            )]
        );
    }

    #[test]
    fn test_rekey_unknown_temporary_fails() {
        let mut directory = Directory::new();
        let result = directory.rekey(EntityKind::Material, 3, 500, &mut []);
        assert_eq!(
            result.unwrap_err(),
            DirectoryError::UnknownTemporary {
                kind: EntityKind::Material,
                id: 3
            }
        );
    }

    #[test]
    fn test_rekey_onto_taken_canonical_fails_without_notifying() {
        let mut directory = Directory::new();
        directory
            .insert(entity(EntityKey::temporary(EntityKind::Object, 1)))
            .unwrap();
        directory
            .insert(entity(EntityKey::canonical(EntityKind::Object, 900)))
            .unwrap();
        let mut probe = Probe { seen: Vec::new() };

        let result = directory.rekey(EntityKind::Object, 1, 900, &mut [&mut probe]);

        assert!(matches!(result, Err(DirectoryError::CanonicalTaken { .. })));
        assert!(probe.seen.is_empty());
        assert!(directory.lookup_by_temporary(EntityKind::Object, 1).is_some());
    }

    #[test]
    fn test_retire_removes_and_redirects() {
        let mut directory = Directory::new();
        let old = EntityKey::temporary(EntityKind::Material, 2);
        let winner = EntityKey::canonical(EntityKind::Material, 777);
        directory.insert(entity(old)).unwrap();
        let mut probe = Probe { seen: Vec::new() };

        let removed = directory.retire(old, winner, &mut [&mut probe]);

        assert!(removed.is_some());
        assert!(directory.is_empty());
        assert_eq!(probe.seen, vec![(old, winner)]);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut directory = Directory::new();
        let key = EntityKey::canonical(EntityKind::Object, 256);
        directory.insert(entity(key)).unwrap();
        assert!(directory.remove(key).is_some());
        assert!(directory.remove(key).is_none());

        directory.insert(entity(key)).unwrap();
        directory.clear();
        assert!(directory.entity(key).is_none());
        assert!(directory.is_empty());
    }
}
