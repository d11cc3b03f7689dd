//! Last known grabber per entity, kept even while the entity only has a
//! temporary id.

use crate::directory::RekeyObserver;
use shared::{EntityKey, ParticipantId};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct GrabCache {
    grabbers: HashMap<EntityKey, ParticipantId>,
}

impl GrabCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` clears the entry.
    pub fn record(&mut self, key: EntityKey, grabber: Option<ParticipantId>) {
        match grabber {
            Some(participant) => {
                self.grabbers.insert(key, participant);
            }
            None => {
                self.grabbers.remove(&key);
            }
        }
    }

    pub fn grabber(&self, key: EntityKey) -> Option<ParticipantId> {
        self.grabbers.get(&key).copied()
    }

    pub fn remove(&mut self, key: EntityKey) -> Option<ParticipantId> {
        self.grabbers.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.grabbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grabbers.is_empty()
    }

    pub fn clear(&mut self) {
        self.grabbers.clear();
    }
}

impl RekeyObserver for GrabCache {
    fn on_rekeyed(&mut self, old: EntityKey, new: EntityKey) {
        if let Some(grabber) = self.grabbers.remove(&old) {
            self.grabbers.insert(new, grabber);
        }
    }
}
