//! How entity urgency grows from tick to tick. The scheduler only ranks by
//! the resulting numbers; every threshold lives here.

use crate::entity::ReplicatedEntity;
use shared::ParticipantId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityPolicy {
    /// Added every tick while a locally owned entity has unsent changes.
    pub per_tick_increment: u32,
    pub collision_boost: u32,
    pub grab_boost: u32,
    /// Changed entities are considered once their priority reaches this.
    pub min_priority_to_send: u32,
    /// Heartbeat floor for unchanged entities without a rigid body.
    pub min_priority_for_unchanged: u32,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            per_tick_increment: 1,
            collision_boost: 100,
            grab_boost: 200,
            min_priority_to_send: 1,
            min_priority_for_unchanged: 60,
        }
    }
}

impl PriorityPolicy {
    /// Once-per-tick bookkeeping for one entity.
    pub fn advance(&self, entity: &mut ReplicatedEntity, local: ParticipantId) {
        if !entity.is_owned_by(local) {
            return;
        }
        if entity.body.take_changed() {
            entity.changed_since_send = true;
        }
        if entity.changed_since_send || !entity.body.has_rigid_body() {
            entity.priority = entity.priority.saturating_add(self.per_tick_increment);
        }
    }

    pub fn boost_collision(&self, entity: &mut ReplicatedEntity) {
        self.boost(entity, self.collision_boost);
    }

    pub fn boost_grab(&self, entity: &mut ReplicatedEntity) {
        self.boost(entity, self.grab_boost);
    }

    fn boost(&self, entity: &mut ReplicatedEntity, amount: u32) {
        entity.priority = entity.priority.saturating_add(amount);
        entity.changed_since_send = true;
    }

    /// Whether the entity should be offered to the scheduler this tick.
    /// Entities still on a temporary id travel inside their create message.
    pub fn is_due(&self, entity: &ReplicatedEntity, local: ParticipantId) -> bool {
        if !entity.is_owned_by(local) || entity.key().id.is_temporary() {
            return false;
        }
        if entity.changed_since_send {
            entity.priority >= self.min_priority_to_send
        } else if !entity.body.has_rigid_body() {
            entity.priority >= self.min_priority_for_unchanged
        } else {
            false
        }
    }
}
