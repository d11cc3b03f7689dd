//! A tiny stand-in for a physics collaborator, used by the headless client.
//!
//! Each body is a point with a velocity that decays to rest. The simulation
//! owns the motion; the replication layer holds a handle to it and sees only
//! the bincode bytes.

use crate::entity::{EntityFactory, Replicable, ReplicableError};
use serde::{Deserialize, Serialize};
use shared::{EntityKey, EntityKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Fraction of velocity kept per second.
pub const DAMPING_PER_SECOND: f32 = 0.25;

/// Speeds below this snap to rest.
pub const REST_SPEED: f32 = 0.01;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Motion {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
}

impl Motion {
    pub fn at(position: [f32; 3]) -> Self {
        Self {
            position,
            velocity: [0.0; 3],
        }
    }

    pub fn is_resting(&self) -> bool {
        self.velocity.iter().all(|v| *v == 0.0)
    }

    pub fn bump(&mut self, impulse: [f32; 3]) {
        for (v, dv) in self.velocity.iter_mut().zip(impulse) {
            *v += dv;
        }
    }

    /// Integrates one step; returns whether the body moved.
    pub fn step(&mut self, dt: f32) -> bool {
        if self.is_resting() {
            return false;
        }
        let keep = DAMPING_PER_SECOND.powf(dt);
        for axis in 0..3 {
            self.position[axis] += self.velocity[axis] * dt;
            self.velocity[axis] *= keep;
        }
        let speed = self.velocity.iter().map(|v| v * v).sum::<f32>().sqrt();
        if speed < REST_SPEED {
            self.velocity = [0.0; 3];
        }
        true
    }
}

pub type MotionHandle = Arc<Mutex<Motion>>;

/// Replicable view of one simulated body.
pub struct DemoBody {
    motion: MotionHandle,
    last_seen: Option<Motion>,
}

impl DemoBody {
    pub fn new(motion: MotionHandle) -> Self {
        Self {
            motion,
            last_seen: None,
        }
    }

    fn read(&self) -> Result<Motion, ReplicableError> {
        self.motion
            .lock()
            .map(|motion| *motion)
            .map_err(|_| ReplicableError::Serialize("motion lock poisoned".to_string()))
    }
}

impl Replicable for DemoBody {
    fn serialize(&self) -> Result<Vec<u8>, ReplicableError> {
        let motion = self.read()?;
        bincode::serialize(&motion).map_err(|e| ReplicableError::Serialize(e.to_string()))
    }

    fn apply_remote(&mut self, state: &[u8]) -> Result<(), ReplicableError> {
        let remote: Motion =
            bincode::deserialize(state).map_err(|e| ReplicableError::Apply(e.to_string()))?;
        let mut motion = self
            .motion
            .lock()
            .map_err(|_| ReplicableError::Apply("motion lock poisoned".to_string()))?;
        *motion = remote;
        // remote state is not a local change
        self.last_seen = Some(remote);
        Ok(())
    }

    fn take_changed(&mut self) -> bool {
        let Ok(current) = self.read() else {
            return false;
        };
        let changed = self.last_seen != Some(current);
        self.last_seen = Some(current);
        changed
    }
}

/// Spawns remote bodies at the position they were created with.
#[derive(Debug, Default)]
pub struct DemoFactory;

impl EntityFactory for DemoFactory {
    fn spawn(&mut self, _kind: EntityKind, state: &[u8]) -> Result<Box<dyn Replicable>, ReplicableError> {
        let motion: Motion = if state.is_empty() {
            Motion::default()
        } else {
            bincode::deserialize(state).map_err(|e| ReplicableError::Apply(e.to_string()))?
        };
        Ok(Box::new(DemoBody::new(Arc::new(Mutex::new(motion)))))
    }
}

/// The bodies this client simulates itself.
#[derive(Debug, Default)]
pub struct DemoWorld {
    bodies: HashMap<EntityKey, MotionHandle>,
}

impl DemoWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new body and the replicable view the session will own.
    pub fn create(position: [f32; 3]) -> (MotionHandle, Box<dyn Replicable>) {
        let handle = Arc::new(Mutex::new(Motion::at(position)));
        let body = Box::new(DemoBody::new(Arc::clone(&handle)));
        (handle, body)
    }

    pub fn track(&mut self, key: EntityKey, handle: MotionHandle) {
        self.bodies.insert(key, handle);
    }

    pub fn rekey(&mut self, old: EntityKey, new: EntityKey) {
        if let Some(handle) = self.bodies.remove(&old) {
            self.bodies.insert(new, handle);
        }
    }

    pub fn remove(&mut self, key: EntityKey) {
        self.bodies.remove(&key);
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        self.bodies.keys().copied().collect()
    }

    pub fn bump(&self, key: EntityKey, impulse: [f32; 3]) -> bool {
        match self.bodies.get(&key).map(|handle| handle.lock()) {
            Some(Ok(mut motion)) => {
                motion.bump(impulse);
                true
            }
            _ => false,
        }
    }

    /// Steps every body; returns how many moved.
    pub fn step(&self, dt: f32) -> usize {
        self.bodies
            .values()
            .filter_map(|handle| handle.lock().ok())
            .map(|mut motion| motion.step(dt))
            .filter(|moved| *moved)
            .count()
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_motion_decays_to_rest() {
        let mut motion = Motion::at([0.0; 3]);
        motion.bump([1.0, 0.0, 0.0]);

        assert!(motion.step(0.5));
        assert_approx_eq!(motion.position[0], 0.5);
        assert_approx_eq!(motion.velocity[0], 0.5);

        for _ in 0..200 {
            motion.step(0.1);
        }
        assert!(motion.is_resting());
        assert!(!motion.step(0.1));
    }

    #[test]
    fn test_body_reports_local_changes_only() {
        let (handle, mut body) = DemoWorld::create([1.0, 2.0, 3.0]);
        assert!(body.take_changed());
        assert!(!body.take_changed());

        handle.lock().unwrap().bump([0.0, 1.0, 0.0]);
        assert!(body.take_changed());

        let remote = bincode::serialize(&Motion::at([9.0, 9.0, 9.0])).unwrap();
        body.apply_remote(&remote).unwrap();
        assert!(!body.take_changed());
        assert_eq!(handle.lock().unwrap().position, [9.0, 9.0, 9.0]);
    }

    #[test]
    fn test_factory_rebuilds_serialized_state() {
        let (_, body) = DemoWorld::create([4.0, 5.0, 6.0]);
        let state = body.serialize().unwrap();

        let spawned = DemoFactory.spawn(EntityKind::Object, &state).unwrap();
        assert_eq!(spawned.serialize().unwrap(), state);
        assert!(DemoFactory.spawn(EntityKind::Object, &[0xFF]).is_err());
    }

    #[test]
    fn test_world_follows_rekey() {
        let mut world = DemoWorld::new();
        let (handle, _) = DemoWorld::create([0.0; 3]);
        let old = EntityKey::temporary(EntityKind::Object, 2);
        let new = EntityKey::canonical(EntityKind::Object, 300);
        world.track(old, handle);

        world.rekey(old, new);

        assert!(world.bump(new, [1.0, 0.0, 0.0]));
        assert!(!world.bump(old, [1.0, 0.0, 0.0]));
        assert_eq!(world.step(0.1), 1);
    }
}
