//! Client-side ownership arbitration.
//!
//! Ownership changes are applied optimistically the moment a contact is
//! resolved, then confirmed (or corrected) by the server's authoritative
//! ownership messages. Each in-flight change is an [`OwnershipClaim`] with an
//! explicit deadline:
//!
//! ```text
//!            contact, we win / grab           server message
//!   Idle  ─────────────────────────▶ AnticipatingGain ───────────▶ Idle
//!     │
//!     │      contact, we lose                 server message
//!     └────────────────────────────▶ AnticipatingLoss ───────────▶ Idle
//!                                            │ deadline passed
//!                                            └─ restore prior stamp ─▶ Idle
//! ```

use crate::clock::Clock;
use crate::directory::{Directory, RekeyObserver};
use crate::entity::ReplicatedEntity;
use log::{debug, info};
use shared::{can_take_ownership, EntityKey, OwnershipStamp, ParticipantId};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimDirection {
    Gain,
    Loss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationState {
    Idle,
    AnticipatingGain,
    AnticipatingLoss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipClaim {
    pub key: EntityKey,
    pub claimed: OwnershipStamp,
    pub prior: OwnershipStamp,
    pub started_at_ms: u64,
    pub expires_at_ms: u64,
    pub direction: ClaimDirection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArbitrationConfig {
    /// Multiple of the RTT to wait for confirmation.
    pub rtt_factor: f64,
    /// Lower bound on the wait, whatever the RTT.
    pub rollback_floor: Duration,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            rtt_factor: 2.0,
            rollback_floor: Duration::from_secs(10),
        }
    }
}

impl ArbitrationConfig {
    pub fn rollback_window(&self, rtt: Duration) -> Duration {
        rtt.mul_f64(self.rtt_factor.max(0.0)).max(self.rollback_floor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactOutcome {
    /// We now optimistically own `key`; the server must hear about it.
    Claimed { key: EntityKey, stamp: OwnershipStamp },
    /// Our entity `key` is expected to pass to `to.owner`.
    Yielding { key: EntityKey, to: OwnershipStamp },
    Unchanged,
}

/// A loss claim that timed out and was reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rollback {
    pub key: EntityKey,
    pub restored: OwnershipStamp,
}

#[derive(Debug)]
pub struct Arbitrator {
    local: ParticipantId,
    config: ArbitrationConfig,
    claims: HashMap<EntityKey, OwnershipClaim>,
}

impl Arbitrator {
    pub fn new(local: ParticipantId, config: ArbitrationConfig) -> Self {
        Self {
            local,
            config,
            claims: HashMap::new(),
        }
    }

    pub fn state(&self, key: EntityKey) -> ArbitrationState {
        match self.claims.get(&key).map(|claim| claim.direction) {
            None => ArbitrationState::Idle,
            Some(ClaimDirection::Gain) => ArbitrationState::AnticipatingGain,
            Some(ClaimDirection::Loss) => ArbitrationState::AnticipatingLoss,
        }
    }

    pub fn claim(&self, key: EntityKey) -> Option<&OwnershipClaim> {
        self.claims.get(&key)
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Takes `entity` unconditionally with a fresh stamp, as when grabbing.
    pub fn claim_now(&mut self, entity: &mut ReplicatedEntity, clock: &dyn Clock) -> OwnershipStamp {
        let stamp = OwnershipStamp::new(self.local, clock.server_time_ms());
        self.begin(entity, stamp, ClaimDirection::Gain, clock);
        stamp
    }

    /// Resolves a contact between our entity `ours` and `theirs`.
    /// `grabbing` means the local participant is holding `ours`.
    pub fn resolve_contact(
        &mut self,
        directory: &mut Directory,
        ours: EntityKey,
        theirs: EntityKey,
        grabbing: bool,
        clock: &dyn Clock,
    ) -> ContactOutcome {
        if self.claims.contains_key(&theirs) || self.claims.contains_key(&ours) {
            return ContactOutcome::Unchanged;
        }
        let (our_stamp, their_stamp) = match (directory.entity(ours), directory.entity(theirs)) {
            (Some(a), Some(b)) => (a.stamp(), b.stamp()),
            _ => return ContactOutcome::Unchanged,
        };
        if their_stamp.owner == self.local {
            return ContactOutcome::Unchanged;
        }

        if grabbing {
            return match directory.entity_mut(theirs) {
                Some(entity) => {
                    let stamp = self.claim_now(entity, clock);
                    ContactOutcome::Claimed { key: theirs, stamp }
                }
                None => ContactOutcome::Unchanged,
            };
        }

        // Entities the server has not confirmed cannot change hands, and a
        // contact between two remote entities is none of our business.
        if our_stamp.owner != self.local || ours.id.is_temporary() {
            return ContactOutcome::Unchanged;
        }

        let ours_claims = OwnershipStamp::new(self.local, our_stamp.timestamp);
        if can_take_ownership(&ours_claims, &their_stamp) {
            match directory.entity_mut(theirs) {
                Some(entity) => {
                    self.begin(entity, ours_claims, ClaimDirection::Gain, clock);
                    ContactOutcome::Claimed {
                        key: theirs,
                        stamp: ours_claims,
                    }
                }
                None => ContactOutcome::Unchanged,
            }
        } else {
            match directory.entity_mut(ours) {
                Some(entity) => {
                    self.begin(entity, their_stamp, ClaimDirection::Loss, clock);
                    ContactOutcome::Yielding {
                        key: ours,
                        to: their_stamp,
                    }
                }
                None => ContactOutcome::Unchanged,
            }
        }
    }

    fn begin(
        &mut self,
        entity: &mut ReplicatedEntity,
        claimed: OwnershipStamp,
        direction: ClaimDirection,
        clock: &dyn Clock,
    ) {
        let now = clock.local_ms();
        let window = self.config.rollback_window(clock.rtt());
        let claim = OwnershipClaim {
            key: entity.key(),
            claimed,
            prior: entity.stamp(),
            started_at_ms: now,
            expires_at_ms: now.saturating_add(window.as_millis() as u64),
            direction,
        };
        debug!(
            "Anticipating {:?} of {}: {:?} -> {:?}",
            direction, claim.key, claim.prior, claimed
        );
        entity.set_stamp(claimed);
        self.claims.insert(claim.key, claim);
    }

    /// Applies a server ownership message. Ends any claim on the entity and
    /// returns it.
    pub fn apply_authoritative(
        &mut self,
        entity: &mut ReplicatedEntity,
        stamp: OwnershipStamp,
    ) -> Option<OwnershipClaim> {
        let claim = self.claims.remove(&entity.key());
        if let Some(claim) = &claim {
            if claim.claimed != stamp {
                info!(
                    "Server settled {} on participant {} (we anticipated {})",
                    claim.key, stamp.owner, claim.claimed.owner
                );
            }
        }
        entity.set_stamp(stamp);
        claim
    }

    /// Ends claims whose deadline has passed. Loss claims restore the exact
    /// pre-claim stamp; gain claims are dropped and keep the claimed stamp.
    pub fn expire(&mut self, directory: &mut Directory, now_ms: u64) -> Vec<Rollback> {
        let expired: Vec<EntityKey> = self
            .claims
            .values()
            .filter(|claim| claim.expires_at_ms <= now_ms)
            .map(|claim| claim.key)
            .collect();

        let mut rollbacks = Vec::new();
        for key in expired {
            let Some(claim) = self.claims.remove(&key) else {
                continue;
            };
            match claim.direction {
                ClaimDirection::Loss => {
                    if let Some(entity) = directory.entity_mut(key) {
                        entity.set_stamp(claim.prior);
                        info!(
                            "No confirmation for {} within {} ms, restored owner {}",
                            key,
                            now_ms.saturating_sub(claim.started_at_ms),
                            claim.prior.owner
                        );
                        rollbacks.push(Rollback {
                            key,
                            restored: claim.prior,
                        });
                    }
                }
                ClaimDirection::Gain => {
                    debug!("Claim on {} expired unanswered", key);
                }
            }
        }
        rollbacks
    }

    /// Forgets any claim on an entity that was removed.
    pub fn forget(&mut self, key: EntityKey) {
        self.claims.remove(&key);
    }

    pub fn clear(&mut self) {
        self.claims.clear();
    }
}

impl RekeyObserver for Arbitrator {
    fn on_rekeyed(&mut self, old: EntityKey, new: EntityKey) {
        if let Some(mut claim) = self.claims.remove(&old) {
            claim.key = new;
            self.claims.insert(new, claim);
        }
    }
}
