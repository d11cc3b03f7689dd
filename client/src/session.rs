//! The replication session: one participant's view of the shared world.
//!
//! A session owns the entity directory and every component that works on
//! it, and is advanced by an external loop calling [`ReplicationSession::tick`].
//! Each tick runs the same fixed pipeline:
//!
//! 1. drain a bounded number of inbound messages and dispatch them by tag
//! 2. roll back ownership claims whose deadline has passed
//! 3. let the priority policy age every locally owned entity
//! 4. poll due entities and pack one unreliable packet
//! 5. send everything reliable produced since the last tick as one message
//!
//! Nothing in here blocks or locks; transports only ever see finished byte
//! buffers through the [`Channel`] handed in at construction.

use crate::channel::{Channel, InboundQueue};
use crate::clock::Clock;
use crate::coalescer::ReliableCoalescer;
use crate::config::SessionConfig;
use crate::directory::{Directory, DirectoryError, RekeyObserver};
use crate::dispatch::decode_all;
use crate::entity::{EntityFactory, Replicable, ReplicableError, ReplicatedEntity};
use crate::grab_cache::GrabCache;
use crate::identifiers::{IdError, IdentifierAllocator, Reconciliation};
use crate::ownership::{ArbitrationState, Arbitrator, ContactOutcome};
use crate::scheduler::UpdateScheduler;
use log::{debug, info, warn};
use shared::protocol::{
    CreateEntity, Disconnect, EntityConfirmed, EntityRedundant, EntitySpawned, GrabChanged,
    OwnershipChanged, OwnershipClaim, Ping, RemoveEntity, StateUpdate,
};
use shared::{
    can_take_ownership, EntityKey, EntityKind, Message, OwnershipStamp, ParticipantId,
    ProtocolError,
};
use std::time::Duration;
use thiserror::Error;

/// Notifications for collaborators, drained with
/// [`ReplicationSession::drain_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    EntityIdConfirmed {
        kind: EntityKind,
        temp_id: u16,
        canonical_id: u16,
    },
    /// Our provisional entity duplicated another one and was dropped.
    EntityRedirected {
        kind: EntityKind,
        temp_id: u16,
        winner: EntityKey,
    },
    EntitySpawned {
        key: EntityKey,
    },
    EntityRemoved {
        key: EntityKey,
    },
    OwnershipChanged {
        key: EntityKey,
        owner: ParticipantId,
    },
    OwnershipRolledBack {
        key: EntityKey,
        restored: OwnershipStamp,
    },
    GrabChanged {
        key: EntityKey,
        grabber: Option<ParticipantId>,
    },
    Disconnected {
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Identifiers(#[from] IdError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Replicable(#[from] ReplicableError),
    #[error("unknown entity {0}")]
    UnknownEntity(EntityKey),
    #[error("session has been torn down")]
    TornDown,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub inbound_messages: usize,
    pub updates_sent: usize,
    pub updates_deferred: usize,
    pub unreliable_bytes: usize,
    pub reliable_bytes: usize,
    pub rollbacks: usize,
}

pub struct ReplicationSession<C: Channel, K: Clock> {
    local: ParticipantId,
    channel: C,
    clock: K,
    inbound: InboundQueue,
    factory: Box<dyn EntityFactory>,
    config: SessionConfig,

    directory: Directory,
    identifiers: IdentifierAllocator,
    arbitration: Arbitrator,
    scheduler: UpdateScheduler,
    coalescer: ReliableCoalescer,
    grabs: GrabCache,

    events: Vec<SessionEvent>,
    elapsed: Duration,
    last_ping: Option<Duration>,
    torn_down: bool,
}

impl<C: Channel, K: Clock> ReplicationSession<C, K> {
    pub fn new(
        local: ParticipantId,
        channel: C,
        clock: K,
        inbound: InboundQueue,
        factory: Box<dyn EntityFactory>,
        config: SessionConfig,
    ) -> Self {
        info!("Replication session started as participant {}", local);
        Self {
            local,
            channel,
            clock,
            inbound,
            factory,
            arbitration: Arbitrator::new(local, config.arbitration.clone()),
            config,
            directory: Directory::new(),
            identifiers: IdentifierAllocator::new(),
            scheduler: UpdateScheduler::new(),
            coalescer: ReliableCoalescer::new(),
            grabs: GrabCache::new(),
            events: Vec::new(),
            elapsed: Duration::ZERO,
            last_ping: None,
            torn_down: false,
        }
    }

    pub fn local_participant(&self) -> ParticipantId {
        self.local
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.torn_down {
            Err(SessionError::TornDown)
        } else {
            Ok(())
        }
    }

    /// Registers a locally created entity under a fresh temporary id and
    /// tells the server about it on the next tick.
    pub fn create_entity(
        &mut self,
        kind: EntityKind,
        body: Box<dyn Replicable>,
        dedupe_key: Option<String>,
    ) -> Result<EntityKey, SessionError> {
        self.ensure_live()?;
        let state = body.serialize()?;
        let temp_id = self.identifiers.allocate(kind)?;
        let key = EntityKey::temporary(kind, temp_id);

        let message = Message::CreateEntity(CreateEntity {
            kind,
            temp_id,
            dedupe_key,
            state,
        });
        let payload = match message.body() {
            Ok(payload) => payload,
            Err(e) => {
                self.identifiers.release(kind, temp_id);
                return Err(e.into());
            }
        };

        let stamp = OwnershipStamp::new(self.local, self.clock.server_time_ms());
        if let Err(e) = self.directory.insert(ReplicatedEntity::new(key, stamp, body)) {
            self.identifiers.release(kind, temp_id);
            return Err(e.into());
        }
        self.coalescer.enqueue_reliable(message.tag(), Some(payload));
        self.scheduler.register_pollable(key);
        debug!("Created {}", key);
        Ok(key)
    }

    pub fn remove_entity(&mut self, key: EntityKey) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.directory
            .remove(key)
            .ok_or(SessionError::UnknownEntity(key))?;
        self.forget(key);
        // a temporary entity is removed on the server once its id is confirmed
        if !key.id.is_temporary() {
            self.queue_reliable(Message::RemoveEntity(RemoveEntity { key }));
        }
        Ok(())
    }

    pub fn register_pollable(&mut self, key: EntityKey) -> Result<(), SessionError> {
        self.ensure_live()?;
        if self.directory.resolve(key).is_none() {
            return Err(SessionError::UnknownEntity(key));
        }
        self.scheduler.register_pollable(key);
        Ok(())
    }

    pub fn unregister_pollable(&mut self, key: EntityKey) {
        self.scheduler.unregister_pollable(key);
    }

    /// Queues a ready-made update for this tick, replacing any polled one.
    pub fn enqueue_push(
        &mut self,
        key: EntityKey,
        tag: u8,
        priority: u32,
        payload: Vec<u8>,
    ) -> Result<(), SessionError> {
        self.ensure_live()?;
        if self.directory.resolve(key).is_none() {
            return Err(SessionError::UnknownEntity(key));
        }
        self.scheduler.enqueue(key, tag, priority, payload);
        Ok(())
    }

    /// Starts a local grab. Grabbing always claims ownership.
    pub fn grab(&mut self, key: EntityKey) -> Result<(), SessionError> {
        self.ensure_live()?;
        let local = self.local;
        let entity = self
            .directory
            .entity_mut(key)
            .ok_or(SessionError::UnknownEntity(key))?;
        entity.grabber = Some(local);
        self.config.policy.boost_grab(entity);
        let claimed = if entity.is_owned_by(local) {
            None
        } else {
            Some(self.arbitration.claim_now(entity, &self.clock))
        };
        self.grabs.record(key, Some(local));

        if let Some(stamp) = claimed {
            self.events.push(SessionEvent::OwnershipChanged { key, owner: local });
            self.queue_reliable(Message::OwnershipClaim(OwnershipClaim { key, stamp }));
        }
        // grabs on provisional entities are announced after confirmation
        if !key.id.is_temporary() {
            self.queue_reliable(Message::GrabChanged(GrabChanged {
                key,
                grabber: Some(local),
            }));
        }
        Ok(())
    }

    pub fn release(&mut self, key: EntityKey) -> Result<(), SessionError> {
        self.ensure_live()?;
        let local = self.local;
        let entity = self
            .directory
            .entity_mut(key)
            .ok_or(SessionError::UnknownEntity(key))?;
        if entity.grabber != Some(local) {
            return Ok(());
        }
        entity.grabber = None;
        self.grabs.record(key, None);
        if !key.id.is_temporary() {
            self.queue_reliable(Message::GrabChanged(GrabChanged { key, grabber: None }));
        }
        Ok(())
    }

    /// Reports that `ours` touched `theirs` in the local simulation.
    pub fn report_contact(
        &mut self,
        ours: EntityKey,
        theirs: EntityKey,
    ) -> Result<ContactOutcome, SessionError> {
        self.ensure_live()?;
        // holding `ours` lets us take whatever it hits
        let grabbing = self.grabs.grabber(ours) == Some(self.local);
        let outcome =
            self.arbitration
                .resolve_contact(&mut self.directory, ours, theirs, grabbing, &self.clock);

        match outcome {
            ContactOutcome::Claimed { key, stamp } => {
                self.events.push(SessionEvent::OwnershipChanged {
                    key,
                    owner: self.local,
                });
                self.queue_reliable(Message::OwnershipClaim(OwnershipClaim { key, stamp }));
            }
            ContactOutcome::Yielding { key, to } => {
                self.events.push(SessionEvent::OwnershipChanged { key, owner: to.owner });
            }
            ContactOutcome::Unchanged => {}
        }

        for key in [ours, theirs] {
            if let Some(entity) = self.directory.entity_mut(key) {
                if entity.is_owned_by(self.local) {
                    self.config.policy.boost_collision(entity);
                }
            }
        }
        Ok(outcome)
    }

    pub fn tick(&mut self, dt: Duration) -> TickReport {
        let mut report = TickReport::default();
        if self.torn_down {
            return report;
        }
        self.elapsed += dt;

        for inbound in self.inbound.drain(self.config.max_inbound_per_tick) {
            report.inbound_messages += 1;
            for message in decode_all(&inbound.bytes) {
                self.handle_message(message);
            }
        }

        let rollbacks = self
            .arbitration
            .expire(&mut self.directory, self.clock.local_ms());
        report.rollbacks = rollbacks.len();
        for rollback in rollbacks {
            self.events.push(SessionEvent::OwnershipRolledBack {
                key: rollback.key,
                restored: rollback.restored,
            });
        }

        self.maybe_ping();

        let local = self.local;
        for entity in self.directory.iter_mut() {
            self.config.policy.advance(entity, local);
        }
        self.scheduler
            .poll(&self.directory, &self.config.policy, local);

        if let Some(packet) = self
            .scheduler
            .flush(&mut self.directory, self.config.max_packet_bytes)
        {
            let stats = self.scheduler.last_flush();
            report.updates_sent = stats.sent;
            report.updates_deferred = stats.deferred;
            report.unreliable_bytes = packet.len();
            if let Err(e) = self.channel.send_unreliable(packet) {
                warn!("Dropping unreliable packet: {}", e);
            }
        }

        if let Some(packet) = self.coalescer.flush_reliable() {
            report.reliable_bytes = packet.len();
            if let Err(e) = self.channel.send_reliable(packet) {
                warn!("Dropping reliable packet: {}", e);
            }
        }

        report
    }

    fn maybe_ping(&mut self) {
        let due = match self.last_ping {
            None => true,
            Some(last) => self.elapsed.saturating_sub(last) >= self.config.ping_interval,
        };
        if due {
            self.last_ping = Some(self.elapsed);
            self.queue_reliable(Message::Ping(Ping {
                client_time_ms: self.clock.local_ms(),
            }));
        }
    }

    fn queue_reliable(&mut self, message: Message) {
        if let Err(e) = self.coalescer.enqueue_message(&message) {
            warn!("Dropping outbound message: {}", e);
        }
    }

    fn forget(&mut self, key: EntityKey) {
        self.grabs.remove(key);
        self.arbitration.forget(key);
        self.scheduler.forget(key);
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Welcome(welcome) => self.clock.observe_welcome(welcome.server_time_ms),
            Message::Pong(pong) => self
                .clock
                .observe_pong(pong.client_time_ms, pong.server_time_ms),
            Message::Disconnect(Disconnect { reason }) => {
                info!("Server closed the session: {}", reason);
                self.events.push(SessionEvent::Disconnected { reason });
            }
            Message::EntityConfirmed(confirmed) => self.on_confirmed(confirmed),
            Message::EntityRedundant(redundant) => self.on_redundant(redundant),
            Message::EntitySpawned(spawned) => self.on_spawned(spawned),
            Message::RemoveEntity(RemoveEntity { key }) => self.on_removed(key),
            Message::OwnershipChanged(changed) => self.on_ownership_changed(changed),
            Message::GrabChanged(grab) => self.on_grab_changed(grab),
            Message::StateUpdate(update) => self.on_state_update(update),
            other => warn!("Ignoring unexpected message with tag {}", other.tag()),
        }
    }

    fn on_confirmed(&mut self, confirmed: EntityConfirmed) {
        let EntityConfirmed {
            kind,
            temp_id,
            canonical_id,
        } = confirmed;
        let outcome = self.identifiers.confirm(
            kind,
            temp_id,
            canonical_id,
            &mut self.directory,
            &mut [
                &mut self.grabs as &mut dyn RekeyObserver,
                &mut self.arbitration as &mut dyn RekeyObserver,
                &mut self.scheduler as &mut dyn RekeyObserver,
            ],
        );

        match outcome {
            Reconciliation::Rekeyed(_) => {
                let key = EntityKey::canonical(kind, canonical_id);
                debug!("{} tmp#{} is now {}", kind, temp_id, key);
                self.events.push(SessionEvent::EntityIdConfirmed {
                    kind,
                    temp_id,
                    canonical_id,
                });
                if self.grabs.grabber(key) == Some(self.local) {
                    self.queue_reliable(Message::GrabChanged(GrabChanged {
                        key,
                        grabber: Some(self.local),
                    }));
                }
            }
            Reconciliation::Redirected { winner } => {
                self.events.push(SessionEvent::EntityRedirected {
                    kind,
                    temp_id,
                    winner,
                });
            }
            Reconciliation::Orphaned { canonical } => {
                self.queue_reliable(Message::RemoveEntity(RemoveEntity { key: canonical }));
            }
            Reconciliation::Stale => {}
        }
    }

    fn on_redundant(&mut self, redundant: EntityRedundant) {
        let EntityRedundant {
            kind,
            temp_id,
            winner_id,
        } = redundant;
        let outcome = self.identifiers.reject_redundant(
            kind,
            temp_id,
            winner_id,
            &mut self.directory,
            &mut [
                &mut self.grabs as &mut dyn RekeyObserver,
                &mut self.arbitration as &mut dyn RekeyObserver,
                &mut self.scheduler as &mut dyn RekeyObserver,
            ],
        );

        let Reconciliation::Redirected { winner } = outcome else {
            return;
        };
        info!("{} tmp#{} duplicated {}, using that instead", kind, temp_id, winner);
        self.events.push(SessionEvent::EntityRedirected {
            kind,
            temp_id,
            winner,
        });

        // a grab on the discarded entity carries over to the winner
        if self.grabs.grabber(winner) == Some(self.local) {
            if let Some(entity) = self.directory.entity_mut(winner) {
                entity.grabber = Some(self.local);
                self.queue_reliable(Message::GrabChanged(GrabChanged {
                    key: winner,
                    grabber: Some(self.local),
                }));
            }
        }
    }

    fn on_spawned(&mut self, spawned: EntitySpawned) {
        let EntitySpawned {
            key,
            stamp,
            grabber,
            state,
        } = spawned;
        if key.id.is_temporary() || self.directory.resolve(key).is_some() {
            warn!("Ignoring duplicate or malformed spawn of {}", key);
            return;
        }

        let body = match self.factory.spawn(key.kind, &state) {
            Ok(body) => body,
            Err(e) => {
                warn!("Could not spawn {}: {}", key, e);
                return;
            }
        };
        let mut entity = ReplicatedEntity::new(key, stamp, body);
        entity.grabber = grabber;
        if let Err(e) = self.directory.insert(entity) {
            warn!("Could not register {}: {}", key, e);
            return;
        }
        self.grabs.record(key, grabber);
        self.scheduler.register_pollable(key);
        self.events.push(SessionEvent::EntitySpawned { key });
    }

    fn on_removed(&mut self, key: EntityKey) {
        if self.directory.remove(key).is_none() {
            debug!("Removal of unknown {}", key);
            return;
        }
        self.forget(key);
        self.events.push(SessionEvent::EntityRemoved { key });
    }

    fn on_ownership_changed(&mut self, changed: OwnershipChanged) {
        let OwnershipChanged { key, stamp } = changed;
        let Some(entity) = self.directory.entity_mut(key) else {
            warn!("Dropping ownership change for unknown {}", key);
            return;
        };
        let believed = entity.owner;
        let announced = self
            .arbitration
            .apply_authoritative(entity, stamp)
            .map(|claim| claim.claimed.owner)
            .unwrap_or(believed);
        if stamp.owner != announced {
            self.events.push(SessionEvent::OwnershipChanged {
                key,
                owner: stamp.owner,
            });
        }
    }

    fn on_grab_changed(&mut self, grab: GrabChanged) {
        let GrabChanged { key, grabber } = grab;
        let Some(entity) = self.directory.entity_mut(key) else {
            warn!("Dropping grab change for unknown {}", key);
            return;
        };
        if entity.grabber == grabber {
            return;
        }
        entity.grabber = grabber;
        self.grabs.record(key, grabber);
        self.events.push(SessionEvent::GrabChanged { key, grabber });
    }

    fn on_state_update(&mut self, update: StateUpdate) {
        let StateUpdate { key, stamp, state } = update;
        if stamp.owner == self.local {
            return;
        }
        let arbitration = self.arbitration.state(key);
        let Some(entity) = self.directory.entity_mut(key) else {
            debug!("State for unknown {}", key);
            return;
        };

        let current = entity.stamp();
        let accept = match arbitration {
            ArbitrationState::AnticipatingGain => false,
            ArbitrationState::AnticipatingLoss => stamp.owner == current.owner,
            // the believed owner may restamp its own entity, never backwards
            ArbitrationState::Idle if stamp.owner == current.owner => {
                entity.restamp_from_owner(stamp)
            }
            ArbitrationState::Idle => {
                let newer = can_take_ownership(&stamp, &current);
                if newer {
                    entity.restamp_from_owner(stamp);
                    if stamp.owner != current.owner {
                        self.events.push(SessionEvent::OwnershipChanged {
                            key,
                            owner: stamp.owner,
                        });
                    }
                }
                newer
            }
        };
        if !accept {
            debug!("Discarding stale state for {} from {}", key, stamp.owner);
            return;
        }
        if let Err(e) = entity.body.apply_remote(&state) {
            warn!("Could not apply state to {}: {}", key, e);
        }
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Tells the server we are leaving, then tears down.
    pub fn disconnect(&mut self, reason: &str) {
        if self.torn_down {
            return;
        }
        let message = Message::Disconnect(Disconnect {
            reason: reason.to_string(),
        });
        match message.encode() {
            Ok(bytes) => {
                if let Err(e) = self.channel.send_reliable(bytes) {
                    debug!("Disconnect not sent: {}", e);
                }
            }
            Err(e) => warn!("Disconnect not sent: {}", e),
        }
        self.teardown();
    }

    /// Discards every queue, pool, claim and entity in one step. The session
    /// ignores all further ticks.
    pub fn teardown(&mut self) {
        let discarded = self.inbound.discard_all();
        self.scheduler.clear();
        self.coalescer.clear();
        self.identifiers.reset();
        self.arbitration.clear();
        self.grabs.clear();
        self.directory.clear();
        self.events.clear();
        self.torn_down = true;
        info!(
            "Session for participant {} torn down, {} inbound messages discarded",
            self.local, discarded
        );
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn entity(&self, key: EntityKey) -> Option<&ReplicatedEntity> {
        self.directory.entity(key)
    }

    pub fn entity_mut(&mut self, key: EntityKey) -> Option<&mut ReplicatedEntity> {
        self.directory.entity_mut(key)
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn arbitration(&self) -> &Arbitrator {
        &self.arbitration
    }

    pub fn identifiers(&self) -> &IdentifierAllocator {
        &self.identifiers
    }

    pub fn grab_cache(&self) -> &GrabCache {
        &self.grabs
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn clock(&self) -> &K {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut K {
        &mut self.clock
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{inbound_queue, Delivery, Inbound, InboundSender, MemoryChannel};
    use crate::clock::ManualClock;
    use crate::entity::test_support::{TestBody, TestFactory};
    use shared::protocol::tag;
    use shared::MessageReader;

    const LOCAL: ParticipantId = 3;
    const REMOTE: ParticipantId = 9;
    const TICK: Duration = Duration::from_millis(16);

    type TestSession = ReplicationSession<MemoryChannel, ManualClock>;

    fn session_with(config: SessionConfig) -> (TestSession, InboundSender) {
        let (tx, inbound) = inbound_queue(64);
        let session = ReplicationSession::new(
            LOCAL,
            MemoryChannel::new(),
            ManualClock::new(1_000),
            inbound,
            Box::new(TestFactory),
            config,
        );
        (session, tx)
    }

    fn session() -> (TestSession, InboundSender) {
        session_with(SessionConfig::default())
    }

    fn deliver(tx: &InboundSender, messages: &[Message]) {
        let mut bytes = Vec::new();
        for message in messages {
            message.write_to(&mut bytes).unwrap();
        }
        tx.try_send(Inbound {
            delivery: Delivery::Reliable,
            bytes,
        })
        .unwrap();
    }

    /// Reliable messages sent so far, pings left out.
    fn reliable_sent(session: &mut TestSession) -> Vec<Message> {
        let packets = std::mem::take(&mut session.channel_mut().reliable);
        packets
            .iter()
            .flat_map(|packet| MessageReader::new(packet).collect::<Result<Vec<_>, _>>().unwrap())
            .filter(|message| message.tag() != tag::PING)
            .collect()
    }

    fn spawn_remote(tx: &InboundSender, id: u16, stamp: OwnershipStamp) -> EntityKey {
        let key = EntityKey::canonical(EntityKind::Object, id);
        deliver(
            tx,
            &[Message::EntitySpawned(EntitySpawned {
                key,
                stamp,
                grabber: None,
                state: vec![1, 2, 3],
            })],
        );
        key
    }

    fn confirm(tx: &InboundSender, key: EntityKey, canonical_id: u16) {
        deliver(
            tx,
            &[Message::EntityConfirmed(EntityConfirmed {
                kind: key.kind,
                temp_id: key.id.wire(),
                canonical_id,
            })],
        );
    }

    #[test]
    fn test_create_sends_one_reliable_message_per_tick() {
        let (mut session, _tx) = session();
        let a = session
            .create_entity(EntityKind::Object, TestBody::sized(4), None)
            .unwrap();
        let b = session
            .create_entity(EntityKind::Material, TestBody::sized(4), Some("steel".to_string()))
            .unwrap();
        assert!(a.id.is_temporary());
        assert_eq!(b, EntityKey::temporary(EntityKind::Material, 0));

        let report = session.tick(TICK);

        assert_eq!(session.channel().reliable.len(), 1);
        assert!(report.reliable_bytes > 0);
        // temporary entities never go out as state updates
        assert!(session.channel().unreliable.is_empty());
        let sent = reliable_sent(&mut session);
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[1], Message::CreateEntity(create) if create.dedupe_key.as_deref() == Some("steel")));
    }

    #[test]
    fn test_confirmation_rekeys_and_starts_updates() {
        let (mut session, tx) = session();
        let temp = session
            .create_entity(EntityKind::Object, TestBody::sized(4), None)
            .unwrap();
        session.tick(TICK);

        confirm(&tx, temp, 4021);
        let report = session.tick(TICK);

        let canonical = EntityKey::canonical(EntityKind::Object, 4021);
        assert!(session.entity(temp).is_none());
        assert!(session.entity(canonical).is_some());
        assert_eq!(
            session.drain_events(),
            vec![SessionEvent::EntityIdConfirmed {
                kind: EntityKind::Object,
                temp_id: 0,
                canonical_id: 4021
            }]
        );
        assert_eq!(report.updates_sent, 1);
        let packet = session.channel().unreliable.last().unwrap().clone();
        assert!(packet.len() <= session.config().max_packet_bytes);
        match MessageReader::new(&packet).next() {
            Some(Ok(Message::StateUpdate(update))) => {
                assert_eq!(update.key, canonical);
                assert_eq!(update.stamp.owner, LOCAL);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_grab_on_temporary_entity_is_announced_after_confirmation() {
        let (mut session, tx) = session();
        let temp = session
            .create_entity(EntityKind::Object, TestBody::sized(4), None)
            .unwrap();
        session.grab(temp).unwrap();
        session.tick(TICK);
        assert!(reliable_sent(&mut session)
            .iter()
            .all(|message| message.tag() != tag::GRAB_CHANGED));

        confirm(&tx, temp, 4021);
        session.tick(TICK);

        let canonical = EntityKey::canonical(EntityKind::Object, 4021);
        assert_eq!(session.grab_cache().grabber(canonical), Some(LOCAL));
        assert_eq!(session.grab_cache().grabber(temp), None);
        assert_eq!(
            reliable_sent(&mut session),
            vec![Message::GrabChanged(GrabChanged {
                key: canonical,
                grabber: Some(LOCAL)
            })]
        );
    }

    #[test]
    fn test_removed_before_confirmation_is_removed_on_server() {
        let (mut session, tx) = session();
        let temp = session
            .create_entity(EntityKind::Script, TestBody::sized(4), None)
            .unwrap();
        session.remove_entity(temp).unwrap();
        session.tick(TICK);
        reliable_sent(&mut session);

        confirm(&tx, temp, 600);
        session.tick(TICK);

        assert_eq!(
            reliable_sent(&mut session),
            vec![Message::RemoveEntity(RemoveEntity {
                key: EntityKey::canonical(EntityKind::Script, 600)
            })]
        );
        assert_eq!(session.identifiers().pool(EntityKind::Script).outstanding(), 0);
    }

    #[test]
    fn test_redundant_entity_redirects_to_winner() {
        let (mut session, tx) = session();
        let winner = spawn_remote(&tx, 800, OwnershipStamp::new(REMOTE, 10));
        session.tick(TICK);
        let temp = session
            .create_entity(EntityKind::Object, TestBody::sized(4), Some("crate".to_string()))
            .unwrap();
        session.grab(temp).unwrap();
        session.drain_events();

        deliver(
            &tx,
            &[Message::EntityRedundant(EntityRedundant {
                kind: EntityKind::Object,
                temp_id: temp.id.wire(),
                winner_id: 800,
            })],
        );
        session.tick(TICK);

        assert!(session.entity(temp).is_none());
        assert_eq!(
            session.drain_events(),
            vec![SessionEvent::EntityRedirected {
                kind: EntityKind::Object,
                temp_id: temp.id.wire(),
                winner
            }]
        );
        assert_eq!(session.entity(winner).unwrap().grabber, Some(LOCAL));
    }

    #[test]
    fn test_remote_spawn_and_state() {
        let (mut session, tx) = session();
        let key = spawn_remote(&tx, 500, OwnershipStamp::new(REMOTE, 1_000));
        session.tick(TICK);
        assert_eq!(session.drain_events(), vec![SessionEvent::EntitySpawned { key }]);

        let update = |state: Vec<u8>, stamp| {
            Message::StateUpdate(StateUpdate { key, stamp, state })
        };
        deliver(&tx, &[update(vec![7, 7], OwnershipStamp::new(REMOTE, 1_000))]);
        session.tick(TICK);
        assert_eq!(session.entity(key).unwrap().body.serialize().unwrap(), vec![7, 7]);

        // an older stamp from someone else is stale
        deliver(&tx, &[update(vec![8], OwnershipStamp::new(12, 900))]);
        session.tick(TICK);
        assert_eq!(session.entity(key).unwrap().body.serialize().unwrap(), vec![7, 7]);

        // a newer one carries ownership with it
        deliver(&tx, &[update(vec![9], OwnershipStamp::new(12, 1_100))]);
        session.tick(TICK);
        assert_eq!(session.entity(key).unwrap().owner, 12);
        assert_eq!(
            session.drain_events(),
            vec![SessionEvent::OwnershipChanged { key, owner: 12 }]
        );

        // a reordered packet from the owner cannot move its stamp backwards
        deliver(&tx, &[update(vec![10], OwnershipStamp::new(12, 1_050))]);
        session.tick(TICK);
        assert_eq!(session.entity(key).unwrap().body.serialize().unwrap(), vec![9]);
        assert_eq!(session.entity(key).unwrap().ownership_timestamp, 1_100);

        deliver(&tx, &[update(vec![11], OwnershipStamp::new(12, 1_150))]);
        session.tick(TICK);
        assert_eq!(session.entity(key).unwrap().body.serialize().unwrap(), vec![11]);
        assert_eq!(session.entity(key).unwrap().ownership_timestamp, 1_150);
        assert!(session.drain_events().is_empty());
    }

    #[test]
    fn test_first_owner_restamp_replaces_spawn_stamp() {
        let (mut session, tx) = session();
        let key = spawn_remote(&tx, 500, OwnershipStamp::new(REMOTE, 1_000));
        session.tick(TICK);
        session.drain_events();

        let update = |state: Vec<u8>, timestamp| {
            Message::StateUpdate(StateUpdate {
                key,
                stamp: OwnershipStamp::new(REMOTE, timestamp),
                state,
            })
        };

        // the creator stamped before the server did
        deliver(&tx, &[update(vec![4], 950)]);
        session.tick(TICK);
        assert_eq!(session.entity(key).unwrap().ownership_timestamp, 950);
        assert_eq!(session.entity(key).unwrap().body.serialize().unwrap(), vec![4]);

        deliver(&tx, &[update(vec![5], 940)]);
        session.tick(TICK);
        assert_eq!(session.entity(key).unwrap().ownership_timestamp, 950);
        assert_eq!(session.entity(key).unwrap().body.serialize().unwrap(), vec![4]);

        deliver(&tx, &[update(vec![6], 950)]);
        session.tick(TICK);
        assert_eq!(session.entity(key).unwrap().body.serialize().unwrap(), vec![6]);
        assert!(session.drain_events().is_empty());
    }

    #[test]
    fn test_contact_claim_is_sent_and_server_correction_reported() {
        let (mut session, tx) = session();
        let theirs = spawn_remote(&tx, 500, OwnershipStamp::new(REMOTE, 1_000));
        let ours = spawn_remote(&tx, 501, OwnershipStamp::new(LOCAL, 1_000));
        session.tick(TICK);
        reliable_sent(&mut session);
        session.drain_events();

        let outcome = session.report_contact(ours, theirs).unwrap();
        let stamp = OwnershipStamp::new(LOCAL, 1_000);
        assert_eq!(outcome, ContactOutcome::Claimed { key: theirs, stamp });
        session.tick(TICK);
        assert_eq!(
            reliable_sent(&mut session),
            vec![Message::OwnershipClaim(OwnershipClaim { key: theirs, stamp })]
        );

        // server sides with someone else
        let settled = OwnershipStamp::new(2, 1_200);
        deliver(
            &tx,
            &[Message::OwnershipChanged(OwnershipChanged {
                key: theirs,
                stamp: settled,
            })],
        );
        session.tick(TICK);

        assert_eq!(session.entity(theirs).unwrap().stamp(), settled);
        assert_eq!(session.arbitration().state(theirs), ArbitrationState::Idle);
        assert_eq!(
            session.drain_events(),
            vec![
                SessionEvent::OwnershipChanged {
                    key: theirs,
                    owner: LOCAL
                },
                SessionEvent::OwnershipChanged {
                    key: theirs,
                    owner: 2
                },
            ]
        );
    }

    #[test]
    fn test_yield_rolls_back_without_confirmation() {
        let (mut session, tx) = session();
        let theirs = spawn_remote(&tx, 500, OwnershipStamp::new(REMOTE, 2_000));
        let ours = spawn_remote(&tx, 501, OwnershipStamp::new(LOCAL, 1_000));
        session.tick(TICK);
        session.drain_events();

        let outcome = session.report_contact(ours, theirs).unwrap();
        assert!(matches!(outcome, ContactOutcome::Yielding { .. }));
        assert_eq!(session.entity(ours).unwrap().owner, REMOTE);

        session.clock_mut().advance(Duration::from_secs(10));
        let report = session.tick(TICK);

        assert_eq!(report.rollbacks, 1);
        assert_eq!(
            session.entity(ours).unwrap().stamp(),
            OwnershipStamp::new(LOCAL, 1_000)
        );
        assert!(session
            .drain_events()
            .contains(&SessionEvent::OwnershipRolledBack {
                key: ours,
                restored: OwnershipStamp::new(LOCAL, 1_000)
            }));
    }

    #[test]
    fn test_held_entity_claims_what_it_hits() {
        let (mut session, tx) = session();
        let theirs = spawn_remote(&tx, 500, OwnershipStamp::new(REMOTE, 2_000));
        let ours = spawn_remote(&tx, 501, OwnershipStamp::new(LOCAL, 1_000));
        session.tick(TICK);
        reliable_sent(&mut session);
        session.drain_events();

        session.grab(ours).unwrap();
        let outcome = session.report_contact(ours, theirs).unwrap();

        // a newer remote stamp would win the tie-break, but we are holding ours
        let stamp = OwnershipStamp::new(LOCAL, 1_000);
        assert_eq!(outcome, ContactOutcome::Claimed { key: theirs, stamp });
        assert_eq!(session.arbitration().state(ours), ArbitrationState::Idle);
        assert_eq!(session.arbitration().state(theirs), ArbitrationState::AnticipatingGain);
        assert!(session.entity(ours).unwrap().is_owned_by(LOCAL));

        session.tick(TICK);
        assert_eq!(
            reliable_sent(&mut session),
            vec![
                Message::GrabChanged(GrabChanged {
                    key: ours,
                    grabber: Some(LOCAL)
                }),
                Message::OwnershipClaim(OwnershipClaim { key: theirs, stamp }),
            ]
        );
    }

    #[test]
    fn test_ownership_change_for_unknown_entity_is_dropped() {
        let (mut session, tx) = session();
        deliver(
            &tx,
            &[Message::OwnershipChanged(OwnershipChanged {
                key: EntityKey::canonical(EntityKind::Object, 999),
                stamp: OwnershipStamp::new(REMOTE, 5),
            })],
        );
        let report = session.tick(TICK);
        assert_eq!(report.inbound_messages, 1);
        assert!(session.drain_events().is_empty());
    }

    #[test]
    fn test_inbound_drain_is_capped_per_tick() {
        let config = SessionConfig {
            max_inbound_per_tick: 1,
            ..SessionConfig::default()
        };
        let (mut session, tx) = session_with(config);
        spawn_remote(&tx, 500, OwnershipStamp::new(REMOTE, 1));
        spawn_remote(&tx, 501, OwnershipStamp::new(REMOTE, 1));

        assert_eq!(session.tick(TICK).inbound_messages, 1);
        assert_eq!(session.directory().len(), 1);
        assert_eq!(session.tick(TICK).inbound_messages, 1);
        assert_eq!(session.directory().len(), 2);
    }

    #[test]
    fn test_malformed_buffer_does_not_affect_next_one() {
        let (mut session, tx) = session();
        tx.try_send(Inbound {
            delivery: Delivery::Unreliable,
            bytes: vec![tag::STATE_UPDATE, 0xFF],
        })
        .unwrap();
        let key = spawn_remote(&tx, 500, OwnershipStamp::new(REMOTE, 1));

        let report = session.tick(TICK);

        assert_eq!(report.inbound_messages, 2);
        assert!(session.entity(key).is_some());
    }

    #[test]
    fn test_teardown_discards_everything() {
        let (mut session, tx) = session();
        let temp = session
            .create_entity(EntityKind::Object, TestBody::sized(4), None)
            .unwrap();
        spawn_remote(&tx, 500, OwnershipStamp::new(REMOTE, 1));

        session.disconnect("bye");

        assert!(session.is_torn_down());
        assert!(session.directory().is_empty());
        assert_eq!(session.identifiers().pool(EntityKind::Object).outstanding(), 0);
        assert_eq!(session.tick(TICK), TickReport::default());
        assert!(matches!(
            session.create_entity(EntityKind::Object, TestBody::sized(1), None),
            Err(SessionError::TornDown)
        ));
        assert!(session.entity(temp).is_none());
        assert!(tx.try_send(Inbound {
            delivery: Delivery::Reliable,
            bytes: Vec::new()
        })
        .is_err());
        let sent = reliable_sent(&mut session);
        assert_eq!(
            sent,
            vec![Message::Disconnect(Disconnect {
                reason: "bye".to_string()
            })]
        );
    }

    #[test]
    fn test_ping_follows_interval() {
        let (mut session, _tx) = session();
        let pings = |session: &mut TestSession| {
            std::mem::take(&mut session.channel_mut().reliable)
                .iter()
                .flat_map(|packet| MessageReader::new(packet).filter_map(Result::ok).collect::<Vec<_>>())
                .filter(|message| message.tag() == tag::PING)
                .count()
        };

        session.tick(TICK);
        assert_eq!(pings(&mut session), 1);
        session.tick(TICK);
        assert_eq!(pings(&mut session), 0);
        session.tick(Duration::from_secs(1));
        assert_eq!(pings(&mut session), 1);
    }
}
