//! Integration tests for the replication client and relay server
//!
//! These tests run a real server on loopback and drive real client sessions
//! against it over TCP and UDP.

use client::channel::QueuedChannel;
use client::clock::SyncedClock;
use client::demo::{DemoFactory, DemoWorld, Motion};
use client::network::{self, Connection, TransportTasks};
use client::{ReplicationSession, SessionConfig, SessionEvent};
use server::{Server, ServerConfig, ServerHandle};
use shared::{EntityKey, EntityKind, ParticipantId, SERVER_PARTICIPANT};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::sleep;

const TICK: Duration = Duration::from_millis(10);
const MAX_TICKS: usize = 300;

async fn start_server() -> (SocketAddr, ServerHandle) {
    let config = ServerConfig {
        tick_duration: TICK,
        ..ServerConfig::default()
    };
    let server = Server::bind("127.0.0.1:0", config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    tokio::spawn(server.run());
    (addr, handle)
}

/// One connected participant and the bodies it simulates.
struct Peer {
    session: ReplicationSession<QueuedChannel, SyncedClock>,
    world: DemoWorld,
    events: Vec<SessionEvent>,
    _tasks: TransportTasks,
}

impl Peer {
    async fn join(addr: SocketAddr) -> Peer {
        let config = SessionConfig::default();
        let Connection {
            participant,
            server_time_ms,
            channel,
            inbound,
            tasks,
        } = network::connect(addr, config.inbound_capacity).await.unwrap();
        Peer {
            session: ReplicationSession::new(
                participant,
                channel,
                SyncedClock::with_server_time(server_time_ms),
                inbound,
                Box::new(DemoFactory),
                config,
            ),
            world: DemoWorld::new(),
            events: Vec::new(),
            _tasks: tasks,
        }
    }

    fn id(&self) -> ParticipantId {
        self.session.local_participant()
    }

    fn create(&mut self, kind: EntityKind, position: [f32; 3], dedupe: Option<&str>) -> EntityKey {
        let (handle, body) = DemoWorld::create(position);
        let key = self
            .session
            .create_entity(kind, body, dedupe.map(str::to_string))
            .unwrap();
        self.world.track(key, handle);
        key
    }

    fn tick(&mut self) {
        self.world.step(TICK.as_secs_f32());
        self.session.tick(TICK);
        for event in self.session.drain_events() {
            if let SessionEvent::EntityIdConfirmed {
                kind,
                temp_id,
                canonical_id,
            } = event
            {
                self.world.rekey(
                    EntityKey::temporary(kind, temp_id),
                    EntityKey::canonical(kind, canonical_id),
                );
            }
            self.events.push(event);
        }
    }

    fn confirmed_key(&self, kind: EntityKind, temp: EntityKey) -> Option<EntityKey> {
        self.events.iter().find_map(|event| match event {
            SessionEvent::EntityIdConfirmed {
                kind: k,
                temp_id,
                canonical_id,
            } if *k == kind && EntityKey::temporary(kind, *temp_id) == temp => {
                Some(EntityKey::canonical(kind, *canonical_id))
            }
            _ => None,
        })
    }

    fn motion(&self, key: EntityKey) -> Option<Motion> {
        let state = self.session.entity(key)?.body.serialize().ok()?;
        bincode::deserialize(&state).ok()
    }
}

/// Ticks every peer until `done` holds or the budget runs out.
async fn tick_until<F>(peers: &mut [&mut Peer], mut done: F) -> bool
where
    F: FnMut(&[&mut Peer]) -> bool,
{
    for _ in 0..MAX_TICKS {
        for peer in peers.iter_mut() {
            peer.tick();
        }
        if done(&*peers) {
            return true;
        }
        sleep(TICK).await;
    }
    false
}

/// Creates one object on `a` and waits until `b` has it.
async fn shared_object(a: &mut Peer, b: &mut Peer) -> EntityKey {
    let temp = a.create(EntityKind::Object, [1.0, 0.0, 1.0], None);
    let mut key = None;
    let converged = tick_until(&mut [a, b], |peers| {
        key = peers[0].confirmed_key(EntityKind::Object, temp);
        key.is_some_and(|key| peers[1].session.entity(key).is_some())
    })
    .await;
    assert!(converged, "object never reached the second participant");
    key.unwrap()
}

/// IDENTIFIER TESTS
mod identifier_tests {
    use super::*;

    /// A created entity is confirmed to its creator and spawned everywhere else
    #[tokio::test]
    async fn creation_confirms_and_spawns() {
        let (addr, server) = start_server().await;
        let mut a = Peer::join(addr).await;
        let mut b = Peer::join(addr).await;
        assert_ne!(a.id(), b.id());

        let key = shared_object(&mut a, &mut b).await;

        assert!(key.id.wire() >= shared::CANONICAL_ID_BASE);
        assert!(a.session.entity(key).is_some());
        assert_eq!(b.session.entity(key).unwrap().owner, a.id());
        assert!(b
            .events
            .contains(&SessionEvent::EntitySpawned { key }));
        assert_eq!(a.session.identifiers().pool(EntityKind::Object).outstanding(), 0);

        server.shutdown();
    }

    /// Two participants offering the same named entity end up sharing one
    #[tokio::test]
    async fn duplicate_creation_converges_on_one_entity() {
        let (addr, server) = start_server().await;
        let mut a = Peer::join(addr).await;
        let mut b = Peer::join(addr).await;

        a.create(EntityKind::Material, [0.0; 3], Some("shared/steel"));
        b.create(EntityKind::Material, [0.0; 3], Some("shared/steel"));

        let settled = tick_until(&mut [&mut a, &mut b], |peers| {
            peers.iter().all(|peer| {
                peer.events.iter().any(|event| {
                    matches!(
                        event,
                        SessionEvent::EntityIdConfirmed { .. } | SessionEvent::EntityRedirected { .. }
                    )
                })
            })
        })
        .await;
        assert!(settled);

        let redirected: Vec<EntityKey> = a
            .events
            .iter()
            .chain(b.events.iter())
            .filter_map(|event| match event {
                SessionEvent::EntityRedirected { winner, .. } => Some(*winner),
                _ => None,
            })
            .collect();
        assert_eq!(redirected.len(), 1, "exactly one creation should lose");

        let winner = redirected[0];
        assert!(a.session.entity(winner).is_some());
        assert!(b.session.entity(winner).is_some());
        assert_eq!(a.session.directory().len(), 1);
        assert_eq!(b.session.directory().len(), 1);

        server.shutdown();
    }
}

/// STATE AND OWNERSHIP TESTS
mod replication_tests {
    use super::*;

    /// Motion of an owned body reaches the other participant over UDP
    #[tokio::test]
    async fn owner_state_is_relayed() {
        let (addr, server) = start_server().await;
        let mut a = Peer::join(addr).await;
        let mut b = Peer::join(addr).await;
        let key = shared_object(&mut a, &mut b).await;

        assert!(a.world.bump(key, [4.0, 0.0, 0.0]));
        let moved = tick_until(&mut [&mut a, &mut b], |peers| {
            peers[1]
                .motion(key)
                .is_some_and(|motion| motion.position[0] > 1.0)
        })
        .await;
        assert!(moved, "state never arrived at the second participant");

        server.shutdown();
    }

    /// Grabbing claims ownership and both sides agree on the new owner
    #[tokio::test]
    async fn grab_moves_ownership_everywhere() {
        let (addr, server) = start_server().await;
        let mut a = Peer::join(addr).await;
        let mut b = Peer::join(addr).await;
        let key = shared_object(&mut a, &mut b).await;
        let b_id = b.id();

        b.session.grab(key).unwrap();
        assert!(b.session.entity(key).unwrap().is_owned_by(b_id));

        let converged = tick_until(&mut [&mut a, &mut b], |peers| {
            peers[0].session.entity(key).is_some_and(|e| e.owner == b_id)
                && peers[1].session.arbitration().claim(key).is_none()
        })
        .await;
        assert!(converged);

        assert!(a.events.contains(&SessionEvent::OwnershipChanged { key, owner: b_id }));
        assert!(a.events.contains(&SessionEvent::GrabChanged {
            key,
            grabber: Some(b_id)
        }));
        assert!(b.session.entity(key).unwrap().is_owned_by(b_id));

        server.shutdown();
    }

    /// A departing owner hands its entities to the server
    #[tokio::test]
    async fn disconnect_releases_ownership() {
        let (addr, server) = start_server().await;
        let mut a = Peer::join(addr).await;
        let mut b = Peer::join(addr).await;
        let key = shared_object(&mut a, &mut b).await;

        a.session.disconnect("test over");
        assert!(a.session.is_torn_down());

        let released = tick_until(&mut [&mut b], |peers| {
            peers[0]
                .session
                .entity(key)
                .is_some_and(|e| e.owner == SERVER_PARTICIPANT)
        })
        .await;
        assert!(released);
        assert!(b.events.contains(&SessionEvent::OwnershipChanged {
            key,
            owner: SERVER_PARTICIPANT
        }));

        server.shutdown();
    }
}
