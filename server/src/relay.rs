//! Turns inbound participant messages into registry changes and the
//! messages that announce them.

use crate::registry::{ClaimOutcome, CreateOutcome, Departure, EntityRegistry};
use log::{debug, warn};
use shared::protocol::{
    EntityConfirmed, EntityRedundant, GrabChanged, OwnershipChanged, Pong, RemoveEntity,
};
use shared::{Message, MessageReader, ParticipantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    To(ParticipantId),
    /// Everyone except the given participant.
    Others(ParticipantId),
    Everyone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub route: Route,
    pub message: Message,
}

impl Routed {
    pub fn to(participant: ParticipantId, message: Message) -> Self {
        Self {
            route: Route::To(participant),
            message,
        }
    }

    pub fn others(sender: ParticipantId, message: Message) -> Self {
        Self {
            route: Route::Others(sender),
            message,
        }
    }

    pub fn everyone(message: Message) -> Self {
        Self {
            route: Route::Everyone,
            message,
        }
    }
}

/// Handles one reliable message from `sender`.
///
/// `Connect` and `Disconnect` are session-level and handled by the caller.
pub fn route_reliable(
    registry: &mut EntityRegistry,
    sender: ParticipantId,
    message: Message,
    now_ms: u32,
) -> Vec<Routed> {
    match message {
        Message::Ping(ping) => vec![Routed::to(
            sender,
            Message::Pong(Pong {
                client_time_ms: ping.client_time_ms,
                server_time_ms: now_ms,
            }),
        )],

        Message::CreateEntity(request) => {
            let (kind, temp_id) = (request.kind, request.temp_id);
            match registry.create(sender, request, now_ms) {
                Ok(CreateOutcome::Created(key)) => {
                    let mut routed = vec![Routed::to(
                        sender,
                        Message::EntityConfirmed(EntityConfirmed {
                            kind,
                            temp_id,
                            canonical_id: key.id.wire(),
                        }),
                    )];
                    if let Some(record) = registry.get(key) {
                        routed.push(Routed::others(
                            sender,
                            Message::EntitySpawned(record.spawn_message()),
                        ));
                    }
                    routed
                }
                Ok(CreateOutcome::Redundant { winner }) => vec![Routed::to(
                    sender,
                    Message::EntityRedundant(EntityRedundant {
                        kind,
                        temp_id,
                        winner_id: winner.id.wire(),
                    }),
                )],
                Err(e) => {
                    warn!("Participant {} could not create {} tmp#{}: {}", sender, kind, temp_id, e);
                    Vec::new()
                }
            }
        }

        Message::RemoveEntity(RemoveEntity { key }) => match registry.remove(key) {
            Ok(_) => vec![Routed::others(sender, Message::RemoveEntity(RemoveEntity { key }))],
            Err(e) => {
                debug!("Participant {} removal ignored: {}", sender, e);
                Vec::new()
            }
        },

        Message::OwnershipClaim(claim) => match registry.claim(sender, claim.key, claim.stamp) {
            // the claimant hears back too, which ends its anticipation
            Ok(ClaimOutcome::Accepted(stamp)) => vec![Routed::everyone(Message::OwnershipChanged(
                OwnershipChanged {
                    key: claim.key,
                    stamp,
                },
            ))],
            Ok(ClaimOutcome::Rejected(stamp)) => vec![Routed::to(
                sender,
                Message::OwnershipChanged(OwnershipChanged {
                    key: claim.key,
                    stamp,
                }),
            )],
            Err(e) => {
                warn!("Participant {} claim ignored: {}", sender, e);
                Vec::new()
            }
        },

        Message::GrabChanged(grab) => match registry.set_grab(sender, grab.key, grab.grabber) {
            Ok(true) => vec![Routed::others(sender, Message::GrabChanged(grab))],
            Ok(false) => {
                // tell the sender how things really stand
                let grabber = registry.get(grab.key).and_then(|record| record.grabber);
                vec![Routed::to(
                    sender,
                    Message::GrabChanged(GrabChanged {
                        key: grab.key,
                        grabber,
                    }),
                )]
            }
            Err(e) => {
                debug!("Participant {} grab ignored: {}", sender, e);
                Vec::new()
            }
        },

        other => {
            warn!(
                "Unexpected reliable message with tag {} from participant {}",
                other.tag(),
                sender
            );
            Vec::new()
        }
    }
}

/// Announcements for everything a departing participant held.
pub fn route_departure(departure: Departure) -> Vec<Routed> {
    let released = departure.released.into_iter().map(|(key, stamp)| {
        Routed::everyone(Message::OwnershipChanged(OwnershipChanged { key, stamp }))
    });
    let ungrabbed = departure.ungrabbed.into_iter().map(|key| {
        Routed::everyone(Message::GrabChanged(GrabChanged { key, grabber: None }))
    });
    released.chain(ungrabbed).collect()
}

/// Keeps the state updates `sender` is entitled to send.
///
/// Returns the packed updates to forward, or `None` if nothing survived.
/// Walking stops at the first malformed message.
pub fn filter_state(registry: &mut EntityRegistry, sender: ParticipantId, payload: &[u8]) -> Option<Vec<u8>> {
    let mut relayed = Vec::with_capacity(payload.len());
    for message in MessageReader::new(payload) {
        match message {
            Ok(Message::StateUpdate(update)) => {
                if !registry.accept_state(sender, &update) {
                    debug!("Dropping state for {} from non-owner {}", update.key, sender);
                    continue;
                }
                if let Err(e) = Message::StateUpdate(update).write_to(&mut relayed) {
                    warn!("Could not re-encode state update: {}", e);
                }
            }
            Ok(other) => debug!(
                "Ignoring tag {} on the unreliable channel from {}",
                other.tag(),
                sender
            ),
            Err(e) => {
                warn!("Malformed datagram from participant {}: {}", sender, e);
                break;
            }
        }
    }
    (!relayed.is_empty()).then_some(relayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::{CreateEntity, OwnershipClaim, Ping, StateUpdate};
    use shared::{EntityKey, EntityKind, OwnershipStamp};

    fn create(registry: &mut EntityRegistry, sender: ParticipantId, temp_id: u16, dedupe: Option<&str>) -> Vec<Routed> {
        route_reliable(
            registry,
            sender,
            Message::CreateEntity(CreateEntity {
                kind: EntityKind::Object,
                temp_id,
                dedupe_key: dedupe.map(str::to_string),
                state: vec![1, 2, 3],
            }),
            1_000,
        )
    }

    #[test]
    fn test_ping_is_answered_with_server_time() {
        let mut registry = EntityRegistry::new();
        let routed = route_reliable(
            &mut registry,
            4,
            Message::Ping(Ping { client_time_ms: 77 }),
            1_234,
        );
        assert_eq!(
            routed,
            vec![Routed::to(
                4,
                Message::Pong(Pong {
                    client_time_ms: 77,
                    server_time_ms: 1_234
                })
            )]
        );
    }

    #[test]
    fn test_creation_confirms_and_spawns() {
        let mut registry = EntityRegistry::new();
        let routed = create(&mut registry, 3, 7, None);

        assert_eq!(routed.len(), 2);
        assert_eq!(
            routed[0],
            Routed::to(
                3,
                Message::EntityConfirmed(EntityConfirmed {
                    kind: EntityKind::Object,
                    temp_id: 7,
                    canonical_id: 256
                })
            )
        );
        match &routed[1] {
            Routed {
                route: Route::Others(3),
                message: Message::EntitySpawned(spawned),
            } => {
                assert_eq!(spawned.key, EntityKey::canonical(EntityKind::Object, 256));
                assert_eq!(spawned.stamp, OwnershipStamp::new(3, 1_000));
                assert_eq!(spawned.state, vec![1, 2, 3]);
            }
            other => panic!("expected spawn for others, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_creation_is_redundant() {
        let mut registry = EntityRegistry::new();
        create(&mut registry, 3, 1, Some("lamp"));
        let routed = create(&mut registry, 9, 4, Some("lamp"));

        assert_eq!(
            routed,
            vec![Routed::to(
                9,
                Message::EntityRedundant(EntityRedundant {
                    kind: EntityKind::Object,
                    temp_id: 4,
                    winner_id: 256
                })
            )]
        );
    }

    #[test]
    fn test_losing_claim_is_corrected_privately() {
        let mut registry = EntityRegistry::new();
        create(&mut registry, 3, 0, None);
        let key = EntityKey::canonical(EntityKind::Object, 256);
        let claim = |owner, timestamp| {
            Message::OwnershipClaim(OwnershipClaim {
                key,
                stamp: OwnershipStamp::new(owner, timestamp),
            })
        };

        let lost = route_reliable(&mut registry, 9, claim(9, 1_000), 1_100);
        assert_eq!(
            lost,
            vec![Routed::to(
                9,
                Message::OwnershipChanged(OwnershipChanged {
                    key,
                    stamp: OwnershipStamp::new(3, 1_000)
                })
            )]
        );

        let won = route_reliable(&mut registry, 9, claim(9, 1_050), 1_100);
        assert_eq!(won[0].route, Route::Everyone);
    }

    #[test]
    fn test_departure_announcements() {
        let mut registry = EntityRegistry::new();
        create(&mut registry, 3, 0, None);
        let key = EntityKey::canonical(EntityKind::Object, 256);
        registry.set_grab(3, key, Some(3)).unwrap();

        let routed = route_departure(registry.release_participant(3, 5_000));

        assert_eq!(routed.len(), 2);
        assert!(routed.iter().all(|r| r.route == Route::Everyone));
        assert!(matches!(routed[0].message, Message::OwnershipChanged(_)));
        assert!(matches!(
            routed[1].message,
            Message::GrabChanged(GrabChanged { grabber: None, .. })
        ));
    }

    #[test]
    fn test_state_filter_keeps_owner_updates() {
        let mut registry = EntityRegistry::new();
        create(&mut registry, 3, 0, None);
        create(&mut registry, 9, 0, None);
        let mine = EntityKey::canonical(EntityKind::Object, 256);
        let theirs = EntityKey::canonical(EntityKind::Object, 257);

        let update = |key, state: Vec<u8>| {
            Message::StateUpdate(StateUpdate {
                key,
                stamp: OwnershipStamp::new(3, 1_000),
                state,
            })
        };
        let mut payload = Vec::new();
        update(mine, vec![5]).write_to(&mut payload).unwrap();
        update(theirs, vec![6]).write_to(&mut payload).unwrap();

        let relayed = filter_state(&mut registry, 3, &payload).unwrap();
        let messages: Vec<Message> = MessageReader::new(&relayed).map(|m| m.unwrap()).collect();
        assert_eq!(messages, vec![update(mine, vec![5])]);
        assert_eq!(registry.get(mine).unwrap().state, vec![5]);

        assert!(filter_state(&mut registry, 3, &[0xEE, 1, 2]).is_none());
    }
}
