//! # Replication Relay Server Library
//!
//! Reference server for the replication protocol. Participants connect over
//! TCP for reliable traffic and send entity state over UDP; the server
//! issues canonical entity ids, keeps the authoritative ownership table and
//! relays state between participants.
//!
//! ## Core Responsibilities
//!
//! ### Identifier Issuance
//! Each entity kind has its own canonical id counter starting at 256, above
//! the range participants use for temporary ids. Creations that name an
//! existing dedupe key are answered with the id of the entity that got
//! there first.
//!
//! ### Ownership Arbitration
//! Claims are judged with [`shared::can_take_ownership`], the same rule the
//! participants use to anticipate the outcome. Accepted claims are announced
//! to everyone, rejected ones are answered privately with the stamp that
//! stands. Entities held by a participant that leaves go to the server.
//!
//! ### State Relay
//! State updates are forwarded only when they come from the entity's
//! current owner. The server does not simulate anything itself.
//!
//! ## Architecture Design
//!
//! ### Single Event Loop
//! Network tasks only move bytes. Every registry change happens on the main
//! loop, in the order messages arrive, so no locking is needed around the
//! entity table.
//!
//! ### Coalesced Reliable Output
//! Reliable messages for a participant collect in an outbox and go out as
//! one frame per tick.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Participant ids, capacity, UDP address binding, timeouts and outboxes.
//!
//! ### Registry Module (`registry`)
//! The authoritative entity table.
//!
//! ### Relay Module (`relay`)
//! Maps inbound messages onto registry changes and the announcements they
//! cause.
//!
//! ### Network Module (`network`)
//! Sockets, background tasks and the tick loop.

pub mod client_manager;
pub mod network;
pub mod registry;
pub mod relay;

pub use network::{Server, ServerConfig, ServerHandle};
