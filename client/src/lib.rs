//! # Replication Client Library
//!
//! Participant-side half of the replication protocol. A participant mirrors
//! the shared set of entities, streams state for the entities it owns and
//! negotiates ownership with its peers without a round trip to the server.
//!
//! ## Architecture Overview
//!
//! Everything hangs off one [`session::ReplicationSession`], driven by the
//! host's simulation loop through a single `tick` call. The session never
//! awaits: transports deliver bytes through an inbound queue and accept bytes
//! through a [`channel::Channel`], so the same session runs over the
//! reference TCP/UDP transport or an in-memory one in tests.
//!
//! ### Outbound Traffic
//! Entity state goes out unreliably. Each tick the
//! [`scheduler::UpdateScheduler`] polls the entities that are due, sorts the
//! pending updates by priority and packs as many as fit into one packet.
//! Updates that do not fit keep their priority and go first next tick.
//! Control traffic goes through the [`coalescer::ReliableCoalescer`], which
//! batches a tick's worth of reliable messages into one send.
//!
//! ### Identifiers
//! Locally created entities live under temporary ids until the server
//! answers with a canonical id, or with the id of an equivalent entity that
//! got there first. The [`identifiers::IdentifierAllocator`] hands out the
//! temporary ids and reconciles the answers against the
//! [`directory::Directory`]; caches keyed by entity follow along through
//! [`directory::RekeyObserver`].
//!
//! ### Ownership
//! Each entity carries an ownership stamp. When two of them touch in the
//! local simulation, the [`ownership::Arbitrator`] decides with
//! [`shared::can_take_ownership`] which side owns both, acts on that guess
//! right away and rolls back if the authoritative answer never arrives.
//!
//! ## Module Organization
//!
//! - `entity`: the replicable body seam and per-entity replication state
//! - `directory`: lookup by temporary or canonical id, rekeying
//! - `identifiers`: temporary id pools and reconciliation
//! - `priority`: accrual and thresholds for state updates
//! - `scheduler`: priority-ordered packing of unreliable updates
//! - `coalescer`: per-tick batching of reliable messages
//! - `ownership`: anticipatory ownership claims and rollback
//! - `grab_cache`: who is holding what
//! - `clock`: shared server time and round-trip estimate
//! - `channel`: the transport seam and inbound queue
//! - `dispatch`: splitting received buffers into messages
//! - `session`: the tick loop tying it together
//! - `network`: TCP/UDP reference transport
//! - `demo`: a toy simulation for the headless binary
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::clock::SyncedClock;
//! use client::config::SessionConfig;
//! use client::demo::{DemoFactory, DemoWorld};
//! use client::session::ReplicationSession;
//! use shared::EntityKind;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::default();
//! let connection = client::network::connect("127.0.0.1:8080".parse()?, config.inbound_capacity).await?;
//! let mut session = ReplicationSession::new(
//!     connection.participant,
//!     connection.channel,
//!     SyncedClock::with_server_time(connection.server_time_ms),
//!     connection.inbound,
//!     Box::new(DemoFactory),
//!     config,
//! );
//!
//! let (_motion, body) = DemoWorld::create([0.0, 1.0, 0.0]);
//! session.create_entity(EntityKind::Object, body, None)?;
//! loop {
//!     session.tick(Duration::from_millis(33));
//!     for event in session.drain_events() {
//!         println!("{:?}", event);
//!     }
//! #   break;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Design Notes
//!
//! ### Bandwidth Over Completeness
//! A packet never grows past the configured budget. Entities that miss a
//! tick accumulate priority, so a busy scene degrades to lower update rates
//! rather than dropped entities.
//!
//! ### Optimistic Ownership
//! Waiting a round trip before reacting to a collision looks wrong on
//! screen. Claims take effect locally at once; the rollback window is a
//! multiple of the measured round trip.

pub mod channel;
pub mod clock;
pub mod coalescer;
pub mod config;
pub mod demo;
pub mod directory;
pub mod dispatch;
pub mod entity;
pub mod grab_cache;
pub mod identifiers;
pub mod network;
pub mod ownership;
pub mod priority;
pub mod scheduler;
pub mod session;

pub use config::SessionConfig;
pub use session::{ReplicationSession, SessionError, SessionEvent, TickReport};
