use clap::Parser;
use client::clock::SyncedClock;
use client::config::SessionConfig;
use client::demo::{DemoFactory, DemoWorld};
use client::network::{self, Connection};
use client::session::{ReplicationSession, SessionEvent};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use shared::{EntityKey, EntityKind};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

/// Chance per tick that one of our bodies gets pushed.
const BUMP_CHANCE: f64 = 0.05;

/// Chance per tick that two bodies touch.
const CONTACT_CHANCE: f64 = 0.02;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Replication ticks per second
    #[arg(short = 't', long, default_value = "30")]
    tick_rate: u32,

    /// Objects to create after connecting
    #[arg(short = 'o', long, default_value = "4")]
    objects: usize,

    /// Upper bound for one unreliable packet
    #[arg(short = 'p', long, default_value_t = shared::DEFAULT_MAX_PACKET_BYTES)]
    max_packet_bytes: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let server: SocketAddr = args.server.parse()?;
    let tick = Duration::from_secs_f64(1.0 / f64::from(args.tick_rate.max(1)));

    info!("Starting replication client...");
    info!("Tick rate: {} Hz, packet budget: {} bytes", args.tick_rate, args.max_packet_bytes);

    let config = SessionConfig {
        max_packet_bytes: args.max_packet_bytes,
        ..SessionConfig::default()
    };
    let Connection {
        participant,
        server_time_ms,
        channel,
        inbound,
        tasks,
    } = network::connect(server, config.inbound_capacity).await?;

    let mut session = ReplicationSession::new(
        participant,
        channel,
        SyncedClock::with_server_time(server_time_ms),
        inbound,
        Box::new(DemoFactory),
        config,
    );

    let mut rng = rand::thread_rng();
    let mut world = DemoWorld::new();
    for _ in 0..args.objects {
        let position = [rng.gen_range(-10.0..10.0), 0.0, rng.gen_range(-10.0..10.0)];
        let (handle, body) = DemoWorld::create(position);
        let key = session.create_entity(EntityKind::Object, body, None)?;
        world.track(key, handle);
    }
    // every client offers the same material; the server keeps one
    let (_, material) = DemoWorld::create([0.0; 3]);
    session.create_entity(
        EntityKind::Material,
        material,
        Some("demo/shared-material".to_string()),
    )?;

    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_tick = Instant::now();

    'run: loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let dt = now - last_tick;
                last_tick = now;

                world.step(dt.as_secs_f32());
                if rng.gen_bool(BUMP_CHANCE) {
                    if let Some(key) = world.keys().choose(&mut rng) {
                        let impulse = [rng.gen_range(-2.0..2.0), 0.0, rng.gen_range(-2.0..2.0)];
                        world.bump(*key, impulse);
                    }
                }
                if rng.gen_bool(CONTACT_CHANCE) {
                    simulate_contact(&mut session, &world, &mut rng);
                }

                let report = session.tick(dt);
                if report.updates_sent + report.inbound_messages > 0 {
                    debug!("Tick: {:?}", report);
                }

                for event in session.drain_events() {
                    match event {
                        SessionEvent::EntityIdConfirmed { kind, temp_id, canonical_id } => {
                            info!("{} tmp#{} confirmed as #{}", kind, temp_id, canonical_id);
                            world.rekey(
                                EntityKey::temporary(kind, temp_id),
                                EntityKey::canonical(kind, canonical_id),
                            );
                        }
                        SessionEvent::EntityRedirected { kind, temp_id, winner } => {
                            info!("{} tmp#{} duplicated {}", kind, temp_id, winner);
                            world.remove(EntityKey::temporary(kind, temp_id));
                        }
                        SessionEvent::EntityRemoved { key } => world.remove(key),
                        SessionEvent::Disconnected { reason } => {
                            warn!("Disconnected: {}", reason);
                            break 'run;
                        }
                        other => info!("{:?}", other),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                session.disconnect("client shutting down");
                break 'run;
            }
        }
    }

    // give the writer a moment to flush the goodbye
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(tasks);
    info!("Client stopped");
    Ok(())
}

/// Touches one of our owned bodies against a random other entity.
fn simulate_contact<R: Rng>(
    session: &mut ReplicationSession<client::channel::QueuedChannel, SyncedClock>,
    world: &DemoWorld,
    rng: &mut R,
) {
    let local = session.local_participant();
    let ours: Vec<EntityKey> = world
        .keys()
        .into_iter()
        .filter(|key| !key.id.is_temporary())
        .filter(|key| session.entity(*key).is_some_and(|e| e.is_owned_by(local)))
        .collect();
    let others: Vec<EntityKey> = session
        .directory()
        .keys()
        .into_iter()
        .filter(|key| key.kind == EntityKind::Object && !ours.contains(key))
        .collect();

    if let (Some(ours), Some(theirs)) = (ours.choose(rng), others.choose(rng)) {
        match session.report_contact(*ours, *theirs) {
            Ok(outcome) => debug!("Contact {} -> {}: {:?}", ours, theirs, outcome),
            Err(e) => warn!("Contact failed: {}", e),
        }
    }
}
