use clap::Parser;
use log::info;
use server::network::{Server, ServerConfig};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port for both the TCP stream and UDP datagrams
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Reliable flushes per second
    #[arg(short, long, default_value = "30")]
    tick_rate: u32,

    /// Maximum number of concurrent participants
    #[arg(short, long, default_value = "16")]
    max_clients: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ServerConfig {
        tick_duration: Duration::from_secs_f64(1.0 / f64::from(args.tick_rate.max(1))),
        max_clients: args.max_clients,
        ..ServerConfig::default()
    };

    info!("Starting relay server...");
    info!("Tick rate: {} Hz, max participants: {}", args.tick_rate, args.max_clients);

    let address = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&address, config).await?;
    let handle = server.handle();
    let running = tokio::spawn(server.run());

    tokio::select! {
        result = running => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            handle.shutdown();
        }
    }

    Ok(())
}
