use clap::Parser;
use log::info;
use server::network::Server;
use shared::weapon::WeaponTable;
use shared::{Role, SimConfig, SimContext};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the UDP socket to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Simulation ticks per second
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "16")]
    max_clients: usize,

    /// Seconds of silence before a client is dropped
    #[arg(long, default_value = "5")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = SimConfig {
        tick_rate: args.tick_rate,
        max_clients: args.max_clients,
        client_timeout: Duration::from_secs(args.timeout),
        ..SimConfig::default()
    };
    config.validate()?;

    let ctx = SimContext::new(
        Role::Server,
        config,
        Default::default(),
        Arc::new(WeaponTable::default()),
    );

    let addr = format!("{}:{}", args.host, args.port);
    info!("Starting server at {} ({} Hz, {} clients max)", addr, args.tick_rate, args.max_clients);

    let mut server = Server::new(&addr, ctx).await?;
    server.run().await?;

    Ok(())
}
