use clap::Parser;
use client::input::BotInput;
use client::network::Client;
use log::info;
use shared::weapon::WeaponTable;
use shared::{Role, SimConfig, SimContext};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Seed for the input bot
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Stop after this many seconds (runs until interrupted when omitted)
    #[arg(short = 'd', long)]
    duration: Option<u64>,

    /// Simulation ticks per second, must match the server
    #[arg(short = 't', long, default_value = "60")]
    tick_rate: u32,

    /// Commands repeated in every packet
    #[arg(long, default_value = "4")]
    redundancy: usize,

    /// Ticks applied as one step when frames fall behind
    #[arg(long, default_value = "1")]
    resim_batch: u32,
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
        redundant_commands: args.redundancy,
        resim_batch: args.resim_batch,
        ..SimConfig::default()
    };
    config.validate()?;
    let ctx = SimContext::new(
        Role::Client,
        config,
        Default::default(),
        Arc::new(WeaponTable::default()),
    );

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let mut client = Client::new(&args.server, args.fake_ping, ctx, BotInput::new(args.seed)).await?;

    client.run(args.duration.map(Duration::from_secs)).await?;

    Ok(())
}
