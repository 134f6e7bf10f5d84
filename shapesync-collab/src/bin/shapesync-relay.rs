use clap::Parser;
use shapesync_collab::{RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "shapesync-relay")]
#[command(version, about = "Stateless WebSocket relay for shapesync rooms", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Maximum connections per room
    #[arg(long, default_value_t = 100)]
    max_peers: usize,

    /// Frames buffered per room before slow connections are resynced
    #[arg(long, default_value_t = 256)]
    room_capacity: usize,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let relay = RelayServer::new(RelayConfig {
        bind_addr: args.bind,
        max_peers_per_room: args.max_peers,
        room_capacity: args.room_capacity,
    });

    log::info!("Starting shapesync relay on {}", relay.bind_addr());
    if let Err(e) = relay.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
