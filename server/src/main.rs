use clap::Parser;
use log::info;

use server::{AdjustmentConfig, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Authoritative game server")]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 4567)]
    port: u16,

    /// Maximum concurrent clients
    #[arg(long, default_value_t = 32)]
    max_clients: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    info!("Starting server on {}:{}", args.host, args.port);
    let server = Server::new(ServerConfig {
        host: args.host,
        port: args.port,
        max_clients: args.max_clients,
        adjustment: AdjustmentConfig::default(),
    });
    server.run().await
}
