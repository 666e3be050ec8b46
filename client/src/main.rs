//! Headless client driver: connects, wanders for a while, and reports the
//! predicted player position. Useful for soak-testing a server without a
//! display attached.

use std::time::Duration;

use clap::Parser;
use log::info;

use client::{ServerConnection, Simulation};
use shared::{InputState, SIM_TICK_RATE};

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless game client")]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 4567)]
    port: u16,

    /// How many seconds to run before disconnecting
    #[arg(long, default_value_t = 30)]
    seconds: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let addr = format!("{}:{}", args.host, args.port);
    let (connection, handshake) = ServerConnection::connect(&addr).await?;
    let mut simulation = Simulation::new(connection, handshake);

    let frame_interval = Duration::from_secs(1) / SIM_TICK_RATE;
    let mut timer = tokio::time::interval(frame_interval);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.seconds);
    let mut frame: u64 = 0;

    while tokio::time::Instant::now() < deadline {
        timer.tick().await;

        // Change wander direction every couple of seconds.
        if frame % (SIM_TICK_RATE as u64 * 2) == 0 {
            let mut held = InputState::default();
            match (frame / (SIM_TICK_RATE as u64 * 2)) % 4 {
                0 => held.right = true,
                1 => held.down = true,
                2 => held.left = true,
                _ => held.up = true,
            }
            simulation.input.set_held(held);
        }

        simulation.run_frame().await?;
        frame += 1;

        if frame % (SIM_TICK_RATE as u64 * 5) == 0 {
            let player = simulation.world.player();
            info!(
                "tick {}: player at ({:.1}, {:.1}), {} entities in view",
                simulation.current_tick(),
                player.position.x,
                player.position.y,
                simulation.world.entities.len()
            );
        }
    }

    Ok(())
}
