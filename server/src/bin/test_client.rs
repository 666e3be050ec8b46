//! Minimal scripted client for poking a running server: performs the
//! handshake, walks in a direction, applies the server's tick adjustments,
//! and prints every batch header it receives.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpStream;

use shared::wire;
use shared::{
    EntityState, InputState, Message, MessageContent, ReplicationPhase, SIM_TICK_RATE,
};

#[derive(Parser, Debug)]
#[command(about = "Scripted test client")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 4567)]
    port: u16,

    /// How many seconds to keep walking
    #[arg(long, default_value_t = 5)]
    seconds: u64,
}

#[derive(Default)]
struct AdjustmentState {
    pending: AtomicI64,
    applied_iteration: AtomicU8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let stream = TcpStream::connect(format!("{}:{}", args.host, args.port)).await?;
    stream.set_nodelay(true)?;
    let (mut read_half, mut write_half) = stream.into_split();

    // Handshake: the first batch carries the connection response.
    let header = wire::read_batch_header(&mut read_half).await?;
    let mut entity_id = 0;
    let mut tick = 0;
    for _ in 0..header.message_count {
        let message = wire::read_message(&mut read_half).await?;
        if let MessageContent::ConnectionResponse {
            entity_id: id,
            current_tick,
            ..
        } = message.content
        {
            entity_id = id;
            tick = current_tick;
        }
    }
    println!("connected as entity {} at server tick {}", entity_id, tick);

    let adjustment = Arc::new(AdjustmentState::default());
    let reader_adjustment = Arc::clone(&adjustment);
    let reader = tokio::spawn(async move {
        loop {
            let header = match wire::read_batch_header(&mut read_half).await {
                Ok(header) => header,
                Err(_) => break,
            };
            println!(
                "batch: adjustment {} (iteration {}), {} messages, {} ticks confirmed",
                header.adjustment,
                header.iteration,
                header.message_count,
                header.confirmed_tick_count
            );

            if header.adjustment != 0 {
                let applied = reader_adjustment.applied_iteration.load(Ordering::Acquire);
                if header.iteration == applied {
                    reader_adjustment
                        .pending
                        .fetch_add(i64::from(header.adjustment), Ordering::AcqRel);
                    reader_adjustment
                        .applied_iteration
                        .store(applied.wrapping_add(1), Ordering::Release);
                }
            }

            for _ in 0..header.message_count {
                match wire::read_message(&mut read_half).await {
                    Ok(message) => println!("  message: {:?}", message),
                    Err(_) => return,
                }
            }
        }
    });

    let input = InputState {
        right: true,
        ..Default::default()
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.seconds);
    let mut timer = tokio::time::interval(Duration::from_secs(1) / SIM_TICK_RATE);
    while tokio::time::Instant::now() < deadline {
        timer.tick().await;

        let correction = adjustment.pending.swap(0, Ordering::AcqRel);
        if correction != 0 {
            println!("applying tick adjustment {}", correction);
            tick = (i64::from(tick) + correction).max(0) as u32;
        }

        let echo = adjustment.applied_iteration.load(Ordering::Acquire);
        let message = Message {
            tick_timestamp: tick,
            content: MessageContent::EntityUpdate {
                entities: vec![EntityState {
                    id: entity_id,
                    phase: ReplicationPhase::Update,
                    position: None,
                    movement: None,
                    input: Some(input),
                }],
            },
        };
        wire::write_client_message(&mut write_half, echo, &message).await?;
        tick = tick.wrapping_add(1);
    }

    drop(write_half);
    let _ = reader.await;
    Ok(())
}
