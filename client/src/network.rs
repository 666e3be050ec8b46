//! Connection to the server: handshake, the receive task, and the send
//! helpers the simulation uses.
//!
//! The receive task decodes batch headers and feeds the contained
//! messages into the replication sequencer. Tick adjustments cross over to
//! the simulation through a small shared state: the receive task parks a
//! pending adjustment, the simulation transfers it out exactly once per
//! frame, and the applied iteration is echoed back on every send so the
//! server knows when to stop repeating the correction.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use shared::sorter::{MessageSorter, Validity};
use shared::wire;
use shared::{
    EntityState, InputState, Message, MessageContent, Position, ReplicationPhase,
    REPLICATION_TICK_OFFSET,
};

/// The sequencer remote state drains through, keyed by server tick.
pub type ReplicationSorter = Arc<Mutex<MessageSorter<Message>>>;

/// What the server told us when the connection was accepted.
#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    pub entity_id: u32,
    pub current_tick: u32,
    pub spawn: Position,
}

#[derive(Debug, Default)]
struct AdjustmentState {
    /// Pending correction, accumulated until the simulation transfers it.
    pending: Mutex<i64>,
    /// Iteration of the last adjustment we applied, echoed on every send.
    applied_iteration: AtomicU8,
}

pub struct ServerConnection {
    write_half: OwnedWriteHalf,
    sorter: ReplicationSorter,
    adjustment: Arc<AdjustmentState>,
    confirmed_ticks: Arc<AtomicU32>,
    read_task: JoinHandle<()>,
}

impl ServerConnection {
    /// Connects and waits for the connection response. Any further
    /// messages in the first batch already belong to the replication
    /// stream and are seeded into the sequencer.
    pub async fn connect(addr: &str) -> Result<(Self, Handshake), Box<dyn std::error::Error>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut read_half, write_half) = stream.into_split();

        let (handshake, trailing) = read_handshake(&mut read_half).await?;
        info!(
            "Connected: entity {} at ({:.1}, {:.1}), server tick {}",
            handshake.entity_id, handshake.spawn.x, handshake.spawn.y, handshake.current_tick
        );

        // Remote state is replicated a fixed distance behind the server so
        // in-flight updates land ahead of the drain point.
        let replication_start = (i64::from(handshake.current_tick) + REPLICATION_TICK_OFFSET)
            .max(0) as u32;
        let sorter: ReplicationSorter =
            Arc::new(Mutex::new(MessageSorter::new(replication_start)));
        {
            let mut sorter = sorter.lock().unwrap();
            for message in trailing {
                sorter.push(message.tick_timestamp, message);
            }
        }

        let adjustment = Arc::new(AdjustmentState::default());
        let confirmed_ticks = Arc::new(AtomicU32::new(0));
        let read_task = tokio::spawn(receive_loop(
            read_half,
            Arc::clone(&sorter),
            Arc::clone(&adjustment),
            Arc::clone(&confirmed_ticks),
        ));

        Ok((
            Self {
                write_half,
                sorter,
                adjustment,
                confirmed_ticks,
                read_task,
            },
            handshake,
        ))
    }

    pub fn sorter(&self) -> ReplicationSorter {
        Arc::clone(&self.sorter)
    }

    /// Total ticks the server has confirmed sending us state for.
    pub fn confirmed_ticks(&self) -> u32 {
        self.confirmed_ticks.load(Ordering::Acquire)
    }

    /// Takes the pending tick adjustment, at most once per posting.
    pub fn transfer_tick_adjustment(&self) -> i64 {
        std::mem::take(&mut *self.adjustment.pending.lock().unwrap())
    }

    /// Sends the input applied to `tick` for our player entity.
    pub async fn send_input(
        &mut self,
        tick: u32,
        entity_id: u32,
        input: InputState,
    ) -> std::io::Result<()> {
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
        self.send(&message).await
    }

    /// Keeps the tick-diff stream and the server's timeout tracking alive
    /// on ticks with nothing to say.
    pub async fn send_heartbeat(&mut self, tick: u32) -> std::io::Result<()> {
        let message = Message {
            tick_timestamp: tick,
            content: MessageContent::EntityUpdate {
                entities: Vec::new(),
            },
        };
        self.send(&message).await
    }

    pub async fn send_tile_update_request(
        &mut self,
        tick: u32,
        tile_x: u32,
        tile_y: u32,
        layer_index: u8,
        sprite_id: u32,
    ) -> std::io::Result<()> {
        let message = Message {
            tick_timestamp: tick,
            content: MessageContent::TileUpdateRequest {
                tile_x,
                tile_y,
                layer_index,
                sprite_id,
            },
        };
        self.send(&message).await
    }

    async fn send(&mut self, message: &Message) -> std::io::Result<()> {
        let echo = self.adjustment.applied_iteration.load(Ordering::Acquire);
        wire::write_client_message(&mut self.write_half, echo, message).await
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

async fn read_handshake(
    read_half: &mut OwnedReadHalf,
) -> Result<(Handshake, Vec<Message>), Box<dyn std::error::Error>> {
    let header = wire::read_batch_header(read_half).await?;
    let mut handshake = None;
    let mut trailing = Vec::new();

    for _ in 0..header.message_count {
        let message = wire::read_message(read_half).await?;
        match message.content {
            MessageContent::ConnectionResponse {
                entity_id,
                current_tick,
                spawn_x,
                spawn_y,
            } if handshake.is_none() => {
                handshake = Some(Handshake {
                    entity_id,
                    current_tick,
                    spawn: Position {
                        x: spawn_x,
                        y: spawn_y,
                    },
                });
            }
            _ => trailing.push(message),
        }
    }

    match handshake {
        Some(handshake) => Ok((handshake, trailing)),
        None => Err("server's first batch carried no connection response".into()),
    }
}

async fn receive_loop(
    mut read_half: OwnedReadHalf,
    sorter: ReplicationSorter,
    adjustment: Arc<AdjustmentState>,
    confirmed_ticks: Arc<AtomicU32>,
) {
    loop {
        let header = match wire::read_batch_header(&mut read_half).await {
            Ok(header) => header,
            Err(err) => {
                warn!("Server connection closed: {}", err);
                return;
            }
        };

        if header.adjustment != 0 {
            let applied = adjustment.applied_iteration.load(Ordering::Acquire);
            // Only accept an adjustment for the iteration we are at; a
            // repeat of one we already applied (still echoing back to the
            // server) must not double-correct.
            if header.iteration == applied {
                let mut pending = adjustment.pending.lock().unwrap();
                *pending += i64::from(header.adjustment);
                adjustment
                    .applied_iteration
                    .store(applied.wrapping_add(1), Ordering::Release);
                debug!(
                    "Accepted tick adjustment {} (iteration {})",
                    header.adjustment, header.iteration
                );
            }
        }

        confirmed_ticks.fetch_add(u32::from(header.confirmed_tick_count), Ordering::AcqRel);

        for _ in 0..header.message_count {
            let message = match wire::read_message(&mut read_half).await {
                Ok(message) => message,
                Err(err) => {
                    error!("Failed to read batched message: {}", err);
                    return;
                }
            };

            let mut sorter = sorter.lock().unwrap();
            let result = sorter.push(message.tick_timestamp, message);
            if result.validity != Validity::Valid {
                warn!(
                    "Dropped replicated message ({:?}, diff {}).",
                    result.validity, result.diff
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::wire::BatchHeader;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn server_with_first_batch(batch: Vec<u8>) -> (String, JoinHandle<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&batch).await.unwrap();
            stream
        });
        (addr, handle)
    }

    fn response_batch(current_tick: u32) -> Vec<u8> {
        let response = Message {
            tick_timestamp: current_tick,
            content: MessageContent::ConnectionResponse {
                entity_id: 42,
                current_tick,
                spawn_x: 64.0,
                spawn_y: 96.0,
            },
        };
        let framed = wire::frame_message(&response).unwrap();
        let header = BatchHeader {
            adjustment: 0,
            iteration: 0,
            message_count: 1,
            confirmed_tick_count: 0,
        };
        let mut batch = header.encode().to_vec();
        batch.extend_from_slice(&framed);
        batch
    }

    #[tokio::test]
    async fn test_handshake_parses_connection_response() {
        let (addr, server) = server_with_first_batch(response_batch(100)).await;
        let (connection, handshake) = ServerConnection::connect(&addr).await.unwrap();

        assert_eq!(handshake.entity_id, 42);
        assert_eq!(handshake.current_tick, 100);
        assert_eq!(handshake.spawn.x, 64.0);

        let sorter = connection.sorter();
        assert_eq!(
            sorter.lock().unwrap().current_tick(),
            (100i64 + REPLICATION_TICK_OFFSET) as u32
        );
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_adjustment_applied_once_per_iteration() {
        let (addr, server) = server_with_first_batch(response_batch(100)).await;
        let (connection, _) = ServerConnection::connect(&addr).await.unwrap();
        let mut stream = server.await.unwrap();

        // The same (adjustment, iteration 0) batch sent twice: the repeat
        // must not double the pending correction.
        let header = BatchHeader {
            adjustment: 3,
            iteration: 0,
            message_count: 0,
            confirmed_tick_count: 1,
        };
        stream.write_all(&header.encode()).await.unwrap();
        stream.write_all(&header.encode()).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(connection.transfer_tick_adjustment(), 3);
        // Transferred at most once.
        assert_eq!(connection.transfer_tick_adjustment(), 0);
        assert_eq!(connection.confirmed_ticks(), 2);
    }

    #[tokio::test]
    async fn test_batched_messages_land_in_sorter() {
        let (addr, server) = server_with_first_batch(response_batch(100)).await;
        let (connection, _) = ServerConnection::connect(&addr).await.unwrap();
        let mut stream = server.await.unwrap();

        let replication_tick = (100i64 + REPLICATION_TICK_OFFSET) as u32;
        let update = Message {
            tick_timestamp: replication_tick + 2,
            content: MessageContent::EntityUpdate {
                entities: vec![EntityState::delete(7)],
            },
        };
        let framed = wire::frame_message(&update).unwrap();
        let header = BatchHeader {
            adjustment: 0,
            iteration: 0,
            message_count: 1,
            confirmed_tick_count: 1,
        };
        let mut batch = header.encode().to_vec();
        batch.extend_from_slice(&framed);
        stream.write_all(&batch).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let sorter = connection.sorter();
        let mut sorter = sorter.lock().unwrap();
        for _ in 0..2 {
            let tick = sorter.current_tick();
            let drained = sorter.start_receive(tick);
            assert!(drained.is_empty());
            sorter.end_receive();
        }
        let tick = sorter.current_tick();
        let drained = sorter.start_receive(tick);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].tick_timestamp, replication_tick + 2);
    }
}
