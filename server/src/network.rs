//! Transport layer: accepting connections, the per-connection receive and
//! write tasks, and the tick/send loop.
//!
//! Two execution contexts touch shared state. The receive tasks record
//! tick diffs, confirm adjustment iterations and push inputs into the
//! sequencer; the tick loop runs the simulation and flushes batches. All
//! cross-context state lives behind the client manager lock, atomics, or
//! tightly scoped mutexes on the connection itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};

use shared::tick::{TickAccumulator, TickHandle};
use shared::wire::{self, BatchHeader};
use shared::{Message, MessageContent, NETWORK_TICK_RATE, SIM_TICK_RATE};

use crate::client::{AdjustmentConfig, ClientConnection};
use crate::client_manager::ClientManager;
use crate::game::{InputSorter, SimEvent, Simulation, TickOutput};
use crate::tiles::TileRequest;

/// A client that stays silent this long is dropped.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// The batch header's message count is a single byte.
const MAX_BATCH_MESSAGES: usize = u8::MAX as usize;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    pub adjustment: AdjustmentConfig,
}

pub struct Server {
    config: ServerConfig,
    clients: Arc<RwLock<ClientManager>>,
    simulation: Simulation,
    event_tx: mpsc::UnboundedSender<SimEvent>,
    event_rx: mpsc::UnboundedReceiver<SimEvent>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
            simulation: Simulation::new(1),
            event_tx,
            event_rx,
            config,
        }
    }

    /// Binds the listener, spawns the accept task, and runs the tick/send
    /// loop until shutdown.
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Server listening on {}", addr);

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.clients),
            self.event_tx.clone(),
            self.simulation.input_sorter(),
            self.simulation.tick_handle(),
            self.config.adjustment.clone(),
        ));

        self.tick_loop().await;
        Ok(())
    }

    async fn tick_loop(&mut self) {
        let sim_interval = Duration::from_secs(1) / SIM_TICK_RATE;
        let net_interval = Duration::from_secs(1) / NETWORK_TICK_RATE;

        let mut accumulator = TickAccumulator::new(sim_interval);
        let mut sim_timer = tokio::time::interval(sim_interval);
        let mut net_timer = tokio::time::interval(net_interval);
        let mut timeout_timer = tokio::time::interval(Duration::from_secs(1));
        let mut last_instant = Instant::now();
        let mut pending_events: Vec<SimEvent> = Vec::new();

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => pending_events.push(event),
                        None => break,
                    }
                }
                _ = sim_timer.tick() => {
                    let now = Instant::now();
                    let due = accumulator.add_time(now - last_instant);
                    last_instant = now;

                    for _ in 0..due {
                        let events = std::mem::take(&mut pending_events);
                        let sent_tick = self.simulation.current_tick();
                        let output = self.simulation.run_tick(events);
                        self.queue_outputs(sent_tick, output).await;
                    }
                }
                _ = net_timer.tick() => {
                    self.flush_batches().await;
                }
                _ = timeout_timer.tick() => {
                    self.disconnect_timed_out(&mut pending_events).await;
                }
            }
        }
    }

    /// Frames this tick's messages and parks them on each recipient's send
    /// queue for the next network flush.
    async fn queue_outputs(&self, sent_tick: u32, output: TickOutput) {
        if output.messages.is_empty() {
            return;
        }

        let clients = self.clients.read().await;
        for outbound in output.messages {
            let Some(conn) = clients.get_client(outbound.client_id) else {
                continue;
            };
            let framed = match wire::frame_message(&outbound.message) {
                Ok(framed) => framed,
                Err(err) => {
                    error!(
                        "Failed to frame message for client {}: {}",
                        outbound.client_id, err
                    );
                    continue;
                }
            };
            // The connection response anchors confirmed-tick bookkeeping:
            // everything after this tick counts as unconfirmed until sent.
            if matches!(
                outbound.message.content,
                MessageContent::ConnectionResponse { .. }
            ) {
                conn.set_latest_sent_sim_tick(sent_tick);
            }
            conn.queue_message(framed);
        }
    }

    /// Builds and sends one batch per client: header first, then up to 255
    /// queued messages.
    async fn flush_batches(&self) {
        let current_tick = self.simulation.current_tick();
        let clients = self.clients.read().await;

        for conn in clients.clients() {
            let latest_sent = conn.latest_sent_sim_tick();
            if latest_sent == 0 {
                // Connection response not out yet, nothing to confirm
                // against.
                continue;
            }
            let newest_complete = current_tick.wrapping_sub(1);
            let confirmed = newest_complete.wrapping_sub(latest_sent).min(u8::MAX as u32);
            if confirmed == 0 {
                continue;
            }

            let adjustment = conn.get_tick_adjustment(&self.config.adjustment);
            let messages = conn.drain_send_queue(MAX_BATCH_MESSAGES);

            let header = BatchHeader {
                adjustment: adjustment.adjustment,
                iteration: adjustment.iteration,
                message_count: messages.len() as u8,
                confirmed_tick_count: confirmed as u8,
            };

            let mut batch =
                Vec::with_capacity(header.encode().len() + messages.iter().map(Vec::len).sum::<usize>());
            batch.extend_from_slice(&header.encode());
            for framed in &messages {
                batch.extend_from_slice(framed);
            }

            if conn.forward_batch(batch) {
                conn.add_confirmed_ticks(confirmed);
            }
        }
    }

    async fn disconnect_timed_out(&self, pending_events: &mut Vec<SimEvent>) {
        let timed_out = {
            let clients = self.clients.read().await;
            clients.timed_out_clients(CLIENT_TIMEOUT)
        };
        if timed_out.is_empty() {
            return;
        }

        let mut clients = self.clients.write().await;
        for client_id in timed_out {
            warn!("Client {} timed out", client_id);
            clients.remove_client(client_id);
            pending_events.push(SimEvent::ClientDisconnected { client_id });
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    clients: Arc<RwLock<ClientManager>>,
    event_tx: mpsc::UnboundedSender<SimEvent>,
    input_sorter: InputSorter,
    tick_handle: TickHandle,
    adjustment: AdjustmentConfig,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("Accept failed: {}", err);
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", addr, err);
        }

        let client_id = {
            let mut manager = clients.write().await;
            match manager.allocate_client_id() {
                Some(id) => id,
                None => {
                    warn!("Refusing connection from {}: server full", addr);
                    continue;
                }
            }
        };

        let (read_half, write_half) = stream.into_split();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(ClientConnection::new(client_id, addr, batch_tx));

        clients.write().await.add_client(Arc::clone(&conn));
        if event_tx
            .send(SimEvent::ClientConnected { client_id })
            .is_err()
        {
            return;
        }

        tokio::spawn(write_loop(client_id, write_half, batch_rx));
        tokio::spawn(receive_loop(
            conn,
            read_half,
            Arc::clone(&clients),
            event_tx.clone(),
            input_sorter.clone(),
            tick_handle.clone(),
            adjustment.clone(),
        ));
    }
}

/// Owns the write half; batches arrive fully built from the tick loop.
async fn write_loop(
    client_id: u32,
    mut write_half: OwnedWriteHalf,
    mut batch_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(batch) = batch_rx.recv().await {
        if let Err(err) = write_half.write_all(&batch).await {
            debug!("Write to client {} failed: {}", client_id, err);
            break;
        }
    }
}

/// Reads client messages until the connection closes or the client
/// desyncs, then unregisters it.
async fn receive_loop(
    conn: Arc<ClientConnection>,
    mut read_half: OwnedReadHalf,
    clients: Arc<RwLock<ClientManager>>,
    event_tx: mpsc::UnboundedSender<SimEvent>,
    input_sorter: InputSorter,
    tick_handle: TickHandle,
    adjustment: AdjustmentConfig,
) {
    loop {
        let header = match wire::read_client_header(&mut read_half).await {
            Ok(header) => header,
            Err(err) => {
                debug!("Client {} read ended: {}", conn.id, err);
                break;
            }
        };
        let message = match wire::read_message(&mut read_half).await {
            Ok(message) => message,
            Err(err) => {
                debug!("Client {} message read failed: {}", conn.id, err);
                break;
            }
        };

        conn.refresh_last_seen();
        conn.confirm_adj_iteration(header);

        let diff = i64::from(message.tick_timestamp) - i64::from(tick_handle.get());
        if conn.record_tick_diff(diff, &adjustment).is_err() {
            break;
        }

        handle_client_message(&conn, &message, &input_sorter, &event_tx);
    }

    clients.write().await.remove_client(conn.id);
    let _ = event_tx.send(SimEvent::ClientDisconnected { client_id: conn.id });
}

fn handle_client_message(
    conn: &ClientConnection,
    message: &Message,
    input_sorter: &InputSorter,
    event_tx: &mpsc::UnboundedSender<SimEvent>,
) {
    match &message.content {
        // An empty entity list is a heartbeat: it still refreshed the
        // timeout and fed the tick-diff history above.
        MessageContent::EntityUpdate { entities } => {
            for state in entities {
                if let Some(input) = state.input {
                    Simulation::sort_input(input_sorter, conn.id, message.tick_timestamp, input);
                }
            }
        }
        MessageContent::TileUpdateRequest {
            tile_x,
            tile_y,
            layer_index,
            sprite_id,
        } => {
            let _ = event_tx.send(SimEvent::TileUpdateRequested(TileRequest {
                client_id: conn.id,
                tile_x: *tile_x,
                tile_y: *tile_y,
                layer_index: *layer_index,
                sprite_id: *sprite_id,
            }));
        }
        other => {
            warn!(
                "Client {} sent unexpected message {:?}, ignoring.",
                conn.id, other
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{EntityState, InputState, ReplicationPhase};

    fn make_conn() -> (Arc<ClientConnection>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ClientConnection::new(
                1,
                "127.0.0.1:9000".parse().unwrap(),
                tx,
            )),
            rx,
        )
    }

    #[test]
    fn test_input_message_lands_in_sorter() {
        let (conn, _rx) = make_conn();
        let sim = Simulation::new(0);
        let sorter = sim.input_sorter();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();

        let input = InputState {
            up: true,
            ..Default::default()
        };
        let message = Message {
            tick_timestamp: 2,
            content: MessageContent::EntityUpdate {
                entities: vec![EntityState {
                    id: 9,
                    phase: ReplicationPhase::Update,
                    position: None,
                    movement: None,
                    input: Some(input),
                }],
            },
        };
        handle_client_message(&conn, &message, &sorter, &event_tx);

        let mut sorter = sorter.lock().unwrap();
        let drained = sorter.start_receive(0);
        assert!(drained.is_empty());
        sorter.end_receive();
        let drained = sorter.start_receive(1);
        assert!(drained.is_empty());
        sorter.end_receive();
        let drained = sorter.start_receive(2);
        assert_eq!(drained, vec![(1, input)]);
    }

    #[test]
    fn test_heartbeat_produces_no_input() {
        let (conn, _rx) = make_conn();
        let sim = Simulation::new(0);
        let sorter = sim.input_sorter();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();

        let message = Message {
            tick_timestamp: 1,
            content: MessageContent::EntityUpdate {
                entities: Vec::new(),
            },
        };
        handle_client_message(&conn, &message, &sorter, &event_tx);

        let mut sorter = sorter.lock().unwrap();
        assert!(sorter.start_receive(0).is_empty());
    }

    #[test]
    fn test_tile_request_becomes_event() {
        let (conn, _rx) = make_conn();
        let sim = Simulation::new(0);
        let sorter = sim.input_sorter();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let message = Message {
            tick_timestamp: 1,
            content: MessageContent::TileUpdateRequest {
                tile_x: 4,
                tile_y: 5,
                layer_index: 2,
                sprite_id: 77,
            },
        };
        handle_client_message(&conn, &message, &sorter, &event_tx);

        let event = event_rx.try_recv().unwrap();
        let SimEvent::TileUpdateRequested(request) = event else {
            panic!("expected tile request event");
        };
        assert_eq!(request.client_id, 1);
        assert_eq!(request.tile_x, 4);
        assert_eq!(request.layer_index, 2);
        assert_eq!(request.sprite_id, 77);
    }
}
