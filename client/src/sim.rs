//! The client's predicted simulation frame.
//!
//! Each frame normally runs exactly one tick ahead of the last. A pending
//! server adjustment stretches or shrinks that: a positive adjustment runs
//! extra ticks to catch up, a negative one stalls until the server's clock
//! walks past us again. The replication sequencer drains one server tick
//! per local tick processed, so the same adjustments that steer our clock
//! keep the replication watermark tracking the server's send ticks.

use log::info;

use shared::InputState;

use crate::game::World;
use crate::input::InputManager;
use crate::network::{Handshake, ReplicationSorter, ServerConnection};

pub struct Simulation {
    pub world: World,
    pub input: InputManager,
    connection: ServerConnection,
    sorter: ReplicationSorter,
    current_tick: u32,
    last_sent_input: Option<InputState>,
}

impl Simulation {
    pub fn new(connection: ServerConnection, handshake: Handshake) -> Self {
        let sorter = connection.sorter();
        Self {
            world: World::new(handshake.entity_id, handshake.spawn),
            input: InputManager::new(),
            connection,
            sorter,
            current_tick: handshake.current_tick,
            last_sent_input: None,
        }
    }

    pub fn current_tick(&self) -> u32 {
        self.current_tick
    }

    /// Runs one frame: applies any pending tick adjustment, then simulates
    /// up to the target tick, draining one server tick of replication per
    /// tick processed.
    pub async fn run_frame(&mut self) -> std::io::Result<()> {
        let mut target = i64::from(self.current_tick) + 1;
        let adjustment = self.connection.transfer_tick_adjustment();
        if adjustment != 0 {
            info!(
                "Applying tick adjustment {} at tick {}",
                adjustment, self.current_tick
            );
            target += adjustment;
        }

        let mut sent = false;
        while i64::from(self.current_tick) < target {
            self.drain_replication();
            self.world.run_lifetime_transitions();

            let input = self.input.sample();
            self.world.record_player_input(self.current_tick, input);
            if self.last_sent_input != Some(input) {
                self.connection
                    .send_input(self.current_tick, self.world.player_id, input)
                    .await?;
                self.last_sent_input = Some(input);
                sent = true;
            }

            self.world.integrate_movement();
            self.current_tick = self.current_tick.wrapping_add(1);
        }

        // Even a stalled or idle frame keeps the tick-diff stream fed.
        if !sent {
            self.connection.send_heartbeat(self.current_tick).await?;
        }
        Ok(())
    }

    /// Asks the server to change one tile layer. Stamped with the current
    /// tick so it rides the same sequencing as input.
    pub async fn request_tile_update(
        &mut self,
        tile_x: u32,
        tile_y: u32,
        layer_index: u8,
        sprite_id: u32,
    ) -> std::io::Result<()> {
        self.connection
            .send_tile_update_request(self.current_tick, tile_x, tile_y, layer_index, sprite_id)
            .await
    }

    fn drain_replication(&mut self) {
        let messages = {
            let mut sorter = self.sorter.lock().unwrap();
            let tick = sorter.current_tick();
            let messages = sorter.start_receive(tick);
            sorter.end_receive();
            messages
        };
        for message in &messages {
            self.world.apply_server_message(message);
        }
    }
}
