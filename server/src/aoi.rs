//! Per-client entity replication windows.
//!
//! Each tick, every client gets at most one entity update message built
//! from a point-in-time snapshot: full init state for entities that
//! entered its window, a delete notice for entities that left, and full
//! component state for entities that stayed and moved. The dirty set is
//! cleared after the snapshot, so changes landing mid-build wait for the
//! next tick.

use std::collections::{HashMap, HashSet};

use shared::map::{ChunkExtent, ChunkPosition};
use shared::{EntityState, Message, MessageContent, ReplicationPhase};

use crate::game::World;

/// Radius, in chunks, of a client's interest window (1 = a 3x3 window).
pub const AOI_CHUNK_RADIUS: i32 = 1;

#[derive(Debug, Default)]
pub struct ClientAoiSystem {
    last_in_window: HashMap<u32, HashSet<u32>>,
}

impl ClientAoiSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forget_client(&mut self, client_id: u32) {
        self.last_in_window.remove(&client_id);
    }

    /// Builds this tick's entity update for every connected client and
    /// clears the world's entity dirty set.
    pub fn build_updates(
        &mut self,
        world: &mut World,
        current_tick: u32,
    ) -> Vec<(u32, Message)> {
        let mut updates = Vec::new();

        for (client_id, player_entity_id) in world.client_entities() {
            let Some(center) = world.locator.entity_chunk(player_entity_id) else {
                continue;
            };
            let window = self.window_around(center);
            let in_window: HashSet<u32> =
                world.locator.entities_in_extent(&window).into_iter().collect();
            let previous = self.last_in_window.entry(client_id).or_default();

            let mut entities = Vec::new();
            // Deletes first so a client never simulates a stale entity
            // alongside its replacement.
            for entity_id in previous.iter() {
                if !in_window.contains(entity_id) {
                    entities.push(EntityState::delete(*entity_id));
                }
            }
            for entity_id in in_window.iter() {
                if previous.contains(entity_id) {
                    continue;
                }
                if let Some(entity) = world.entities.get(entity_id) {
                    entities.push(EntityState {
                        id: entity.id,
                        phase: ReplicationPhase::Init,
                        position: Some(entity.position),
                        movement: Some(entity.movement),
                        input: Some(entity.input),
                    });
                }
            }
            for entity_id in in_window.iter() {
                if !previous.contains(entity_id) || !world.dirty_entities.contains(entity_id) {
                    continue;
                }
                if let Some(entity) = world.entities.get(entity_id) {
                    entities.push(EntityState {
                        id: entity.id,
                        phase: ReplicationPhase::Update,
                        position: Some(entity.position),
                        movement: Some(entity.movement),
                        input: Some(entity.input),
                    });
                }
            }

            *previous = in_window;

            if !entities.is_empty() {
                updates.push((
                    client_id,
                    Message {
                        tick_timestamp: current_tick,
                        content: MessageContent::EntityUpdate { entities },
                    },
                ));
            }
        }

        world.dirty_entities.clear();
        updates
    }

    fn window_around(&self, center: ChunkPosition) -> ChunkExtent {
        let mut window = ChunkExtent::centered_on(center, AOI_CHUNK_RADIUS);
        window.intersect_with(&ChunkExtent::map_extent());
        window
    }
}
