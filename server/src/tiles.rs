//! Tile mutation requests and tile replication.
//!
//! Requests are validated (bounds, layer index, extension policy) before
//! touching the map; an invalid request is logged and skipped, never
//! applied partially. Replication has two paths: chunks that just entered
//! a client's interest window get the full layer stack of every non-empty
//! tile, and dirty tiles fan out to every client whose established window
//! covers them, carrying only the layers from the lowest dirty layer
//! upward.

use std::collections::{HashMap, HashSet};

use log::error;

use shared::map::{
    ChunkExtent, ChunkPosition, TileMap, TilePosition, CHUNK_WIDTH_TILES, MAX_TILE_LAYERS,
};
use shared::messages::{TileInfo, TileUpdate};
use shared::{Message, MessageContent};

use crate::aoi::AOI_CHUNK_RADIUS;
use crate::game::World;

/// A client's request to change one sprite layer of one tile.
#[derive(Debug, Clone)]
pub struct TileRequest {
    pub client_id: u32,
    pub tile_x: u32,
    pub tile_y: u32,
    pub layer_index: u8,
    pub sprite_id: u32,
}

/// Hook deciding whether a request is allowed, beyond structural validity.
/// Ownership checks, build permissions and the like slot in here.
pub type TileExtensionPolicy = Box<dyn Fn(&TileRequest) -> bool + Send + Sync>;

#[derive(Default)]
pub struct TileUpdateSystem {
    policy: Option<TileExtensionPolicy>,
    last_window: HashMap<u32, HashSet<ChunkPosition>>,
}

impl TileUpdateSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: TileExtensionPolicy) -> Self {
        Self {
            policy: Some(policy),
            last_window: HashMap::new(),
        }
    }

    pub fn forget_client(&mut self, client_id: u32) {
        self.last_window.remove(&client_id);
    }

    /// Validates and applies a batch of requests, recording the touched
    /// tiles in the world's dirty-tile map.
    pub fn process_requests(&self, world: &mut World, requests: &[TileRequest]) {
        for request in requests {
            if request.layer_index as usize >= MAX_TILE_LAYERS {
                error!(
                    "Client {}: tile request layer {} out of range, skipping.",
                    request.client_id, request.layer_index
                );
                continue;
            }
            if !TileMap::in_bounds(request.tile_x, request.tile_y) {
                error!(
                    "Client {}: tile request ({}, {}) out of bounds, skipping.",
                    request.client_id, request.tile_x, request.tile_y
                );
                continue;
            }
            if let Some(policy) = &self.policy {
                if !policy(request) {
                    continue;
                }
            }

            if world.tile_map.set_sprite_layer(
                request.tile_x,
                request.tile_y,
                request.layer_index as usize,
                request.sprite_id,
            ) {
                let tile = TilePosition {
                    x: request.tile_x,
                    y: request.tile_y,
                };
                let layer = request.layer_index as usize;
                world
                    .dirty_tiles
                    .entry(tile)
                    .and_modify(|lowest| *lowest = (*lowest).min(layer))
                    .or_insert(layer);
            }
        }
    }

    /// Builds one tile update message per interested client: full chunk
    /// state for chunks newly in a client's window, dirty-layer slices for
    /// the rest. Clears the dirty set.
    pub fn build_updates(&mut self, world: &mut World, current_tick: u32) -> Vec<(u32, Message)> {
        let mut working: HashMap<u32, TileUpdate> = HashMap::new();
        let mut entered: HashMap<u32, HashSet<ChunkPosition>> = HashMap::new();

        for (client_id, player_entity_id) in world.client_entities() {
            let Some(center) = world.locator.entity_chunk(player_entity_id) else {
                continue;
            };
            let mut extent = ChunkExtent::centered_on(center, AOI_CHUNK_RADIUS);
            extent.intersect_with(&ChunkExtent::map_extent());
            let window: HashSet<ChunkPosition> = extent.chunks().collect();

            let previous = self.last_window.entry(client_id).or_default();
            let new_chunks: HashSet<ChunkPosition> =
                window.difference(previous).copied().collect();
            *previous = window;
            if !new_chunks.is_empty() {
                entered.insert(client_id, new_chunks);
            }
        }

        // A chunk that just entered a window is replicated whole, so a
        // client walking into it never sees tiles it missed edits for.
        for (client_id, chunks) in &entered {
            let update = working.entry(*client_id).or_default();
            for chunk in chunks {
                push_chunk_tiles(world, *chunk, update);
            }
        }

        for (tile_pos, lowest_dirty_layer) in world.dirty_tiles.iter() {
            let Some(tile) = world.tile_map.get_tile(tile_pos.x, tile_pos.y) else {
                error!(
                    "Dirty tile ({}, {}) missing from map, skipping.",
                    tile_pos.x, tile_pos.y
                );
                continue;
            };
            let layers = &tile.sprite_layers[*lowest_dirty_layer..];
            let info = TileInfo {
                tile_x: tile_pos.x,
                tile_y: tile_pos.y,
                layer_count: layers.len() as u8,
                lowest_dirty_layer: *lowest_dirty_layer as u8,
            };

            let mut extent =
                ChunkExtent::centered_on(ChunkPosition::from(*tile_pos), AOI_CHUNK_RADIUS);
            extent.intersect_with(&ChunkExtent::map_extent());

            for entity_id in world.locator.entities_in_extent(&extent) {
                let Some(client_id) =
                    world.entities.get(&entity_id).and_then(|e| e.client_id)
                else {
                    continue;
                };
                // The full chunk state above already carries this tile.
                if entered
                    .get(&client_id)
                    .map_or(false, |chunks| chunks.contains(&ChunkPosition::from(*tile_pos)))
                {
                    continue;
                }
                let update = working.entry(client_id).or_default();
                update.tile_info.push(info);
                update.updated_layers.extend_from_slice(layers);
            }
        }

        world.dirty_tiles.clear();

        working
            .into_iter()
            .filter(|(_, update)| !update.tile_info.is_empty())
            .map(|(client_id, update)| {
                (
                    client_id,
                    Message {
                        tick_timestamp: current_tick,
                        content: MessageContent::TileUpdate(update),
                    },
                )
            })
            .collect()
    }
}

/// Appends every non-empty tile of `chunk` to `update`, full layer stacks
/// from layer zero.
fn push_chunk_tiles(world: &World, chunk: ChunkPosition, update: &mut TileUpdate) {
    let base_x = chunk.x as u32 * CHUNK_WIDTH_TILES;
    let base_y = chunk.y as u32 * CHUNK_WIDTH_TILES;
    for tile_y in base_y..base_y + CHUNK_WIDTH_TILES {
        for tile_x in base_x..base_x + CHUNK_WIDTH_TILES {
            let Some(tile) = world.tile_map.get_tile(tile_x, tile_y) else {
                continue;
            };
            if tile.sprite_layers.is_empty() {
                continue;
            }
            update.tile_info.push(TileInfo {
                tile_x,
                tile_y,
                layer_count: tile.sprite_layers.len() as u8,
                lowest_dirty_layer: 0,
            });
            update.updated_layers.extend_from_slice(&tile.sprite_layers);
        }
    }
}
