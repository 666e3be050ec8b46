//! The logical wire schema, serialized with bincode.

use serde::{Deserialize, Serialize};

use crate::components::{InputState, Movement, Position};

/// Every payload on the wire is one of these, stamped with the tick it
/// logically belongs to on the sender's clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub tick_timestamp: u32,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageContent {
    /// Sent once per new connection, server to client.
    ConnectionResponse {
        entity_id: u32,
        current_tick: u32,
        spawn_x: f32,
        spawn_y: f32,
    },
    /// Entity state replication. Server to client it carries the batched
    /// area-of-interest notices for one tick; client to server it carries
    /// the player's input. An empty entity list is a valid heartbeat.
    EntityUpdate { entities: Vec<EntityState> },
    /// Batched dirty-tile state for one client, one tick.
    TileUpdate(TileUpdate),
    /// Client asks the server to change one tile layer.
    TileUpdateRequest {
        tile_x: u32,
        tile_y: u32,
        layer_index: u8,
        sprite_id: u32,
    },
}

/// Why an entity appears in an update: it entered the client's window
/// (full init state), changed while in the window (incremental), or left
/// the window (no components, just the id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationPhase {
    Init,
    Update,
    Delete,
}

/// One entity's replicated state. Component presence is typed rather than
/// flag-encoded; a `Delete` entry carries no components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub id: u32,
    pub phase: ReplicationPhase,
    pub position: Option<Position>,
    pub movement: Option<Movement>,
    pub input: Option<InputState>,
}

impl EntityState {
    pub fn delete(id: u32) -> Self {
        Self {
            id,
            phase: ReplicationPhase::Delete,
            position: None,
            movement: None,
            input: None,
        }
    }
}

/// Per-tile bookkeeping inside a [`TileUpdate`]. `layer_count` layers,
/// starting at `lowest_dirty_layer`, were taken from `updated_layers` —
/// the consumer reconstructs each tile's slice with a running offset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TileInfo {
    pub tile_x: u32,
    pub tile_y: u32,
    pub layer_count: u8,
    pub lowest_dirty_layer: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TileUpdate {
    pub tile_info: Vec<TileInfo>,
    pub updated_layers: Vec<u32>,
}
