//! Client-side world state: predicted player, replicated remote entities,
//! and the authoritative tile map.
//!
//! Remote entities are applied snap-to-latest: the server's state simply
//! replaces the local copy, and the replicated input keeps them moving
//! plausibly between updates. The player is different: its local prediction
//! is reconciled against the server's confirmed state by snapping to the
//! confirmed tick and replaying the retained input history on top.

use std::collections::{HashMap, VecDeque};

use log::{debug, error, warn};

use shared::map::TileMap;
use shared::messages::TileUpdate;
use shared::{
    move_entity, EntityState, InputState, Message, MessageContent, Movement, Position,
    ReplicationPhase, INPUT_HISTORY_LENGTH, SIM_TICK_TIMESTEP_S,
};

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: u32,
    pub position: Position,
    pub movement: Movement,
    pub input: InputState,
}

pub struct World {
    pub player_id: u32,
    pub entities: HashMap<u32, Entity>,
    pub tile_map: TileMap,
    pending_inits: Vec<EntityState>,
    pending_deletes: Vec<u32>,
    input_history: VecDeque<(u32, InputState)>,
}

impl World {
    pub fn new(player_id: u32, spawn: Position) -> Self {
        let mut entities = HashMap::new();
        entities.insert(
            player_id,
            Entity {
                id: player_id,
                position: spawn,
                movement: Movement::default(),
                input: InputState::default(),
            },
        );
        Self {
            player_id,
            entities,
            tile_map: TileMap::new(),
            pending_inits: Vec::new(),
            pending_deletes: Vec::new(),
            input_history: VecDeque::with_capacity(INPUT_HISTORY_LENGTH),
        }
    }

    pub fn player(&self) -> &Entity {
        &self.entities[&self.player_id]
    }

    /// Applies one authoritative message from the replication stream.
    /// Entity updates for remote entities take effect immediately; init and
    /// delete notices are queued for the next lifetime transition so
    /// movement never runs against a half-constructed entity.
    pub fn apply_server_message(&mut self, message: &Message) {
        match &message.content {
            MessageContent::EntityUpdate { entities } => {
                for state in entities {
                    match state.phase {
                        ReplicationPhase::Delete => {
                            if state.id == self.player_id {
                                warn!("Server sent delete for the player entity, ignoring.");
                                continue;
                            }
                            self.pending_deletes.push(state.id);
                        }
                        ReplicationPhase::Init => {
                            if state.id == self.player_id {
                                // Already materialized from the connection
                                // response; treat as an update.
                                self.reconcile_player(message.tick_timestamp, state);
                                continue;
                            }
                            self.pending_inits.push(state.clone());
                        }
                        ReplicationPhase::Update => {
                            if state.id == self.player_id {
                                self.reconcile_player(message.tick_timestamp, state);
                            } else {
                                self.snap_remote_entity(state);
                            }
                        }
                    }
                }
            }
            MessageContent::TileUpdate(update) => self.apply_tile_update(update),
            other => warn!("Unexpected server message {:?}, ignoring.", other),
        }
    }

    /// Materializes queued inits and destroys queued deletes.
    pub fn run_lifetime_transitions(&mut self) {
        for entity_id in self.pending_deletes.drain(..) {
            if self.entities.remove(&entity_id).is_none() {
                debug!("Delete for unknown entity {}, ignoring.", entity_id);
            }
        }
        for state in self.pending_inits.drain(..) {
            let Some(position) = state.position else {
                error!("Init for entity {} carried no position, skipping.", state.id);
                continue;
            };
            self.entities.insert(
                state.id,
                Entity {
                    id: state.id,
                    position,
                    movement: state.movement.unwrap_or_default(),
                    input: state.input.unwrap_or_default(),
                },
            );
        }
    }

    /// Records the input applied to `tick` for later reconciliation replay
    /// and puts it on the player entity.
    pub fn record_player_input(&mut self, tick: u32, input: InputState) {
        while self.input_history.len() >= INPUT_HISTORY_LENGTH {
            self.input_history.pop_front();
        }
        self.input_history.push_back((tick, input));

        if let Some(player) = self.entities.get_mut(&self.player_id) {
            player.input = input;
        }
    }

    /// Advances every entity by one fixed timestep: the player under
    /// predicted input, remote entities under their replicated input.
    pub fn integrate_movement(&mut self) {
        for entity in self.entities.values_mut() {
            move_entity(
                &mut entity.position,
                &mut entity.movement,
                &entity.input,
                SIM_TICK_TIMESTEP_S,
            );
        }
    }

    fn snap_remote_entity(&mut self, state: &EntityState) {
        let Some(entity) = self.entities.get_mut(&state.id) else {
            // Update raced ahead of the init we queued, or the entity
            // left our window earlier. Either way the next init covers it.
            debug!("Update for unknown entity {}, ignoring.", state.id);
            return;
        };
        if let Some(position) = state.position {
            entity.position = position;
        }
        if let Some(movement) = state.movement {
            entity.movement = movement;
        }
        if let Some(input) = state.input {
            entity.input = input;
        }
    }

    /// Accepts the server's state for `confirmed_tick` and re-simulates the
    /// locally predicted ticks after it from the input history.
    fn reconcile_player(&mut self, confirmed_tick: u32, state: &EntityState) {
        let Some(player) = self.entities.get_mut(&self.player_id) else {
            return;
        };
        if let Some(position) = state.position {
            player.position = position;
        }
        if let Some(movement) = state.movement {
            player.movement = movement;
        }

        for (tick, input) in self.input_history.iter() {
            if *tick <= confirmed_tick {
                continue;
            }
            move_entity(
                &mut player.position,
                &mut player.movement,
                input,
                SIM_TICK_TIMESTEP_S,
            );
        }
    }

    /// Applies a layer-sliced tile update. `updated_layers` is the
    /// concatenation of each listed tile's slice; a running offset walks it
    /// back apart. A malformed update is logged and dropped at the first
    /// inconsistency rather than applied partially past it.
    pub fn apply_tile_update(&mut self, update: &TileUpdate) {
        let mut offset = 0usize;
        for info in &update.tile_info {
            let end = offset + info.layer_count as usize;
            if end > update.updated_layers.len() {
                error!(
                    "Tile update for ({}, {}) overruns its layer data, dropping rest.",
                    info.tile_x, info.tile_y
                );
                return;
            }
            for (i, sprite_id) in update.updated_layers[offset..end].iter().enumerate() {
                let layer_index = info.lowest_dirty_layer as usize + i;
                self.tile_map
                    .set_sprite_layer(info.tile_x, info.tile_y, layer_index, *sprite_id);
            }
            offset = end;
        }
    }
}
