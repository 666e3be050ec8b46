//! Authoritative world state and the fixed-order simulation tick.
//!
//! The tick order is a contract: connection churn, then tile updates, then
//! lifetime transitions, then input, then movement, then replication, then
//! the counter increment. Reordering these changes observable behavior
//! (e.g. movement running against a half-constructed entity).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use rand::Rng;

use shared::map::{TileMap, TilePosition, WORLD_HEIGHT_UNITS, WORLD_WIDTH_UNITS};
use shared::sorter::MessageSorter;
use shared::tick::{TickCounter, TickHandle};
use shared::{
    move_entity, InputState, Message, MessageContent, Movement, Position, SIM_TICK_TIMESTEP_S,
};

use crate::aoi::ClientAoiSystem;
use crate::tiles::{TileRequest, TileUpdateSystem};

/// How many wandering NPCs the world is seeded with.
pub const NPC_COUNT: usize = 12;
/// NPCs re-roll their wander direction on this tick interval.
const NPC_WANDER_PERIOD_TICKS: u32 = 45;

/// Lifecycle events delivered from the network context to the tick loop.
#[derive(Debug)]
pub enum SimEvent {
    ClientConnected { client_id: u32 },
    ClientDisconnected { client_id: u32 },
    TileUpdateRequested(TileRequest),
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: u32,
    pub position: Position,
    pub movement: Movement,
    pub input: InputState,
    /// Set for player entities, `None` for NPCs.
    pub client_id: Option<u32>,
}

/// A message produced by one tick, addressed to one client.
#[derive(Debug)]
pub struct OutboundMessage {
    pub client_id: u32,
    pub message: Message,
}

#[derive(Debug, Default)]
pub struct TickOutput {
    pub messages: Vec<OutboundMessage>,
}

pub struct World {
    pub entities: HashMap<u32, Entity>,
    /// Entities that moved or otherwise changed this tick.
    pub dirty_entities: HashSet<u32>,
    /// Dirty tiles with the lowest layer index that changed, so updates
    /// carry only the layers from there up.
    pub dirty_tiles: HashMap<TilePosition, usize>,
    pub locator: crate::locator::EntityLocator,
    pub tile_map: TileMap,
    client_entities: HashMap<u32, u32>,
    next_entity_id: u32,
}

impl World {
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
            dirty_entities: HashSet::new(),
            dirty_tiles: HashMap::new(),
            locator: crate::locator::EntityLocator::new(),
            tile_map: TileMap::new(),
            client_entities: HashMap::new(),
            next_entity_id: 1,
        }
    }

    pub fn spawn_entity(&mut self, position: Position, client_id: Option<u32>) -> u32 {
        let id = self.next_entity_id;
        self.next_entity_id += 1;

        self.locator.set_entity_location(id, &position);
        self.entities.insert(
            id,
            Entity {
                id,
                position,
                movement: Movement::default(),
                input: InputState::default(),
                client_id,
            },
        );
        if let Some(client_id) = client_id {
            self.client_entities.insert(client_id, id);
        }
        id
    }

    pub fn despawn_entity(&mut self, entity_id: u32) {
        if let Some(entity) = self.entities.remove(&entity_id) {
            self.locator.remove_entity(entity_id);
            self.dirty_entities.remove(&entity_id);
            if let Some(client_id) = entity.client_id {
                self.client_entities.remove(&client_id);
            }
        }
    }

    pub fn entity_for_client(&self, client_id: u32) -> Option<u32> {
        self.client_entities.get(&client_id).copied()
    }

    pub fn client_entities(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.client_entities.iter().map(|(c, e)| (*c, *e))
    }

    fn random_spawn_position(&self) -> Position {
        let mut rng = rand::thread_rng();
        Position {
            x: rng.gen_range(0.0..WORLD_WIDTH_UNITS),
            y: rng.gen_range(0.0..WORLD_HEIGHT_UNITS),
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-client input bucketed by the tick it applies to. Pushed from the
/// network-receive context, drained once per tick from the tick context.
pub type InputSorter = Arc<Mutex<MessageSorter<(u32, InputState)>>>;

pub struct Simulation {
    pub world: World,
    tick: TickCounter,
    input_sorter: InputSorter,
    aoi: ClientAoiSystem,
    tiles: TileUpdateSystem,
    pending_despawns: VecDeque<u32>,
}

impl Simulation {
    pub fn new(start_tick: u32) -> Self {
        let mut world = World::new();
        for _ in 0..NPC_COUNT {
            let position = world.random_spawn_position();
            world.spawn_entity(position, None);
        }

        Self {
            world,
            tick: TickCounter::new(start_tick),
            input_sorter: Arc::new(Mutex::new(MessageSorter::new(start_tick))),
            aoi: ClientAoiSystem::new(),
            tiles: TileUpdateSystem::new(),
            pending_despawns: VecDeque::new(),
        }
    }

    pub fn tick_handle(&self) -> TickHandle {
        self.tick.handle()
    }

    pub fn current_tick(&self) -> u32 {
        self.tick.get()
    }

    pub fn input_sorter(&self) -> InputSorter {
        Arc::clone(&self.input_sorter)
    }

    /// Runs exactly one simulation tick and returns the messages it
    /// produced.
    pub fn run_tick(&mut self, events: Vec<SimEvent>) -> TickOutput {
        let current_tick = self.tick.get();
        let mut output = TickOutput::default();
        let mut tile_requests = Vec::new();

        // 1. Connection churn.
        for event in events {
            match event {
                SimEvent::ClientConnected { client_id } => {
                    self.handle_connect(client_id, current_tick, &mut output);
                }
                SimEvent::ClientDisconnected { client_id } => {
                    if let Some(entity_id) = self.world.entity_for_client(client_id) {
                        self.pending_despawns.push_back(entity_id);
                    }
                    self.aoi.forget_client(client_id);
                    self.tiles.forget_client(client_id);
                }
                SimEvent::TileUpdateRequested(request) => tile_requests.push(request),
            }
        }

        // 2. Tile updates, validated against the extension policy.
        self.tiles.process_requests(&mut self.world, &tile_requests);

        // 3. Lifetime transitions, strictly before movement.
        while let Some(entity_id) = self.pending_despawns.pop_front() {
            self.world.despawn_entity(entity_id);
        }
        self.wander_npcs(current_tick);

        // 4. Input for this tick, drained from the sequencer.
        self.apply_tick_inputs(current_tick);

        // 5. Movement integration at the fixed timestep.
        self.move_entities();

        // 6. Replication snapshot.
        for (client_id, message) in self.aoi.build_updates(&mut self.world, current_tick) {
            output.messages.push(OutboundMessage { client_id, message });
        }
        for (client_id, message) in self.tiles.build_updates(&mut self.world, current_tick) {
            output.messages.push(OutboundMessage { client_id, message });
        }

        // 7. Advance.
        self.tick.advance();
        output
    }

    fn handle_connect(&mut self, client_id: u32, current_tick: u32, output: &mut TickOutput) {
        let position = self.world.random_spawn_position();
        let entity_id = self.world.spawn_entity(position, Some(client_id));
        info!(
            "Client {} assigned entity {} at ({:.1}, {:.1})",
            client_id, entity_id, position.x, position.y
        );

        output.messages.push(OutboundMessage {
            client_id,
            message: Message {
                tick_timestamp: current_tick,
                content: MessageContent::ConnectionResponse {
                    entity_id,
                    current_tick,
                    spawn_x: position.x,
                    spawn_y: position.y,
                },
            },
        });
    }

    fn apply_tick_inputs(&mut self, current_tick: u32) {
        let inputs = {
            let mut sorter = self.input_sorter.lock().unwrap();
            let inputs = sorter.start_receive(current_tick);
            sorter.end_receive();
            inputs
        };

        for (client_id, input) in inputs {
            let Some(entity_id) = self.world.entity_for_client(client_id) else {
                debug!("Input from client {} with no entity, ignoring.", client_id);
                continue;
            };
            if let Some(entity) = self.world.entities.get_mut(&entity_id) {
                entity.input = input;
            }
        }
    }

    fn move_entities(&mut self) {
        let mut moved = Vec::new();
        for entity in self.world.entities.values_mut() {
            let before = entity.position;
            move_entity(
                &mut entity.position,
                &mut entity.movement,
                &entity.input,
                SIM_TICK_TIMESTEP_S,
            );
            if entity.position != before {
                moved.push((entity.id, entity.position));
            }
        }
        for (id, position) in moved {
            self.world.dirty_entities.insert(id);
            self.world.locator.set_entity_location(id, &position);
        }
    }

    fn wander_npcs(&mut self, current_tick: u32) {
        if current_tick % NPC_WANDER_PERIOD_TICKS != 0 {
            return;
        }
        let mut rng = rand::thread_rng();
        for entity in self.world.entities.values_mut() {
            if entity.client_id.is_some() {
                continue;
            }
            // Idle or one of the four cardinal directions.
            let mut input = InputState::default();
            match rng.gen_range(0..5) {
                0 => input.up = true,
                1 => input.down = true,
                2 => input.left = true,
                3 => input.right = true,
                _ => {}
            }
            entity.input = input;
        }
    }

    /// Pushes one client input into the sequencer. Called from the
    /// network-receive context.
    pub fn sort_input(
        sorter: &InputSorter,
        client_id: u32,
        tick_timestamp: u32,
        input: InputState,
    ) {
        let mut sorter = sorter.lock().unwrap();
        let result = sorter.push(tick_timestamp, (client_id, input));
        if result.validity != shared::sorter::Validity::Valid {
            warn!(
                "Dropped input from client {} for tick {} ({:?}, diff {}).",
                client_id, tick_timestamp, result.validity, result.diff
            );
        }
    }
}
