//! Types and logic shared between the authoritative server and the
//! predicting client.
//!
//! Everything here must behave identically on both sides: the wire schema,
//! the framing codec, the fixed-timestep movement integration, and the tick
//! bookkeeping. The server and client crates layer their own policy
//! (authority vs. prediction) on top of these pieces.

pub mod components;
pub mod map;
pub mod messages;
pub mod sorter;
pub mod tick;
pub mod wire;

pub use components::{move_entity, InputState, Movement, Position};
pub use messages::{EntityState, Message, MessageContent, ReplicationPhase};

/// Simulation ticks per second. Movement integration always uses the
/// interval derived from this, never a wall-clock delta.
pub const SIM_TICK_RATE: u32 = 30;

/// Fixed timestep fed to movement integration, in seconds.
pub const SIM_TICK_TIMESTEP_S: f32 = 1.0 / SIM_TICK_RATE as f32;

/// Network sends per second. Slower than the sim tick so that multiple sim
/// ticks' worth of state can coalesce into one batch.
pub const NETWORK_TICK_RATE: u32 = 20;

/// How many ticks in the past the client replicates remote entities.
/// Server updates for tick T arrive after a round trip, so draining them at
/// the client's local tick T would classify them all as too old.
pub const REPLICATION_TICK_OFFSET: i64 = -5;

/// How many of the player's recent inputs the client retains for
/// reconciliation replay.
pub const INPUT_HISTORY_LENGTH: usize = 20;
