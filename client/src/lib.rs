//! Predicting game client.
//!
//! The client runs the shared simulation one step ahead of the server,
//! applying local input immediately and reconciling against authoritative
//! state when it arrives. Remote entities and the tile map replicate a
//! fixed distance behind the server's clock through a per-tick sequencer,
//! and the server's drift corrections re-pace the local tick without
//! disturbing that stream.
//!
//! Module layout:
//! - [`network`]: handshake, receive task, send helpers
//! - [`sim`]: the per-frame tick loop and adjustment handling
//! - [`game`]: predicted world state and reconciliation
//! - [`input`]: local input sampling

pub mod game;
pub mod input;
pub mod network;
pub mod sim;

pub use game::World;
pub use network::{Handshake, ServerConnection};
pub use sim::Simulation;
