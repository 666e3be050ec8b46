//! Authoritative game server.
//!
//! The server owns the canonical world: it sequences client input into
//! per-tick buckets, advances the simulation on a fixed timestep, and
//! replicates entity and tile state to each client through area-of-interest
//! windows. Alongside the state stream it measures every client's tick
//! drift and feeds back bounded tick-rate corrections so client messages
//! keep landing slightly ahead of the tick they apply to.
//!
//! Module layout:
//! - [`network`]: transport, per-connection tasks, the tick/send loop
//! - [`client`] / [`client_manager`]: per-connection state and registry
//! - [`game`]: world state and the fixed-order simulation tick
//! - [`aoi`] / [`tiles`]: entity and tile replication
//! - [`locator`]: chunk-bucketed spatial index backing both replicators

pub mod aoi;
pub mod client;
pub mod client_manager;
pub mod game;
pub mod locator;
pub mod network;
pub mod tiles;

pub use client::{AdjustmentConfig, ClientConnection};
pub use client_manager::ClientManager;
pub use game::{SimEvent, Simulation, World};
pub use network::{Server, ServerConfig};
