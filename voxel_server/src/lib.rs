//! `voxel_server`
//!
//! Server-side systems:
//! - Fixed timestep simulation (mobs, contact damage)
//! - Player sessions that survive reconnects
//! - Chunk cache fed by an external generation worker
//! - Periodic world snapshots
//!
//! Networking model:
//! - WebSocket text frames: JSON control and gameplay messages
//! - WebSocket binary frames: raw chunk payloads

pub mod mobs;
pub mod perf;
pub mod persist;
pub mod server;
pub mod session;
pub mod worker;
pub mod world;

pub use server::GameServer;
