//! `voxel_shared`
//!
//! Libraries shared by the voxel server, the verification client and tests.
//!
//! - `config`: server configuration (defaults, JSON, environment)
//! - `math`: small vector type used for positions
//! - `chunk`: 32³ voxel grid and its wire encoding
//! - `net`: client protocol messages and the inbound schema gate
//! - `scheduler`: fixed-step tick source
//!
//! No `unsafe`.

pub mod chunk;
pub mod config;
pub mod math;
pub mod net;
pub mod scheduler;
