//! `voxel_client`
//!
//! Protocol client for checking a running server end to end:
//! - WebSocket connect and `AUTH` handshake
//! - chunk fetch (`GET_CHUNK` → `CHUNK_DATA` + binary payload)

pub mod client;

pub use client::{verify, VerifyClient, VerifyReport};
