//! Voxel chunk storage.
//!
//! A chunk is a dense 32×32×32 grid of `u16` block ids indexed
//! `lx * 1024 + ly * 32 + lz`. On the wire it is 65536 raw bytes.
//!
//! The worker writes ids big-endian, but ids are held as a little-endian
//! view of those bytes, the same view browser clients take. Worker payloads
//! therefore reach clients byte for byte, and ids written by block edits
//! are little-endian.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Edge length of a chunk in voxels.
pub const CHUNK_SIZE: i32 = 32;
/// Voxels per chunk.
pub const CHUNK_VOLUME: usize = (CHUNK_SIZE * CHUNK_SIZE * CHUNK_SIZE) as usize;
/// Size of a chunk payload in bytes.
pub const CHUNK_BYTES: usize = CHUNK_VOLUME * 2;

/// Block id for empty space.
pub const AIR: u16 = 0;

/// Horizontal chunk coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub cx: i32,
    pub cz: i32,
}

impl ChunkKey {
    pub const fn new(cx: i32, cz: i32) -> Self {
        Self { cx, cz }
    }

    /// Chunk owning a world block column.
    pub fn containing(x: i32, z: i32) -> Self {
        Self::new(x.div_euclid(CHUNK_SIZE), z.div_euclid(CHUNK_SIZE))
    }

    /// Parses the `"cx,cz"` form used in snapshots.
    pub fn parse(s: &str) -> Option<Self> {
        let (x, z) = s.split_once(',')?;
        Some(Self::new(x.trim().parse().ok()?, z.trim().parse().ok()?))
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.cx, self.cz)
    }
}

/// Errors building a chunk from external data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk payload is {0} bytes, expected {}", CHUNK_BYTES)]
    PayloadSize(usize),
    #[error("chunk has {0} voxels, expected {}", CHUNK_VOLUME)]
    VoxelCount(usize),
}

/// Dense voxel grid.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    voxels: Box<[u16]>,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let solid = self.voxels.iter().filter(|&&v| v != AIR).count();
        f.debug_struct("Chunk").field("solid", &solid).finish()
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self {
            voxels: vec![AIR; CHUNK_VOLUME].into_boxed_slice(),
        }
    }
}

impl Chunk {
    /// Decodes a worker payload.
    pub fn from_payload(bytes: &[u8]) -> Result<Self, ChunkError> {
        if bytes.len() != CHUNK_BYTES {
            return Err(ChunkError::PayloadSize(bytes.len()));
        }
        let voxels = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self { voxels })
    }

    /// Builds a chunk from a flat id array (snapshot form).
    pub fn from_voxels(voxels: Vec<u16>) -> Result<Self, ChunkError> {
        if voxels.len() != CHUNK_VOLUME {
            return Err(ChunkError::VoxelCount(voxels.len()));
        }
        Ok(Self {
            voxels: voxels.into_boxed_slice(),
        })
    }

    /// Encodes the grid for the binary chunk frame.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_BYTES);
        for &v in self.voxels.iter() {
            buf.put_u16_le(v);
        }
        buf.freeze()
    }

    pub fn voxels(&self) -> &[u16] {
        &self.voxels
    }

    /// Flat index of a local coordinate, or `None` when out of range.
    pub fn index(lx: i32, ly: i32, lz: i32) -> Option<usize> {
        let range = 0..CHUNK_SIZE;
        if !(range.contains(&lx) && range.contains(&ly) && range.contains(&lz)) {
            return None;
        }
        Some((lx * CHUNK_SIZE * CHUNK_SIZE + ly * CHUNK_SIZE + lz) as usize)
    }

    pub fn get(&self, lx: i32, ly: i32, lz: i32) -> Option<u16> {
        Self::index(lx, ly, lz).map(|i| self.voxels[i])
    }

    /// Writes the voxel at a world block position. `x`/`z` wrap into the
    /// chunk; `y` must already be local. Returns false when `y` is out of
    /// range.
    pub fn set_world(&mut self, x: i32, y: i32, z: i32, block: u16) -> bool {
        match Self::index(x.rem_euclid(CHUNK_SIZE), y, z.rem_euclid(CHUNK_SIZE)) {
            Some(i) => {
                self.voxels[i] = block;
                true
            }
            None => false,
        }
    }
}
