//! Client protocol.
//!
//! Messages are JSON objects discriminated by a `"type"` field, sent as
//! WebSocket text frames. Chunk contents follow a `CHUNK_DATA` header as a
//! separate binary frame. Both directions are closed enums; anything that
//! does not decode into [`ClientMessage`] is rejected by [`ClientMessage::parse`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::math::Vec3;

/// Longest display name kept after sanitizing.
pub const MAX_NAME_LEN: usize = 16;

/// Why an inbound text frame was rejected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not an object")]
    NotObject,
    #[error("message has no string type")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

/// Attack target kinds. Only mobs can be attacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Mob,
}

/// Entity kinds named in death notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Mob,
}

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Session handshake. `player_id` resumes an earlier session.
    ///
    /// Fields are untyped; a non-string value counts as absent.
    Auth {
        #[serde(default)]
        player_id: Option<Value>,
        #[serde(default)]
        name: Option<Value>,
    },
    GetChunk {
        x: f64,
        z: f64,
    },
    BreakBlock {
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
        #[serde(default)]
        z: Option<f64>,
    },
    PlaceBlock {
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
        #[serde(default)]
        z: Option<f64>,
        #[serde(default)]
        block_id: Option<u16>,
    },
    /// `position` is only applied when it is a full finite vector.
    PlayerState {
        #[serde(default)]
        position: Option<Value>,
        #[serde(default)]
        rotation: Option<Value>,
    },
    Attack {
        target_type: TargetKind,
        target_id: String,
    },
}

const CLIENT_TYPES: [&str; 6] = [
    "AUTH",
    "GET_CHUNK",
    "BREAK_BLOCK",
    "PLACE_BLOCK",
    "PLAYER_STATE",
    "ATTACK",
];

impl ClientMessage {
    /// Decodes and schema-checks one text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let Some(obj) = value.as_object() else {
            return Err(ProtocolError::NotObject);
        };
        let kind = match obj.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingType),
        };
        if !CLIENT_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            reason: e.to_string(),
        })
    }
}

/// One mob in a batched position update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobUpdate {
    pub id: String,
    pub pos: Vec3,
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    AuthOk {
        player_id: String,
        name: String,
    },
    PlayerJoin {
        player_id: String,
        position: Vec3,
    },
    PlayerInfo {
        player_id: String,
        name: String,
    },
    PlayerLeave {
        player_id: String,
    },
    PlayerState {
        player_id: String,
        position: Vec3,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rotation: Option<Value>,
    },
    PlayerDamage {
        player_id: String,
        health: i32,
    },
    /// Header for the binary chunk frame that follows.
    ChunkData {
        cx: i32,
        cz: i32,
    },
    BlockUpdate {
        x: i32,
        y: i32,
        z: i32,
        block_id: u16,
    },
    MobSpawn {
        mob_id: String,
        position: Vec3,
    },
    MobState {
        mobs: Vec<MobUpdate>,
    },
    EntityDeath {
        entity_type: EntityKind,
        entity_id: String,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Cleans a requested display name: missing or empty becomes `"Player"`,
/// then the first 16 characters are kept minus anything that is not an
/// ASCII letter, digit or space. An empty result becomes `"Guest"`.
pub fn sanitize_name(requested: Option<&str>) -> String {
    let raw = match requested {
        Some(name) if !name.is_empty() => name,
        _ => "Player",
    };
    let cleaned: String = raw
        .chars()
        .take(MAX_NAME_LEN)
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect();
    if cleaned.is_empty() {
        "Guest".to_string()
    } else {
        cleaned
    }
}
