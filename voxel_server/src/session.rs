//! Player sessions and connection identities.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::{sync::mpsc, time::Instant};
use uuid::Uuid;
use voxel_shared::math::Vec3;

use crate::persist::PlayerRecord;

/// Full health; also the health restored on respawn.
pub const MAX_HEALTH: i32 = 20;

/// Where new and respawning players are placed.
pub const SPAWN_POINT: Vec3 = Vec3::new(16.0, 13.0, 16.0);

/// Damage immunity after taking a hit.
pub const INVULNERABILITY: Duration = Duration::from_secs(1);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one live client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl ConnId {
    pub fn new_unique() -> Self {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A frame queued for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    Close,
}

/// Sending half of a connection's outbound queue.
pub type ConnTx = mpsc::UnboundedSender<Outbound>;

/// Fresh 8-character session id.
pub fn new_session_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// A player's durable state. Outlives any single connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub name: String,
    /// Live connection, `None` while disconnected.
    pub conn: Option<ConnId>,
    pub position: Vec3,
    /// Opaque client-defined orientation, echoed to other players.
    pub rotation: Option<Value>,
    pub health: i32,
    pub invulnerable_until: Option<Instant>,
    /// Block edits accepted in the current persistence window.
    pub edits: u32,
    pub authenticated: bool,
}

impl Session {
    /// New player at the spawn point.
    pub fn spawn(id: String, name: String, conn: ConnId) -> Self {
        Self {
            id,
            name,
            conn: Some(conn),
            position: SPAWN_POINT,
            rotation: None,
            health: MAX_HEALTH,
            invulnerable_until: None,
            edits: 0,
            authenticated: true,
        }
    }

    /// Detached session restored from a snapshot.
    pub fn from_record(rec: PlayerRecord) -> Self {
        Self {
            id: rec.id,
            name: rec.name,
            conn: None,
            position: rec.pos,
            rotation: None,
            health: rec.health.clamp(0, MAX_HEALTH),
            invulnerable_until: None,
            edits: 0,
            authenticated: false,
        }
    }

    pub fn to_record(&self) -> PlayerRecord {
        PlayerRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            pos: self.position,
            health: self.health,
        }
    }

    /// Authenticated with a live connection.
    pub fn is_online(&self) -> bool {
        self.authenticated && self.conn.is_some()
    }

    pub fn is_invulnerable(&self, now: Instant) -> bool {
        self.invulnerable_until.is_some_and(|until| now < until)
    }

    /// Applies a hit and starts the immunity window. Returns true when the
    /// hit was lethal.
    pub fn take_hit(&mut self, damage: i32, now: Instant) -> bool {
        self.health -= damage;
        self.invulnerable_until = Some(now + INVULNERABILITY);
        self.health <= 0
    }

    pub fn respawn(&mut self) {
        self.health = MAX_HEALTH;
        self.position = SPAWN_POINT;
    }
}
