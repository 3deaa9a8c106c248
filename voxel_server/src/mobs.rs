//! Mobs: wandering AI and contact damage.

use std::collections::BTreeMap;

use rand::Rng;
use tokio::time::Instant;
use uuid::Uuid;
use voxel_shared::{
    math::Vec3,
    net::{MobUpdate, ServerMessage},
};

use crate::session::{ConnId, Session, SPAWN_POINT};

pub const MOB_HEALTH: i32 = 10;
/// Horizontal speed in blocks per second.
pub const MOB_SPEED: f32 = 2.0;
/// Spawn height, one block above typical ground.
pub const MOB_SPAWN_Y: f32 = 11.0;
/// Mobs spawn within this many blocks (per axis) around the spawn column.
pub const MOB_SPAWN_SPREAD: f32 = 10.0;

/// Squared distance at which a mob hurts a player.
pub const CONTACT_RANGE_SQ: f32 = 2.25;
pub const CONTACT_DAMAGE: i32 = 2;

/// Player melee reach.
pub const ATTACK_RANGE: f32 = 8.0;
pub const ATTACK_DAMAGE: i32 = 3;

const WANDER_MIN_TICKS: i32 = 10;
const WANDER_MAX_TICKS: i32 = 30;

/// A simulated creature.
#[derive(Debug, Clone, PartialEq)]
pub struct Mob {
    pub id: String,
    pub position: Vec3,
    pub velocity: Vec3,
    /// Ticks until the next heading change.
    pub wander_ticks: i32,
    pub health: i32,
}

impl Mob {
    pub fn new(id: String, position: Vec3) -> Self {
        Self {
            id,
            position,
            velocity: Vec3::ZERO,
            wander_ticks: 0,
            health: MOB_HEALTH,
        }
    }

    /// Random spot around the spawn column.
    pub fn spawn(id: String, rng: &mut impl Rng) -> Self {
        let x = SPAWN_POINT.x + (rng.gen::<f32>() - 0.5) * MOB_SPAWN_SPREAD;
        let z = SPAWN_POINT.z + (rng.gen::<f32>() - 0.5) * MOB_SPAWN_SPREAD;
        Self::new(id, Vec3::new(x, MOB_SPAWN_Y, z))
    }

    /// Counts down the wander timer and picks a new heading when it runs out.
    pub fn wander(&mut self, rng: &mut impl Rng) {
        self.wander_ticks -= 1;
        if self.wander_ticks <= 0 {
            self.wander_ticks = rng.gen_range(WANDER_MIN_TICKS..=WANDER_MAX_TICKS);
            let angle = rng.gen::<f32>() * std::f32::consts::TAU;
            self.velocity = Vec3::new(angle.cos() * MOB_SPEED, 0.0, angle.sin() * MOB_SPEED);
        }
    }

    /// Moves by one sub-step. Returns whether the mob moved.
    pub fn integrate(&mut self, dt: f32) -> bool {
        let step = self.velocity.scale(dt);
        if step == Vec3::ZERO {
            return false;
        }
        self.position += step;
        true
    }

    pub fn update(&self) -> MobUpdate {
        MobUpdate {
            id: self.id.clone(),
            pos: self.position.rounded(),
        }
    }
}

/// Fresh 4-character mob id not present in `mobs`.
pub fn new_mob_id(mobs: &BTreeMap<String, Mob>) -> String {
    loop {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(4);
        if !mobs.contains_key(&id) {
            return id;
        }
    }
}

/// Message produced during simulation, delivered after the mob pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Broadcast(ServerMessage),
    Direct(ConnId, ServerMessage),
}

/// Hurts every vulnerable online player touching `mob_pos`. Lethal hits
/// respawn the player. Returns whether anyone was hurt.
pub fn apply_contact_damage<'a>(
    mob_pos: Vec3,
    sessions: impl Iterator<Item = &'a mut Session>,
    now: Instant,
    out: &mut Vec<Outgoing>,
) -> bool {
    let mut hurt = false;
    for s in sessions {
        if !s.is_online() || s.health <= 0 {
            continue;
        }
        if s.position.distance_sq(mob_pos) >= CONTACT_RANGE_SQ || s.is_invulnerable(now) {
            continue;
        }
        hurt = true;
        let lethal = s.take_hit(CONTACT_DAMAGE, now);
        out.push(Outgoing::Broadcast(ServerMessage::PlayerDamage {
            player_id: s.id.clone(),
            health: s.health,
        }));
        if lethal {
            s.respawn();
            if let Some(conn) = s.conn {
                out.push(Outgoing::Direct(
                    conn,
                    ServerMessage::PlayerState {
                        player_id: s.id.clone(),
                        position: s.position,
                        rotation: None,
                    },
                ));
            }
            out.push(Outgoing::Broadcast(ServerMessage::PlayerDamage {
                player_id: s.id.clone(),
                health: s.health,
            }));
        }
    }
    hurt
}
