//! Authoritative world state.
//!
//! `World` owns every session, mob and cached chunk. It is driven by one
//! task: connection events, generation results and scheduler ticks are fed
//! to it one at a time, and each handler runs to completion, so nothing here
//! is locked.
//!
//! Determinism notes:
//! - Sessions and mobs live in ordered maps; iteration order is stable.
//! - Mob randomness comes from a single owned RNG.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant as StdInstant;

use bytes::Bytes;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::Value;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, trace, warn};
use voxel_shared::{
    chunk::{Chunk, ChunkKey, AIR},
    config::ServerConfig,
    math::Vec3,
    net::{sanitize_name, ClientMessage, EntityKind, ServerMessage, TargetKind},
};

use crate::{
    mobs::{apply_contact_damage, new_mob_id, Mob, Outgoing, ATTACK_DAMAGE, ATTACK_RANGE},
    perf::TickStats,
    persist::{SnapshotStore, WorldSnapshot, SNAPSHOT_VERSION},
    session::{new_session_id, ConnId, ConnTx, Outbound, Session},
    worker::{GenerationRequest, WorkerError, WorkerHandle},
};

/// Inputs to the world, in arrival order.
#[derive(Debug)]
pub enum WorldEvent {
    Connected { conn: ConnId, tx: ConnTx },
    Text { conn: ConnId, text: String },
    Disconnected { conn: ConnId },
    ChunkReady {
        key: ChunkKey,
        result: Result<Bytes, WorkerError>,
    },
    /// A background snapshot write completed.
    SaveFinished { result: anyhow::Result<()> },
}

struct Connection {
    tx: ConnTx,
    session: Option<String>,
}

/// The simulation and everything it owns.
pub struct World {
    cfg: ServerConfig,
    worker: WorkerHandle,
    events: mpsc::UnboundedSender<WorldEvent>,
    store: SnapshotStore,

    conns: HashMap<ConnId, Connection>,
    sessions: BTreeMap<String, Session>,
    mobs: BTreeMap<String, Mob>,
    chunks: HashMap<ChunkKey, Chunk>,
    /// Coordinates with a generation request outstanding, and who asked.
    generating: HashMap<ChunkKey, Vec<ConnId>>,

    rng: StdRng,
    dirty: bool,
    /// A background save is in flight.
    saving: bool,
    tick: u64,
    save_failures: u64,
    perf: TickStats,
}

impl World {
    /// Loads the snapshot named in `cfg` (if any) and spawns mobs.
    /// `events` must feed back into this world's event loop.
    pub fn new(
        cfg: ServerConfig,
        worker: WorkerHandle,
        events: mpsc::UnboundedSender<WorldEvent>,
    ) -> Self {
        Self::with_rng(cfg, worker, events, StdRng::from_entropy())
    }

    pub fn with_rng(
        cfg: ServerConfig,
        worker: WorkerHandle,
        events: mpsc::UnboundedSender<WorldEvent>,
        rng: StdRng,
    ) -> Self {
        let store = SnapshotStore::new(cfg.world_file.clone());
        let mut world = Self {
            cfg,
            worker,
            events,
            store,
            conns: HashMap::new(),
            sessions: BTreeMap::new(),
            mobs: BTreeMap::new(),
            chunks: HashMap::new(),
            generating: HashMap::new(),
            rng,
            dirty: false,
            saving: false,
            tick: 0,
            save_failures: 0,
            perf: TickStats::default(),
        };
        world.load();
        world.init_mobs();
        world
    }

    fn load(&mut self) {
        let snapshot = match self.store.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!(path = %self.store.path().display(), "No saved world, starting fresh");
                return;
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Failed to load saved world, starting fresh");
                return;
            }
        };
        self.restore(snapshot);
        info!(
            chunks = self.chunks.len(),
            players = self.sessions.len(),
            "World loaded"
        );
    }

    fn restore(&mut self, snapshot: WorldSnapshot) {
        for (key, voxels) in snapshot.chunks {
            let Some(parsed) = ChunkKey::parse(&key) else {
                warn!(key = %key, "Skipping saved chunk with bad key");
                continue;
            };
            match Chunk::from_voxels(voxels) {
                Ok(chunk) => {
                    self.chunks.insert(parsed, chunk);
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping malformed saved chunk"),
            }
        }
        for record in snapshot.players {
            self.sessions
                .insert(record.id.clone(), Session::from_record(record));
        }
    }

    fn init_mobs(&mut self) {
        if !self.mobs.is_empty() {
            return;
        }
        for _ in 0..self.cfg.mob_count {
            let id = new_mob_id(&self.mobs);
            let mob = Mob::spawn(id.clone(), &mut self.rng);
            debug!(mob = %id, pos = ?mob.position, "Spawned mob");
            self.mobs.insert(id, mob);
        }
    }

    // ─── Accessors ───

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn mobs(&self) -> impl Iterator<Item = &Mob> {
        self.mobs.values()
    }

    pub fn chunk(&self, key: ChunkKey) -> Option<&Chunk> {
        self.chunks.get(&key)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn save_failures(&self) -> u64 {
        self.save_failures
    }

    // ─── Events ───

    pub fn handle_event(&mut self, event: WorldEvent) {
        match event {
            WorldEvent::Connected { conn, tx } => {
                debug!(%conn, "Connection registered");
                self.conns.insert(conn, Connection { tx, session: None });
            }
            WorldEvent::Text { conn, text } => self.on_text(conn, &text),
            WorldEvent::Disconnected { conn } => self.on_disconnect(conn),
            WorldEvent::ChunkReady { key, result } => self.on_chunk_ready(key, result),
            WorldEvent::SaveFinished { result } => self.on_save_finished(result),
        }
    }

    fn on_text(&mut self, conn: ConnId, text: &str) {
        let Some(session) = self.conns.get(&conn).map(|c| c.session.clone()) else {
            return;
        };
        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%conn, error = %e, "Dropping client message");
                return;
            }
        };
        match (session, msg) {
            (None, ClientMessage::Auth { player_id, name }) => {
                self.authenticate(conn, player_id, name)
            }
            (None, _) => trace!(%conn, "Ignoring message before AUTH"),
            (Some(sid), msg) => self.dispatch(conn, &sid, msg),
        }
    }

    fn dispatch(&mut self, conn: ConnId, sid: &str, msg: ClientMessage) {
        match msg {
            ClientMessage::Auth { .. } => debug!(%conn, "Ignoring repeated AUTH"),
            ClientMessage::GetChunk { x, z } => self.get_chunk(conn, x, z),
            ClientMessage::BreakBlock { x, y, z } => self.edit_block(sid, [x, y, z], Some(AIR)),
            ClientMessage::PlaceBlock { x, y, z, block_id } => {
                self.edit_block(sid, [x, y, z], block_id)
            }
            ClientMessage::PlayerState { position, rotation } => {
                self.update_player(conn, sid, position, rotation)
            }
            ClientMessage::Attack {
                target_type: TargetKind::Mob,
                target_id,
            } => self.attack_mob(sid, &target_id),
        }
    }

    // ─── Sessions ───

    fn authenticate(&mut self, conn: ConnId, player_id: Option<Value>, name: Option<Value>) {
        let name = sanitize_name(name.as_ref().and_then(Value::as_str));

        let resumed = player_id
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|id| self.sessions.get_mut(id));
        let sid = match resumed {
            Some(session) => {
                if let Some(old) = session.conn.replace(conn).filter(|&old| old != conn) {
                    if let Some(prev) = self.conns.get_mut(&old) {
                        prev.session = None;
                        let _ = prev.tx.send(Outbound::Close);
                    }
                    debug!(session = %session.id, %old, "Detached superseded connection");
                }
                session.authenticated = true;
                session.name = name;
                info!(session = %session.id, name = %session.name, %conn, "Player reconnected");
                session.id.clone()
            }
            None => {
                let mut id = new_session_id();
                while self.sessions.contains_key(&id) {
                    id = new_session_id();
                }
                info!(session = %id, name = %name, %conn, "Player joined");
                self.sessions
                    .insert(id.clone(), Session::spawn(id.clone(), name, conn));
                self.dirty = true;
                id
            }
        };
        if let Some(c) = self.conns.get_mut(&conn) {
            c.session = Some(sid.clone());
        }

        let Some(session) = self.sessions.get(&sid) else {
            return;
        };
        let (name, position, health) = (session.name.clone(), session.position, session.health);

        self.send(
            conn,
            &ServerMessage::AuthOk {
                player_id: sid.clone(),
                name: name.clone(),
            },
        );
        self.send(
            conn,
            &ServerMessage::PlayerDamage {
                player_id: sid.clone(),
                health,
            },
        );
        self.broadcast_except(
            conn,
            &ServerMessage::PlayerJoin {
                player_id: sid.clone(),
                position,
            },
        );
        self.broadcast_except(
            conn,
            &ServerMessage::PlayerInfo {
                player_id: sid.clone(),
                name,
            },
        );

        let mut dump = Vec::new();
        for other in self.sessions.values() {
            if other.id == sid || !other.is_online() {
                continue;
            }
            dump.push(ServerMessage::PlayerJoin {
                player_id: other.id.clone(),
                position: other.position,
            });
            dump.push(ServerMessage::PlayerInfo {
                player_id: other.id.clone(),
                name: other.name.clone(),
            });
        }
        for mob in self.mobs.values() {
            dump.push(ServerMessage::MobSpawn {
                mob_id: mob.id.clone(),
                position: mob.position,
            });
        }
        for msg in &dump {
            self.send(conn, msg);
        }
    }

    fn on_disconnect(&mut self, conn: ConnId) {
        let Some(closed) = self.conns.remove(&conn) else {
            return;
        };
        let Some(sid) = closed.session else {
            debug!(%conn, "Unauthenticated connection closed");
            return;
        };
        let Some(session) = self.sessions.get_mut(&sid) else {
            return;
        };
        if session.conn != Some(conn) {
            return;
        }
        session.conn = None;
        session.authenticated = false;
        info!(session = %sid, name = %session.name, %conn, "Player disconnected");
        self.broadcast(&ServerMessage::PlayerLeave { player_id: sid });
    }

    fn update_player(
        &mut self,
        conn: ConnId,
        sid: &str,
        position: Option<Value>,
        rotation: Option<Value>,
    ) {
        let Some(session) = self.sessions.get_mut(sid) else {
            return;
        };
        let position = position
            .and_then(|v| serde_json::from_value::<Vec3>(v).ok())
            .filter(|p| p.is_finite());
        if let Some(pos) = position {
            session.position = pos;
        }
        if rotation.is_some() {
            session.rotation = rotation;
        }
        let msg = ServerMessage::PlayerState {
            player_id: session.id.clone(),
            position: session.position.rounded(),
            rotation: session.rotation.clone(),
        };
        self.broadcast_except(conn, &msg);
    }

    // ─── Chunks ───

    fn get_chunk(&mut self, conn: ConnId, x: f64, z: f64) {
        if !(x.is_finite() && z.is_finite()) {
            return;
        }
        let key = ChunkKey::new(x.floor() as i32, z.floor() as i32);

        if let Some(chunk) = self.chunks.get(&key) {
            let bytes = chunk.to_bytes();
            self.send_chunk(conn, key, bytes);
            return;
        }
        if let Some(waiting) = self.generating.get_mut(&key) {
            if !waiting.contains(&conn) {
                waiting.push(conn);
            }
            trace!(%key, %conn, "Chunk already generating");
            return;
        }

        debug!(%key, %conn, "Requesting chunk generation");
        self.generating.insert(key, vec![conn]);
        let reply = self.worker.submit(GenerationRequest {
            x: key.cx,
            y: 0,
            z: key.cz,
            seed: self.cfg.world_seed,
        });
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = reply.await.unwrap_or(Err(WorkerError::Unavailable));
            let _ = events.send(WorldEvent::ChunkReady { key, result });
        });
    }

    fn on_chunk_ready(&mut self, key: ChunkKey, result: Result<Bytes, WorkerError>) {
        let waiting = self.generating.remove(&key).unwrap_or_default();
        let payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%key, error = %e, waiting = waiting.len(), "Chunk generation failed");
                return;
            }
        };
        let chunk = match Chunk::from_payload(&payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(%key, error = %e, "Rejecting generated chunk");
                return;
            }
        };
        self.chunks.insert(key, chunk);
        self.dirty = true;
        debug!(%key, waiting = waiting.len(), "Chunk cached");
        for conn in waiting {
            self.send_chunk(conn, key, payload.clone());
        }
    }

    fn send_chunk(&self, conn: ConnId, key: ChunkKey, bytes: Bytes) {
        self.send(
            conn,
            &ServerMessage::ChunkData {
                cx: key.cx,
                cz: key.cz,
            },
        );
        self.send_raw(conn, Outbound::Binary(bytes));
    }

    fn edit_block(&mut self, sid: &str, coords: [Option<f64>; 3], block: Option<u16>) {
        let ([Some(x), Some(y), Some(z)], Some(block)) = (coords, block) else {
            return;
        };
        if !(x.is_finite() && y.is_finite() && z.is_finite()) {
            return;
        }
        let Some(session) = self.sessions.get_mut(sid) else {
            return;
        };
        if session.edits >= self.cfg.max_edits_per_sec {
            debug!(session = %sid, "Block edit rate limited");
            return;
        }
        session.edits += 1;

        let (x, y, z) = (x.floor() as i32, y.floor() as i32, z.floor() as i32);
        let key = ChunkKey::containing(x, z);
        let Some(chunk) = self.chunks.get_mut(&key) else {
            trace!(%key, "Block edit in unloaded chunk");
            return;
        };
        if !chunk.set_world(x, y, z, block) {
            return;
        }
        self.dirty = true;
        self.broadcast(&ServerMessage::BlockUpdate {
            x,
            y,
            z,
            block_id: block,
        });
    }

    // ─── Combat ───

    fn attack_mob(&mut self, sid: &str, target: &str) {
        let Some(attacker) = self.sessions.get(sid).map(|s| s.position) else {
            return;
        };
        let Some(mob) = self.mobs.get_mut(target) else {
            return;
        };
        if mob.position.distance(attacker) >= ATTACK_RANGE {
            return;
        }
        mob.health -= ATTACK_DAMAGE;
        if mob.health > 0 {
            return;
        }
        self.mobs.remove(target);
        info!(mob = %target, session = %sid, "Mob killed");
        self.broadcast(&ServerMessage::EntityDeath {
            entity_type: EntityKind::Mob,
            entity_id: target.to_string(),
        });
    }

    // ─── Ticks ───

    /// One simulation step. Every `tick_hz` steps also runs persistence.
    pub fn tick(&mut self) {
        let started = StdInstant::now();
        self.tick += 1;
        self.simulate();
        if self.tick % self.cfg.ticks_per_save() == 0 {
            self.persistence_tick();
        }
        if let Some(report) = self.perf.record(started.elapsed()) {
            info!(
                ticks = report.ticks,
                avg_ms = report.avg.as_secs_f64() * 1000.0,
                max_ms = report.max.as_secs_f64() * 1000.0,
                "Tick timing"
            );
        }
    }

    fn simulate(&mut self) {
        let dt = self.cfg.tick_dt();
        let now = Instant::now();
        let mut moved = Vec::new();
        let mut out = Vec::new();

        for mob in self.mobs.values_mut() {
            mob.wander(&mut self.rng);
            if mob.integrate(dt) {
                moved.push(mob.update());
            }
            if apply_contact_damage(mob.position, self.sessions.values_mut(), now, &mut out) {
                self.dirty = true;
            }
        }

        for item in &out {
            match item {
                Outgoing::Broadcast(msg) => self.broadcast(msg),
                Outgoing::Direct(conn, msg) => self.send(*conn, msg),
            }
        }
        if !moved.is_empty() {
            self.broadcast(&ServerMessage::MobState { mobs: moved });
        }
    }

    fn persistence_tick(&mut self) {
        if self.dirty && !self.saving {
            self.save_in_background();
        }
        for session in self.sessions.values_mut() {
            session.edits = 0;
        }
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            version: SNAPSHOT_VERSION,
            chunks: self
                .chunks
                .iter()
                .map(|(key, chunk)| (key.to_string(), chunk.voxels().to_vec()))
                .collect(),
            players: self.sessions.values().map(Session::to_record).collect(),
        }
    }

    /// Writes the snapshot now. On failure the world stays dirty so the next
    /// persistence tick retries.
    pub fn save(&mut self) -> bool {
        match self.store.save(&self.snapshot()) {
            Ok(()) => {
                self.dirty = false;
                debug!(path = %self.store.path().display(), "World saved");
                true
            }
            Err(e) => {
                self.record_save_failure(&e);
                false
            }
        }
    }

    /// Serializes here and writes on a blocking thread. The result comes
    /// back as [`WorldEvent::SaveFinished`].
    fn save_in_background(&mut self) {
        let pending = match self.store.prepare(&self.snapshot()) {
            Ok(pending) => pending,
            Err(e) => {
                self.record_save_failure(&e);
                return;
            }
        };
        self.dirty = false;
        self.saving = true;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || pending.write()).await {
                Ok(written) => written.map(|_| ()),
                Err(e) => Err(anyhow::anyhow!("save task failed: {e}")),
            };
            let _ = events.send(WorldEvent::SaveFinished { result });
        });
    }

    fn on_save_finished(&mut self, result: anyhow::Result<()>) {
        self.saving = false;
        match result {
            Ok(()) => debug!(path = %self.store.path().display(), "World saved"),
            Err(e) => {
                self.dirty = true;
                self.record_save_failure(&e);
            }
        }
    }

    fn record_save_failure(&mut self, e: &anyhow::Error) {
        self.save_failures += 1;
        warn!(
            error = %format!("{e:#}"),
            failures = self.save_failures,
            "Failed to save world"
        );
    }

    /// Final flush and close of every connection.
    pub fn shutdown(&mut self) {
        self.save();
        for conn in self.conns.values() {
            let _ = conn.tx.send(Outbound::Close);
        }
        info!(path = %self.store.path().display(), "World flushed");
    }

    pub fn status(&self) -> Vec<String> {
        let online = self.sessions.values().filter(|s| s.is_online()).count();
        let mut out = vec![
            format!("Tick: {}", self.tick),
            format!(
                "Sessions: {} ({} online), connections: {}",
                self.sessions.len(),
                online,
                self.conns.len()
            ),
            format!(
                "Mobs: {}, chunks: {} ({} generating)",
                self.mobs.len(),
                self.chunks.len(),
                self.generating.len()
            ),
            format!(
                "Dirty: {}, saving: {}, save failures: {}",
                self.dirty, self.saving, self.save_failures
            ),
        ];
        for s in self.sessions.values().filter(|s| s.is_online()) {
            out.push(format!(
                "  {} {:?} hp={} pos=({:.1}, {:.1}, {:.1})",
                s.id, s.name, s.health, s.position.x, s.position.y, s.position.z
            ));
        }
        out
    }

    // ─── Outbound ───

    fn send(&self, conn: ConnId, msg: &ServerMessage) {
        match msg.encode() {
            Ok(text) => self.send_raw(conn, Outbound::Text(text)),
            Err(e) => warn!(error = %e, "Failed to encode message"),
        }
    }

    fn send_raw(&self, conn: ConnId, frame: Outbound) {
        if let Some(c) = self.conns.get(&conn) {
            let _ = c.tx.send(frame);
        }
    }

    /// Sends to every online session.
    fn broadcast(&self, msg: &ServerMessage) {
        self.broadcast_filtered(msg, None);
    }

    fn broadcast_except(&self, exclude: ConnId, msg: &ServerMessage) {
        self.broadcast_filtered(msg, Some(exclude));
    }

    fn broadcast_filtered(&self, msg: &ServerMessage, exclude: Option<ConnId>) {
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode broadcast");
                return;
            }
        };
        for session in self.sessions.values() {
            let Some(conn) = session.conn.filter(|_| session.authenticated) else {
                continue;
            };
            if Some(conn) == exclude {
                continue;
            }
            self.send_raw(conn, Outbound::Text(text.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MAX_HEALTH, SPAWN_POINT};
    use crate::worker::{encode_frame, WorkerChannel, REQUEST_LEN};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use voxel_shared::chunk::CHUNK_BYTES;

    struct Client {
        conn: ConnId,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Client {
        fn frames(&mut self) -> Vec<Outbound> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(frame);
            }
            out
        }

        fn messages(&mut self) -> Vec<ServerMessage> {
            self.frames()
                .into_iter()
                .filter_map(|f| match f {
                    Outbound::Text(t) => Some(ServerMessage::decode(&t).unwrap()),
                    _ => None,
                })
                .collect()
        }
    }

    fn temp_world_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("voxel-world-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir.join("world.json")
    }

    fn test_config(name: &str) -> ServerConfig {
        ServerConfig {
            world_file: temp_world_file(name),
            ..Default::default()
        }
    }

    fn world_with(
        cfg: ServerConfig,
        worker: WorkerHandle,
    ) -> (World, mpsc::UnboundedReceiver<WorldEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let world = World::with_rng(cfg, worker, tx, StdRng::seed_from_u64(99));
        (world, rx)
    }

    fn test_world(name: &str) -> World {
        world_with(test_config(name), WorkerChannel::unavailable()).0
    }

    fn connect(world: &mut World) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ConnId::new_unique();
        world.handle_event(WorldEvent::Connected { conn, tx });
        Client { conn, rx }
    }

    fn say(world: &mut World, client: &Client, text: &str) {
        world.handle_event(WorldEvent::Text {
            conn: client.conn,
            text: text.to_string(),
        });
    }

    /// Authenticates a new player. Returns everything the join sent them.
    fn join(world: &mut World, name: &str) -> (Client, String, Vec<ServerMessage>) {
        let mut client = connect(world);
        say(world, &client, &format!(r#"{{"type":"AUTH","name":"{name}"}}"#));
        let msgs = client.messages();
        let id = match msgs.first() {
            Some(ServerMessage::AuthOk { player_id, .. }) => player_id.clone(),
            other => panic!("expected AUTH_OK, got {other:?}"),
        };
        (client, id, msgs)
    }

    fn stone_chunk() -> Chunk {
        Chunk::from_voxels(vec![1; voxel_shared::chunk::CHUNK_VOLUME]).unwrap()
    }

    #[tokio::test]
    async fn auth_replies_ok_then_health_then_world_state() {
        let mut world = test_world("auth");
        let mut client = connect(&mut world);
        say(&mut world, &client, r#"{"type":"AUTH","name":"Bob"}"#);

        let msgs = client.messages();
        let ServerMessage::AuthOk { player_id, name } = &msgs[0] else {
            panic!("expected AUTH_OK first, got {:?}", msgs[0]);
        };
        assert_eq!(name, "Bob");
        assert_eq!(player_id.len(), 8);
        assert_eq!(
            msgs[1],
            ServerMessage::PlayerDamage {
                player_id: player_id.clone(),
                health: MAX_HEALTH
            }
        );
        let spawns = msgs
            .iter()
            .filter(|m| matches!(m, ServerMessage::MobSpawn { .. }))
            .count();
        assert_eq!(spawns, 5);
        assert!(world.is_dirty());
        assert_eq!(world.session(player_id).unwrap().position, SPAWN_POINT);
    }

    #[tokio::test]
    async fn messages_before_auth_are_ignored() {
        let mut world = test_world("preauth");
        let mut client = connect(&mut world);
        say(&mut world, &client, r#"{"type":"GET_CHUNK","x":0,"z":0}"#);
        say(&mut world, &client, "not json at all");
        say(&mut world, &client, r#"{"type":"PLAYER_STATE"}"#);
        assert!(client.frames().is_empty());
        assert_eq!(world.sessions().count(), 0);
    }

    #[tokio::test]
    async fn join_is_announced_to_others_and_state_dumped_to_newcomer() {
        let mut world = test_world("join");
        let (mut alice, alice_id, _) = join(&mut world, "Alice");
        alice.frames();

        let (_bob, bob_id, to_bob) = join(&mut world, "Bob");
        let to_alice = alice.messages();
        assert!(to_alice.contains(&ServerMessage::PlayerJoin {
            player_id: bob_id.clone(),
            position: SPAWN_POINT
        }));
        assert!(to_alice.contains(&ServerMessage::PlayerInfo {
            player_id: bob_id.clone(),
            name: "Bob".into()
        }));

        assert!(to_bob.contains(&ServerMessage::PlayerJoin {
            player_id: alice_id.clone(),
            position: SPAWN_POINT
        }));
        assert!(to_bob.contains(&ServerMessage::PlayerInfo {
            player_id: alice_id,
            name: "Alice".into()
        }));
        assert!(!to_bob.iter().any(|m| matches!(
            m,
            ServerMessage::PlayerJoin { player_id, .. } if *player_id == bob_id
        )));
    }

    #[tokio::test]
    async fn repeated_auth_is_ignored() {
        let mut world = test_world("reauth");
        let (mut client, id, _) = join(&mut world, "Bob");
        client.frames();
        say(&mut world, &client, r#"{"type":"AUTH","name":"Mallory"}"#);
        assert!(client.frames().is_empty());
        assert_eq!(world.session(&id).unwrap().name, "Bob");
    }

    #[tokio::test]
    async fn reconnect_resumes_session() {
        let mut world = test_world("reconnect");
        let (mut watcher, _, _) = join(&mut world, "Watcher");
        let (client, id, _) = join(&mut world, "Bob");
        say(
            &mut world,
            &client,
            r#"{"type":"PLAYER_STATE","position":{"x":40,"y":12,"z":-3}}"#,
        );
        world.handle_event(WorldEvent::Disconnected { conn: client.conn });
        assert!(watcher.messages().contains(&ServerMessage::PlayerLeave {
            player_id: id.clone()
        }));
        assert!(!world.session(&id).unwrap().is_online());

        let mut again = connect(&mut world);
        say(
            &mut world,
            &again,
            &format!(r#"{{"type":"AUTH","playerId":"{id}","name":"Robert"}}"#),
        );
        assert_eq!(
            again.messages()[0],
            ServerMessage::AuthOk {
                player_id: id.clone(),
                name: "Robert".into()
            }
        );
        let session = world.session(&id).unwrap();
        assert!(session.is_online());
        assert_eq!(session.position, Vec3::new(40.0, 12.0, -3.0));
        assert_eq!(world.sessions().count(), 2);
    }

    #[tokio::test]
    async fn unknown_player_id_mints_new_session() {
        let mut world = test_world("unknown-id");
        let mut client = connect(&mut world);
        say(
            &mut world,
            &client,
            r#"{"type":"AUTH","playerId":"nope","name":"Bob"}"#,
        );
        let ServerMessage::AuthOk { player_id, .. } = &client.messages()[0] else {
            panic!("expected AUTH_OK");
        };
        assert_ne!(player_id, "nope");
    }

    #[tokio::test]
    async fn reattach_closes_older_connection() {
        let mut world = test_world("supersede");
        let (mut first, id, _) = join(&mut world, "Bob");
        first.frames();
        let second = connect(&mut world);
        say(
            &mut world,
            &second,
            &format!(r#"{{"type":"AUTH","playerId":"{id}"}}"#),
        );
        assert!(first.frames().contains(&Outbound::Close));

        // The old connection closing must not log the player out.
        world.handle_event(WorldEvent::Disconnected { conn: first.conn });
        let session = world.session(&id).unwrap();
        assert_eq!(session.conn, Some(second.conn));
        assert!(session.is_online());
    }

    #[tokio::test]
    async fn place_block_broadcasts_to_everyone() {
        let mut world = test_world("place");
        world.chunks.insert(ChunkKey::new(0, 0), Chunk::default());
        let (mut alice, _, _) = join(&mut world, "Alice");
        let (mut bob, _, _) = join(&mut world, "Bob");
        alice.frames();
        bob.frames();
        world.dirty = false;

        say(
            &mut world,
            &alice,
            r#"{"type":"PLACE_BLOCK","x":5,"y":2,"z":5,"blockId":3}"#,
        );
        let expected = ServerMessage::BlockUpdate {
            x: 5,
            y: 2,
            z: 5,
            block_id: 3,
        };
        assert_eq!(alice.messages(), vec![expected.clone()]);
        assert_eq!(bob.messages(), vec![expected]);
        assert_eq!(world.chunk(ChunkKey::new(0, 0)).unwrap().get(5, 2, 5), Some(3));
        assert!(world.is_dirty());

        say(&mut world, &bob, r#"{"type":"BREAK_BLOCK","x":5,"y":2,"z":5}"#);
        assert_eq!(world.chunk(ChunkKey::new(0, 0)).unwrap().get(5, 2, 5), Some(AIR));
    }

    #[tokio::test]
    async fn edits_in_negative_chunks_wrap() {
        let mut world = test_world("negative");
        world.chunks.insert(ChunkKey::new(-1, -1), Chunk::default());
        let (client, _, _) = join(&mut world, "Bob");
        say(
            &mut world,
            &client,
            r#"{"type":"PLACE_BLOCK","x":-1,"y":0,"z":-32,"blockId":7}"#,
        );
        assert_eq!(
            world.chunk(ChunkKey::new(-1, -1)).unwrap().get(31, 0, 0),
            Some(7)
        );
    }

    #[tokio::test]
    async fn edits_on_missing_chunk_or_bad_payload_are_dropped() {
        let mut world = test_world("missing-chunk");
        world.chunks.insert(ChunkKey::new(0, 0), Chunk::default());
        let (mut client, _, _) = join(&mut world, "Bob");
        client.frames();
        world.dirty = false;

        say(
            &mut world,
            &client,
            r#"{"type":"PLACE_BLOCK","x":100,"y":2,"z":5,"blockId":3}"#,
        );
        say(&mut world, &client, r#"{"type":"PLACE_BLOCK","x":1,"y":2,"z":5}"#);
        say(
            &mut world,
            &client,
            r#"{"type":"PLACE_BLOCK","x":1,"y":40,"z":5,"blockId":3}"#,
        );
        assert!(client.frames().is_empty());
        assert!(!world.is_dirty());
    }

    #[tokio::test]
    async fn edit_rate_limit_resets_each_second() {
        let mut cfg = test_config("ratelimit");
        cfg.mob_count = 0;
        let (mut world, _events) = world_with(cfg, WorkerChannel::unavailable());
        world.chunks.insert(ChunkKey::new(0, 0), Chunk::default());
        let (mut client, _, _) = join(&mut world, "Bob");
        client.frames();

        for i in 0..10 {
            say(
                &mut world,
                &client,
                &format!(r#"{{"type":"PLACE_BLOCK","x":{i},"y":0,"z":0,"blockId":1}}"#),
            );
        }
        say(
            &mut world,
            &client,
            r#"{"type":"PLACE_BLOCK","x":20,"y":0,"z":0,"blockId":1}"#,
        );
        assert_eq!(client.messages().len(), 10);
        let chunk = world.chunk(ChunkKey::new(0, 0)).unwrap();
        assert_eq!(chunk.get(9, 0, 0), Some(1));
        assert_eq!(chunk.get(20, 0, 0), Some(AIR));

        for _ in 0..world.cfg.ticks_per_save() {
            world.tick();
        }
        say(
            &mut world,
            &client,
            r#"{"type":"PLACE_BLOCK","x":20,"y":0,"z":0,"blockId":1}"#,
        );
        assert_eq!(world.chunk(ChunkKey::new(0, 0)).unwrap().get(20, 0, 0), Some(1));
    }

    #[tokio::test]
    async fn player_state_goes_to_others_rounded() {
        let mut world = test_world("state");
        let (mut alice, alice_id, _) = join(&mut world, "Alice");
        let (mut bob, _, _) = join(&mut world, "Bob");
        alice.frames();
        bob.frames();

        say(
            &mut world,
            &alice,
            r#"{"type":"PLAYER_STATE","position":{"x":1.23456,"y":2,"z":3.999},"rotation":{"yaw":1.5}}"#,
        );
        assert!(alice.frames().is_empty());
        assert_eq!(
            bob.messages(),
            vec![ServerMessage::PlayerState {
                player_id: alice_id.clone(),
                position: Vec3::new(1.23, 2.0, 4.0),
                rotation: Some(serde_json::json!({"yaw": 1.5})),
            }]
        );
        assert_eq!(
            world.session(&alice_id).unwrap().position,
            Vec3::new(1.23456, 2.0, 3.999)
        );
    }

    #[tokio::test]
    async fn partial_position_still_applies_rotation() {
        let mut world = test_world("partial-state");
        let (mut alice, alice_id, _) = join(&mut world, "Alice");
        let (mut bob, _, _) = join(&mut world, "Bob");
        alice.frames();
        bob.frames();

        say(
            &mut world,
            &alice,
            r#"{"type":"PLAYER_STATE","position":{"x":1},"rotation":{"yaw":0.25}}"#,
        );
        assert_eq!(
            bob.messages(),
            vec![ServerMessage::PlayerState {
                player_id: alice_id.clone(),
                position: SPAWN_POINT.rounded(),
                rotation: Some(serde_json::json!({"yaw": 0.25})),
            }]
        );
        let session = world.session(&alice_id).unwrap();
        assert_eq!(session.position, SPAWN_POINT);
        assert_eq!(session.rotation, Some(serde_json::json!({"yaw": 0.25})));

        say(
            &mut world,
            &alice,
            r#"{"type":"PLAYER_STATE","position":"here"}"#,
        );
        assert_eq!(bob.messages().len(), 1);
        assert_eq!(world.session(&alice_id).unwrap().position, SPAWN_POINT);
    }

    #[tokio::test]
    async fn numeric_player_id_is_treated_as_absent() {
        let mut world = test_world("numeric-id");
        let (_, existing, _) = join(&mut world, "Bob");
        let mut client = connect(&mut world);
        say(
            &mut world,
            &client,
            r#"{"type":"AUTH","playerId":42,"name":7}"#,
        );
        let ServerMessage::AuthOk { player_id, name } = &client.messages()[0] else {
            panic!("expected AUTH_OK");
        };
        assert_ne!(*player_id, existing);
        assert_eq!(player_id.len(), 8);
        assert_eq!(name, &sanitize_name(None));
        assert_eq!(world.sessions().count(), 2);
    }

    #[tokio::test]
    async fn attacks_kill_mob_in_range() {
        let mut cfg = test_config("attack");
        cfg.mob_count = 0;
        let (mut world, _events) = world_with(cfg, WorkerChannel::unavailable());
        world.mobs.insert("m1".into(), Mob::new("m1".into(), SPAWN_POINT));
        world
            .mobs
            .insert("far".into(), Mob::new("far".into(), Vec3::new(100.0, 13.0, 16.0)));
        let (mut client, _, _) = join(&mut world, "Bob");
        client.frames();

        let hit = r#"{"type":"ATTACK","targetType":"mob","targetId":"m1"}"#;
        for _ in 0..3 {
            say(&mut world, &client, hit);
        }
        assert_eq!(world.mobs["m1"].health, 1);
        assert!(client.frames().is_empty());
        say(&mut world, &client, hit);
        assert!(!world.mobs.contains_key("m1"));
        assert_eq!(
            client.messages(),
            vec![ServerMessage::EntityDeath {
                entity_type: EntityKind::Mob,
                entity_id: "m1".into()
            }]
        );

        say(
            &mut world,
            &client,
            r#"{"type":"ATTACK","targetType":"mob","targetId":"far"}"#,
        );
        assert_eq!(world.mobs["far"].health, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn lethal_contact_respawns_player() {
        let mut cfg = test_config("respawn");
        cfg.mob_count = 0;
        let (mut world, _events) = world_with(cfg, WorkerChannel::unavailable());
        let (mut client, id, _) = join(&mut world, "Bob");
        client.frames();

        let spot = Vec3::new(30.0, 12.0, 30.0);
        let mut mob = Mob::new("m1".into(), spot);
        mob.wander_ticks = 1000;
        world.mobs.insert("m1".into(), mob);
        {
            let s = world.sessions.get_mut(&id).unwrap();
            s.position = spot;
            s.health = 2;
        }

        world.tick();
        let msgs = client.messages();
        assert_eq!(
            msgs,
            vec![
                ServerMessage::PlayerDamage {
                    player_id: id.clone(),
                    health: 0
                },
                ServerMessage::PlayerState {
                    player_id: id.clone(),
                    position: SPAWN_POINT,
                    rotation: None
                },
                ServerMessage::PlayerDamage {
                    player_id: id.clone(),
                    health: MAX_HEALTH
                },
            ]
        );
        let s = world.session(&id).unwrap();
        assert_eq!(s.health, MAX_HEALTH);
        assert_eq!(s.position, SPAWN_POINT);
    }

    #[tokio::test(start_paused = true)]
    async fn contact_damage_respects_invulnerability() {
        let mut cfg = test_config("invuln");
        cfg.mob_count = 0;
        let (mut world, _events) = world_with(cfg, WorkerChannel::unavailable());
        let (mut client, id, _) = join(&mut world, "Bob");
        client.frames();
        let mut mob = Mob::new("m1".into(), SPAWN_POINT);
        mob.wander_ticks = 1000;
        world.mobs.insert("m1".into(), mob);

        world.tick();
        world.tick();
        assert_eq!(world.session(&id).unwrap().health, 18);

        tokio::time::advance(Duration::from_millis(1001)).await;
        world.tick();
        assert_eq!(world.session(&id).unwrap().health, 16);
        let damage = client
            .messages()
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::PlayerDamage { .. }))
            .count();
        assert_eq!(damage, 2);
    }

    #[tokio::test]
    async fn moving_mobs_are_batched_into_one_update() {
        let mut world = test_world("mobstate");
        let (mut client, _, _) = join(&mut world, "Bob");
        client.frames();
        world.tick();
        let states: Vec<_> = client
            .messages()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::MobState { mobs } => Some(mobs),
                _ => None,
            })
            .collect();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].len(), 5);
    }

    #[tokio::test]
    async fn chunk_is_generated_once_and_shared() {
        let (server_w, mut worker_r) = duplex(1 << 20);
        let (mut worker_w, server_r) = duplex(1 << 20);
        let worker = WorkerChannel::from_streams(server_w, server_r);
        let (mut world, mut events) = world_with(test_config("genonce"), worker);

        let (mut alice, _, _) = join(&mut world, "Alice");
        let (mut bob, _, _) = join(&mut world, "Bob");
        alice.frames();
        bob.frames();

        let get = r#"{"type":"GET_CHUNK","x":0,"z":0}"#;
        say(&mut world, &alice, get);
        say(&mut world, &bob, get);
        say(&mut world, &alice, get);

        let mut raw = [0u8; REQUEST_LEN];
        worker_r.read_exact(&mut raw).await.unwrap();
        assert_eq!(
            GenerationRequest::decode(&raw),
            GenerationRequest {
                x: 0,
                y: 0,
                z: 0,
                seed: 12345
            }
        );
        let payload: Vec<u8> = (0..CHUNK_BYTES).map(|i| (i % 13) as u8).collect();
        worker_w.write_all(&encode_frame(&payload)).await.unwrap();

        let event = events.recv().await.unwrap();
        world.handle_event(event);

        for client in [&mut alice, &mut bob] {
            let frames = client.frames();
            assert_eq!(frames.len(), 2);
            assert_eq!(
                frames[0],
                Outbound::Text(ServerMessage::ChunkData { cx: 0, cz: 0 }.encode().unwrap())
            );
            assert_eq!(frames[1], Outbound::Binary(Bytes::from(payload.clone())));
        }

        // Cached from now on.
        say(&mut world, &bob, get);
        assert_eq!(bob.frames().len(), 2);
        let mut extra = [0u8; 1];
        let more = tokio::time::timeout(Duration::from_millis(50), worker_r.read_exact(&mut extra)).await;
        assert!(more.is_err(), "chunk requested twice");
    }

    #[tokio::test]
    async fn failed_generation_sends_nothing_and_allows_retry() {
        let (mut world, mut events) =
            world_with(test_config("genfail"), WorkerChannel::unavailable());
        let (mut client, _, _) = join(&mut world, "Bob");
        client.frames();

        say(&mut world, &client, r#"{"type":"GET_CHUNK","x":3,"z":4}"#);
        let event = events.recv().await.unwrap();
        assert!(matches!(
            &event,
            WorldEvent::ChunkReady { result: Err(WorkerError::Unavailable), .. }
        ));
        world.handle_event(event);
        assert!(client.frames().is_empty());
        assert!(world.generating.is_empty());
        assert_eq!(world.chunk_count(), 0);
    }

    #[tokio::test]
    async fn wrong_sized_payload_is_not_cached() {
        let mut world = test_world("badsize");
        let (mut client, _, _) = join(&mut world, "Bob");
        client.frames();
        world.generating.insert(ChunkKey::new(0, 0), vec![client.conn]);
        world.handle_event(WorldEvent::ChunkReady {
            key: ChunkKey::new(0, 0),
            result: Ok(Bytes::from_static(&[1, 2, 3])),
        });
        assert!(client.frames().is_empty());
        assert_eq!(world.chunk_count(), 0);
    }

    /// Feeds the next background save result back into the world.
    async fn finish_save(world: &mut World, events: &mut mpsc::UnboundedReceiver<WorldEvent>) {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("save finished in time")
            .expect("event channel open");
        assert!(matches!(event, WorldEvent::SaveFinished { .. }), "got {event:?}");
        world.handle_event(event);
    }

    #[tokio::test]
    async fn persistence_tick_saves_when_dirty_and_reload_matches() {
        let cfg = test_config("persist");
        let (mut world, mut events) = world_with(cfg.clone(), WorkerChannel::unavailable());
        world.chunks.insert(ChunkKey::new(2, -1), stone_chunk());
        let (client, id, _) = join(&mut world, "Bob");
        say(
            &mut world,
            &client,
            r#"{"type":"PLACE_BLOCK","x":64,"y":5,"z":-30,"blockId":0}"#,
        );
        say(
            &mut world,
            &client,
            r#"{"type":"PLAYER_STATE","position":{"x":7.5,"y":13,"z":8.25}}"#,
        );
        assert!(world.is_dirty());

        for _ in 0..cfg.ticks_per_save() {
            world.tick();
        }
        assert!(!world.is_dirty());
        finish_save(&mut world, &mut events).await;
        assert!(!world.is_dirty());
        assert_eq!(world.save_failures(), 0);
        assert!(cfg.world_file.exists());

        let (reloaded, _events) = world_with(cfg, WorkerChannel::unavailable());
        let original = world.chunk(ChunkKey::new(2, -1)).unwrap();
        assert_eq!(reloaded.chunk(ChunkKey::new(2, -1)), Some(original));
        assert_eq!(original.get(0, 5, 2), Some(AIR));

        let before = world.session(&id).unwrap();
        let after = reloaded.session(&id).unwrap();
        assert_eq!(after.name, before.name);
        assert_eq!(after.position, before.position);
        assert_eq!(after.health, before.health);
        assert!(!after.is_online());
    }

    /// A directory where the file should be makes the rename fail.
    fn unwritable_config(name: &str) -> ServerConfig {
        let dir = std::env::temp_dir().join(format!("voxel-world-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let target = dir.join("world.json");
        std::fs::create_dir_all(target.join("occupied")).unwrap();
        ServerConfig {
            world_file: target,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn failed_save_stays_dirty_and_is_counted() {
        let cfg = unwritable_config("savefail");
        let (mut world, _events) = world_with(cfg, WorkerChannel::unavailable());
        world.dirty = true;
        assert!(!world.save());
        assert!(world.is_dirty());
        assert_eq!(world.save_failures(), 1);
    }

    #[tokio::test]
    async fn failed_background_save_marks_world_dirty_again() {
        let cfg = unwritable_config("bgfail");
        let ticks = cfg.ticks_per_save();
        let (mut world, mut events) = world_with(cfg, WorkerChannel::unavailable());
        world.dirty = true;

        for _ in 0..ticks {
            world.tick();
        }
        assert!(!world.is_dirty());
        // No second save starts while one is in flight.
        world.dirty = true;
        for _ in 0..ticks {
            world.tick();
        }
        finish_save(&mut world, &mut events).await;
        assert!(world.is_dirty());
        assert_eq!(world.save_failures(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn corrupt_save_starts_empty() {
        let cfg = test_config("corrupt");
        std::fs::create_dir_all(cfg.world_file.parent().unwrap()).unwrap();
        std::fs::write(&cfg.world_file, "{{{{").unwrap();
        let (world, _events) = world_with(cfg, WorkerChannel::unavailable());
        assert_eq!(world.chunk_count(), 0);
        assert_eq!(world.sessions().count(), 0);
        assert_eq!(world.mobs().count(), 5);
    }
}
