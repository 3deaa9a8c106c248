//! Configuration system.
//!
//! Server configuration is a plain serde struct handed to each component at
//! construction. Sources, lowest precedence first: defaults, a JSON file,
//! environment variables, then command-line flags (applied by the binary).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
}

/// How to launch the chunk generation worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Executable to spawn.
    pub program: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["engine_py/world_gen.py".to_string()],
        }
    }
}

/// Root server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket listen address, e.g. `0.0.0.0:8081`.
    #[serde(default = "default_ws_addr")]
    pub ws_addr: String,
    /// Snapshot file. A `.tmp` sibling is used for atomic writes.
    #[serde(default = "default_world_file")]
    pub world_file: PathBuf,
    /// Seed forwarded to the generation worker.
    #[serde(default = "default_world_seed")]
    pub world_seed: i32,
    /// Simulation tick rate. Persistence runs once every `tick_hz` ticks.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Block edits a session may make per persistence window.
    #[serde(default = "default_max_edits")]
    pub max_edits_per_sec: u32,
    /// Mobs created at startup.
    #[serde(default = "default_mob_count")]
    pub mob_count: u32,
    #[serde(default)]
    pub worker: WorkerConfig,
}

fn default_ws_addr() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_world_file() -> PathBuf {
    PathBuf::from("world.json")
}

fn default_world_seed() -> i32 {
    12345
}

fn default_tick_hz() -> u32 {
    10
}

fn default_max_edits() -> u32 {
    10
}

fn default_mob_count() -> u32 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_addr: default_ws_addr(),
            world_file: default_world_file(),
            world_seed: default_world_seed(),
            tick_hz: default_tick_hz(),
            max_edits_per_sec: default_max_edits(),
            mob_count: default_mob_count(),
            worker: WorkerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Reads and parses a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    ///
    /// `HOST` and `WS_PORT` each replace their half of `ws_addr`.
    pub fn apply_vars(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let host = lookup("HOST");
        let port = lookup("WS_PORT");
        if host.is_some() || port.is_some() {
            let (cur_host, cur_port) = self
                .ws_addr
                .rsplit_once(':')
                .map(|(h, p)| (h.to_string(), p.to_string()))
                .unwrap_or_else(|| (self.ws_addr.clone(), "8081".to_string()));
            if let Some(p) = &port {
                p.parse::<u16>().map_err(|_| ConfigError::InvalidEnv {
                    key: "WS_PORT",
                    value: p.clone(),
                })?;
            }
            self.ws_addr = format!(
                "{}:{}",
                host.unwrap_or(cur_host),
                port.unwrap_or(cur_port)
            );
        }
        if let Some(file) = lookup("WORLD_FILE") {
            self.world_file = PathBuf::from(file);
        }
        if let Some(seed) = lookup("WORLD_SEED") {
            self.world_seed = seed.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "WORLD_SEED",
                value: seed.clone(),
            })?;
        }
        if let Some(hz) = lookup("TICK_RATE") {
            self.tick_hz = match hz.parse::<u32>() {
                Ok(v) if v > 0 => v,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "TICK_RATE",
                        value: hz,
                    })
                }
            };
        }
        if let Some(program) = lookup("WORKER_PROGRAM") {
            self.worker.program = program;
        }
        Ok(())
    }

    /// Simulation ticks per persistence window (at least one).
    pub fn ticks_per_save(&self) -> u64 {
        u64::from(self.tick_hz.max(1))
    }

    /// Seconds of simulated time per tick.
    pub fn tick_dt(&self) -> f32 {
        1.0 / self.tick_hz.max(1) as f32
    }
}
