//! Server implementation.
//!
//! One task owns the [`World`] and multiplexes:
//! - new WebSocket connections (each served by its own task)
//! - events posted by connection tasks and generation callbacks
//! - fixed-step ticks from the scheduler
//! - operator console lines
//!
//! Connection tasks never touch world state; they translate frames into
//! [`WorldEvent`]s and drain their outbound queue.

use std::{future::Future, net::SocketAddr};

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};
use voxel_shared::{
    config::ServerConfig,
    scheduler::{FixedStepScheduler, TickReceiver},
};

use crate::{
    session::{ConnId, Outbound},
    worker::WorkerHandle,
    world::{World, WorldEvent},
};

/// Game server.
pub struct GameServer {
    pub cfg: ServerConfig,
    listener: TcpListener,
    world: World,

    events_tx: mpsc::UnboundedSender<WorldEvent>,
    events_rx: mpsc::UnboundedReceiver<WorldEvent>,

    scheduler: FixedStepScheduler,
    ticks: TickReceiver,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
    quit: bool,
}

impl GameServer {
    /// Binds the listener on `cfg.ws_addr` and loads the world.
    pub async fn bind(cfg: ServerConfig, worker: WorkerHandle) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(cfg.ws_addr.as_str())
            .await
            .with_context(|| format!("bind {}", cfg.ws_addr))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let world = World::new(cfg.clone(), worker, events_tx.clone());
        let scheduler = FixedStepScheduler::new(cfg.tick_hz);
        let ticks = scheduler.subscribe();

        Ok(Self {
            cfg,
            listener,
            world,
            events_tx,
            events_rx,
            scheduler,
            ticks,
            console_rx: None,
            quit: false,
        })
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("local_addr")
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Serves until `shutdown` resolves or the console asks to quit, then
    /// flushes the world and closes every connection.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        self.scheduler.start();
        info!(addr = %self.local_addr()?, tick_hz = self.cfg.tick_hz, "Server running");

        while !self.quit {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve_connection(stream, peer, self.events_tx.clone()));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                Some(event) = self.events_rx.recv() => self.world.handle_event(event),
                Some(_) = self.ticks.recv() => self.world.tick(),
                Some(line) = recv_console(&mut self.console_rx) => {
                    for out in self.exec_console(&line) {
                        println!("{out}");
                    }
                }
            }
        }

        self.scheduler.stop();
        self.world.shutdown();
        Ok(())
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Vec::new();
        };

        match cmd {
            "status" => self.world.status(),
            "save" => {
                if self.world.save() {
                    vec!["World saved".to_string()]
                } else {
                    vec!["Save failed, see log".to_string()]
                }
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                self.quit = true;
                vec!["Shutting down".to_string()]
            }
            "help" => vec!["Commands: status, save, quit".to_string()],
            other => vec![format!("Unknown command: {other}")],
        }
    }
}

async fn recv_console(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Upgrades one TCP stream and pumps frames between it and the world.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<WorldEvent>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let conn = ConnId::new_unique();
    info!(%conn, %peer, "Client connected");

    let (tx, mut rx) = mpsc::unbounded_channel();
    if events.send(WorldEvent::Connected { conn, tx }).is_err() {
        return;
    }
    let (mut sink, mut stream) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let msg = match frame {
                Outbound::Text(text) => Message::Text(text),
                Outbound::Binary(bytes) => Message::Binary(bytes.to_vec()),
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if events.send(WorldEvent::Text { conn, text }).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%conn, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    let _ = events.send(WorldEvent::Disconnected { conn });
    writer.abort();
    info!(%conn, %peer, "Client disconnected");
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(
    mut cfg: ServerConfig,
    worker: WorkerHandle,
) -> anyhow::Result<(GameServer, SocketAddr)> {
    cfg.ws_addr = "127.0.0.1:0".to_string();
    let mut server = GameServer::bind(cfg, worker).await?;
    let addr = server.local_addr()?;
    server.cfg.ws_addr = addr.to_string();
    Ok((server, addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerChannel;

    fn temp_config(name: &str) -> ServerConfig {
        let dir = std::env::temp_dir().join(format!("voxel-server-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        ServerConfig {
            world_file: dir.join("world.json"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn console_commands() {
        let (mut server, _) = bind_ephemeral(temp_config("console"), WorkerChannel::unavailable())
            .await
            .unwrap();

        assert!(server.exec_console("   ").is_empty());
        assert!(server.exec_console("status")[0].starts_with("Tick: 0"));
        assert_eq!(server.exec_console("save"), vec!["World saved"]);
        assert!(server.cfg.world_file.exists());
        assert_eq!(server.exec_console("frobnicate"), vec!["Unknown command: frobnicate"]);
        assert!(!server.quit);
        server.exec_console("quit");
        assert!(server.quit);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_flushes() {
        let cfg = temp_config("shutdown");
        let path = cfg.world_file.clone();
        let (server, _) = bind_ephemeral(cfg, WorkerChannel::unavailable())
            .await
            .unwrap();
        server.run(async {}).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn console_quit_ends_run() {
        let (mut server, _) = bind_ephemeral(temp_config("quit"), WorkerChannel::unavailable())
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(4);
        server.set_console_input(rx);
        tx.send("quit".to_string()).await.unwrap();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            server.run(std::future::pending()),
        )
        .await
        .expect("run did not stop")
        .unwrap();
    }
}
