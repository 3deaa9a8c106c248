//! Client implementation.
//!
//! A thin protocol client used to verify a running server:
//! - JSON control messages over WebSocket text frames
//! - chunk payloads over binary frames, each announced by `CHUNK_DATA`

use std::time::Duration;

use anyhow::{bail, Context};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use voxel_shared::{
    chunk::{Chunk, ChunkKey},
    net::{ClientMessage, ServerMessage},
};

/// Default time budget for one verification run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message(ServerMessage),
    Binary(Vec<u8>),
}

/// An authenticated protocol session.
pub struct VerifyClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub player_id: String,
    pub name: String,
}

impl VerifyClient {
    /// Connects and authenticates as a new player.
    pub async fn connect(url: &str, name: &str) -> anyhow::Result<Self> {
        Self::connect_as(url, None, name).await
    }

    /// Connects and authenticates, resuming `player_id` when given.
    pub async fn connect_as(
        url: &str,
        player_id: Option<&str>,
        name: &str,
    ) -> anyhow::Result<Self> {
        info!(%url, "Connecting to server");
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("connect {url}"))?;
        let mut client = Self {
            ws,
            player_id: String::new(),
            name: String::new(),
        };
        client
            .send(&ClientMessage::Auth {
                player_id: player_id.map(Value::from),
                name: Some(Value::from(name)),
            })
            .await?;

        match client.recv().await? {
            Incoming::Message(ServerMessage::AuthOk { player_id, name }) => {
                info!(player_id = %player_id, name = %name, "Authenticated");
                client.player_id = player_id;
                client.name = name;
                Ok(client)
            }
            other => bail!("expected AUTH_OK, got {other:?}"),
        }
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> anyhow::Result<()> {
        let text = serde_json::to_string(msg).context("encode message")?;
        self.send_raw(text).await
    }

    /// Sends a text frame verbatim.
    pub async fn send_raw(&mut self, text: String) -> anyhow::Result<()> {
        self.ws
            .send(Message::Text(text))
            .await
            .context("send frame")
    }

    /// Next text or binary frame. Control frames are skipped.
    pub async fn recv(&mut self) -> anyhow::Result<Incoming> {
        loop {
            let frame = self
                .ws
                .next()
                .await
                .context("connection closed")?
                .context("receive frame")?;
            match frame {
                Message::Text(text) => {
                    let msg = ServerMessage::decode(&text)
                        .with_context(|| format!("decode server message {text}"))?;
                    return Ok(Incoming::Message(msg));
                }
                Message::Binary(data) => return Ok(Incoming::Binary(data)),
                Message::Close(_) => bail!("server closed the connection"),
                _ => {}
            }
        }
    }

    /// Skips frames until `pred` matches a message.
    pub async fn wait_for(
        &mut self,
        mut pred: impl FnMut(&ServerMessage) -> bool,
    ) -> anyhow::Result<ServerMessage> {
        loop {
            if let Incoming::Message(msg) = self.recv().await? {
                if pred(&msg) {
                    return Ok(msg);
                }
                debug!(?msg, "Skipping message");
            }
        }
    }

    /// Requests the chunk containing chunk coordinates (`cx`, `cz`) and
    /// returns the raw payload that follows its `CHUNK_DATA` header.
    pub async fn get_chunk(&mut self, cx: i32, cz: i32) -> anyhow::Result<Vec<u8>> {
        self.send(&ClientMessage::GetChunk {
            x: f64::from(cx),
            z: f64::from(cz),
        })
        .await?;
        self.wait_for(|m| matches!(m, ServerMessage::ChunkData { cx: x, cz: z } if *x == cx && *z == cz))
            .await?;
        match self.recv().await? {
            Incoming::Binary(data) => Ok(data),
            other => bail!("expected chunk payload, got {other:?}"),
        }
    }

    pub async fn close(mut self) -> anyhow::Result<()> {
        self.ws.close(None).await.context("close")
    }
}

/// Outcome of a successful verification run.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyReport {
    pub player_id: String,
    pub chunk: ChunkKey,
    pub solid_voxels: usize,
}

/// Authenticates, fetches chunk (0, 0) and checks its size, all within
/// `timeout`.
pub async fn verify(url: &str, name: &str, timeout: Duration) -> anyhow::Result<VerifyReport> {
    let run = async {
        let mut client = VerifyClient::connect(url, name).await?;
        let key = ChunkKey::new(0, 0);
        let payload = client.get_chunk(key.cx, key.cz).await?;
        let chunk = Chunk::from_payload(&payload).context("chunk payload")?;
        let solid_voxels = chunk.voxels().iter().filter(|&&v| v != 0).count();
        let report = VerifyReport {
            player_id: client.player_id.clone(),
            chunk: key,
            solid_voxels,
        };
        let _ = client.close().await;
        Ok::<_, anyhow::Error>(report)
    };
    tokio::time::timeout(timeout, run)
        .await
        .with_context(|| format!("no answer within {timeout:?}"))?
}
