//! Chunk generation worker channel.
//!
//! One external process generates chunk contents. Requests are written to
//! its stdin as fixed 16-byte records (four big-endian `i32`: x, y, z,
//! seed); responses come back on its stdout as a big-endian `u32` length
//! followed by that many payload bytes. The wire carries no request id, so
//! the channel keeps exactly one request in flight and queues the rest FIFO;
//! every response belongs to the in-flight request.
//!
//! All of this runs on a single task that owns both streams and the queue.
//! Callers talk to it through a cloneable [`WorkerHandle`].

use std::collections::VecDeque;
use std::process::Stdio;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::Command,
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, info, trace, warn};
use voxel_shared::config::WorkerConfig;

/// Size of an encoded request.
pub const REQUEST_LEN: usize = 16;

const LEN_PREFIX: usize = 4;

/// Largest response accepted from the worker. Chunks are 64 KiB.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Generation failures seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The worker is not running, failed to start, or exited.
    #[error("generation worker unavailable")]
    Unavailable,
}

/// Corrupt worker output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("response length {len} exceeds {}", MAX_FRAME_LEN)]
    TooLarge { len: usize },
}

/// Coordinates and seed for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationRequest {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub seed: i32,
}

impl GenerationRequest {
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut buf = BytesMut::with_capacity(REQUEST_LEN);
        buf.put_i32(self.x);
        buf.put_i32(self.y);
        buf.put_i32(self.z);
        buf.put_i32(self.seed);
        let mut out = [0u8; REQUEST_LEN];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(raw: &[u8; REQUEST_LEN]) -> Self {
        let mut buf = &raw[..];
        Self {
            x: buf.get_i32(),
            y: buf.get_i32(),
            z: buf.get_i32(),
            seed: buf.get_i32(),
        }
    }
}

/// Streaming decoder for length-prefixed response frames.
///
/// Bytes may arrive in any split; [`FrameDecoder::next_frame`] yields each
/// complete payload once it is fully buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    expected: Option<usize>,
}

impl FrameDecoder {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Read target for async readers.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete payload, if buffered. A length prefix above
    /// [`MAX_FRAME_LEN`] is an error and leaves the decoder unusable.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        let len = match self.expected {
            Some(len) => len,
            None => {
                if self.buf.len() < LEN_PREFIX {
                    return Ok(None);
                }
                let len = self.buf.get_u32() as usize;
                if len > MAX_FRAME_LEN {
                    return Err(FrameError::TooLarge { len });
                }
                self.expected = Some(len);
                len
            }
        };
        if self.buf.len() < len {
            return Ok(None);
        }
        self.expected = None;
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Encodes a response the way the worker does.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

type Reply = oneshot::Sender<Result<Bytes, WorkerError>>;

struct Pending {
    req: GenerationRequest,
    reply: Reply,
}

struct InFlight {
    id: u64,
    pending: Pending,
}

/// Cloneable handle for submitting generation requests.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<Pending>,
}

impl WorkerHandle {
    /// Queues a request. The receiver resolves with the raw payload, or with
    /// [`WorkerError::Unavailable`] if the worker is gone.
    pub fn submit(&self, req: GenerationRequest) -> oneshot::Receiver<Result<Bytes, WorkerError>> {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(pending)) = self.tx.send(Pending { req, reply }) {
            let _ = pending.reply.send(Err(WorkerError::Unavailable));
        }
        rx
    }

    pub async fn request_generation(
        &self,
        x: i32,
        y: i32,
        z: i32,
        seed: i32,
    ) -> Result<Bytes, WorkerError> {
        self.submit(GenerationRequest { x, y, z, seed })
            .await
            .unwrap_or(Err(WorkerError::Unavailable))
    }
}

/// Constructors for worker channels.
pub struct WorkerChannel;

impl WorkerChannel {
    /// Spawns the configured worker process. Its stderr is inherited. A start
    /// failure is logged once and the returned handle fails every request.
    pub fn spawn(cfg: &WorkerConfig) -> WorkerHandle {
        info!(program = %cfg.program, args = ?cfg.args, "Spawning generation worker");
        let mut child = match Command::new(&cfg.program)
            .args(&cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(program = %cfg.program, error = %e, "Failed to start generation worker");
                return Self::unavailable();
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            error!("Generation worker has no piped stdio");
            return Self::unavailable();
        };

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => warn!(%status, "Generation worker exited"),
                Err(e) => error!(error = %e, "Waiting on generation worker failed"),
            }
        });

        Self::from_streams(stdin, stdout)
    }

    /// Runs the protocol over arbitrary byte streams.
    pub fn from_streams<W, R>(writer: W, reader: R) -> WorkerHandle
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(writer, reader, rx));
        WorkerHandle { tx }
    }

    /// A handle whose requests all fail with [`WorkerError::Unavailable`].
    pub fn unavailable() -> WorkerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(reject_all(rx));
        WorkerHandle { tx }
    }
}

async fn run<W, R>(mut writer: W, mut reader: R, mut rx: mpsc::UnboundedReceiver<Pending>)
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut queue: VecDeque<Pending> = VecDeque::new();
    let mut in_flight: Option<InFlight> = None;
    let mut decoder = FrameDecoder::default();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(pending) => queue.push_back(pending),
                // Every handle dropped.
                None => return,
            },
            read = reader.read_buf(decoder.buffer_mut()) => match read {
                Ok(0) => {
                    warn!(queued = queue.len(), "Generation worker closed its output");
                    break;
                }
                Ok(n) => {
                    trace!(bytes = n, buffered = decoder.buffered(), "Worker output");
                    if !dispatch_frames(&mut decoder, &mut in_flight) {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Reading worker output failed");
                    break;
                }
            },
        }

        if in_flight.is_none() {
            if let Some(pending) = queue.pop_front() {
                let id = next_id;
                next_id += 1;
                debug!(id, req = ?pending.req, queued = queue.len(), "Sending generation request");
                let frame = pending.req.encode();
                let sent = match writer.write_all(&frame).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                in_flight = Some(InFlight { id, pending });
                if let Err(e) = sent {
                    error!(id, error = %e, "Writing worker request failed");
                    break;
                }
            }
        }
    }

    if let Some(stalled) = in_flight.take() {
        warn!(id = stalled.id, req = ?stalled.pending.req, "Failing in-flight generation request");
        let _ = stalled.pending.reply.send(Err(WorkerError::Unavailable));
    }
    for pending in queue.drain(..) {
        let _ = pending.reply.send(Err(WorkerError::Unavailable));
    }
    reject_all(rx).await;
}

/// Resolves the in-flight request with every complete frame. Returns false
/// when the output is corrupt and the channel must close.
fn dispatch_frames(decoder: &mut FrameDecoder, in_flight: &mut Option<InFlight>) -> bool {
    loop {
        let payload = match decoder.next_frame() {
            Ok(Some(payload)) => payload,
            Ok(None) => return true,
            Err(e) => {
                error!(error = %e, "Corrupt worker output");
                return false;
            }
        };
        match in_flight.take() {
            Some(done) => {
                debug!(id = done.id, req = ?done.pending.req, bytes = payload.len(), "Generation complete");
                let _ = done.pending.reply.send(Ok(payload));
            }
            None => warn!(bytes = payload.len(), "Discarding worker response with nothing in flight"),
        }
    }
}

async fn reject_all(mut rx: mpsc::UnboundedReceiver<Pending>) {
    while let Some(pending) = rx.recv().await {
        debug!(req = ?pending.req, "Rejecting generation request, worker unavailable");
        let _ = pending.reply.send(Err(WorkerError::Unavailable));
    }
}
