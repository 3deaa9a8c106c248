//! Fixed-step scheduler.
//!
//! Converts wall-clock time into a deterministic count of simulation ticks.
//! A background task wakes every [`WAKE_INTERVAL`], feeds the elapsed time
//! into a [`StepAccumulator`] and emits one tick per whole step drained.
//! Ticks are fanned out to subscribers over unbounded channels, so emitting
//! never waits on a subscriber, and subscribers that went away are dropped
//! from the list.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, info};

/// Elapsed time per wake-up is clamped to this many steps.
pub const MAX_CATCH_UP_TICKS: u64 = 10;

/// Delay between wake-ups, independent of the tick rate.
pub const WAKE_INTERVAL: Duration = Duration::from_millis(5);

/// Receives tick numbers, starting at 1.
pub type TickReceiver = mpsc::UnboundedReceiver<u64>;

/// Drift-free step counter.
///
/// Remainders carry over between calls, so the total number of steps
/// returned for a sequence of unclamped frames is `floor(sum / step)` no
/// matter how the time was split.
#[derive(Debug, Clone)]
pub struct StepAccumulator {
    step_ns: u64,
    max_frame_ns: u64,
    acc_ns: u64,
}

impl StepAccumulator {
    pub fn new(tps: u32) -> Self {
        let step_ns = (1_000_000_000 / u64::from(tps.max(1))).max(1);
        Self {
            step_ns,
            max_frame_ns: step_ns * MAX_CATCH_UP_TICKS,
            acc_ns: 0,
        }
    }

    pub fn step(&self) -> Duration {
        Duration::from_nanos(self.step_ns)
    }

    /// Unconsumed time carried into the next frame.
    pub fn pending(&self) -> Duration {
        Duration::from_nanos(self.acc_ns)
    }

    /// Adds one frame of elapsed time and returns the steps it completes.
    pub fn advance(&mut self, elapsed: Duration) -> u64 {
        let frame = u64::try_from(elapsed.as_nanos())
            .unwrap_or(u64::MAX)
            .min(self.max_frame_ns);
        self.acc_ns += frame;
        let steps = self.acc_ns / self.step_ns;
        self.acc_ns -= steps * self.step_ns;
        steps
    }
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<u64>>>>;

/// Background tick source.
pub struct FixedStepScheduler {
    tps: u32,
    subscribers: Subscribers,
    emitted: Arc<AtomicU64>,
    running: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl FixedStepScheduler {
    pub fn new(tps: u32) -> Self {
        Self {
            tps: tps.max(1),
            subscribers: Arc::default(),
            emitted: Arc::default(),
            running: None,
        }
    }

    pub fn tps(&self) -> u32 {
        self.tps
    }

    /// Registers a new tick consumer. Works before or after `start`.
    pub fn subscribe(&self) -> TickReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Ticks emitted since creation.
    pub fn ticks(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Starts ticking. Must be called inside a tokio runtime. No-op when
    /// already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run(
            StepAccumulator::new(self.tps),
            self.subscribers.clone(),
            self.emitted.clone(),
            stop_rx,
        ));
        self.running = Some((stop_tx, handle));
        info!(tps = self.tps, "Scheduler started");
    }

    /// Stops ticking. Time that elapsed while stopped is not replayed.
    pub fn stop(&mut self) {
        if let Some((stop_tx, _handle)) = self.running.take() {
            let _ = stop_tx.send(());
            info!(ticks = self.ticks(), "Scheduler stopped");
        }
    }
}

impl Drop for FixedStepScheduler {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.running.take() {
            handle.abort();
        }
    }
}

async fn run(
    mut acc: StepAccumulator,
    subscribers: Subscribers,
    emitted: Arc<AtomicU64>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = time::sleep(WAKE_INTERVAL) => {}
        }
        let now = Instant::now();
        let steps = acc.advance(now - last);
        last = now;

        for _ in 0..steps {
            let tick = emitted.fetch_add(1, Ordering::Relaxed) + 1;
            let mut subs = lock(&subscribers);
            let before = subs.len();
            subs.retain(|tx| tx.send(tick).is_ok());
            if subs.len() != before {
                debug!(dropped = before - subs.len(), "Pruned closed tick subscribers");
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
