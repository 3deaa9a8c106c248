//! Tick timing.

use std::time::{Duration, Instant};

/// How often averages are reported.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Averages over one report window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub ticks: u32,
    pub avg: Duration,
    pub max: Duration,
}

/// Accumulates tick durations and yields a report once per window.
#[derive(Debug)]
pub struct TickStats {
    window_start: Instant,
    interval: Duration,
    total: Duration,
    max: Duration,
    ticks: u32,
}

impl Default for TickStats {
    fn default() -> Self {
        Self::new(REPORT_INTERVAL)
    }
}

impl TickStats {
    pub fn new(interval: Duration) -> Self {
        Self {
            window_start: Instant::now(),
            interval,
            total: Duration::ZERO,
            max: Duration::ZERO,
            ticks: 0,
        }
    }

    pub fn record(&mut self, elapsed: Duration) -> Option<TickReport> {
        self.record_at(elapsed, Instant::now())
    }

    fn record_at(&mut self, elapsed: Duration, now: Instant) -> Option<TickReport> {
        self.total += elapsed;
        self.max = self.max.max(elapsed);
        self.ticks += 1;
        if now.duration_since(self.window_start) < self.interval {
            return None;
        }
        let report = TickReport {
            ticks: self.ticks,
            avg: self.total / self.ticks,
            max: self.max,
        };
        *self = Self {
            window_start: now,
            ..Self::new(self.interval)
        };
        Some(report)
    }
}
