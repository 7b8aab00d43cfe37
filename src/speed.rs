//! Speed measurement and governance.
//!
//! Three small pieces: a sampler that turns a shared byte counter into a
//! realtime bytes-per-second figure, a pacing limiter that workers use to
//! honor the per-connection speed cap, and the minimum-throughput watchdog
//! driven once per second by the coordinator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::MinSpeed;

/// Realtime speed over the trailing sample window.
///
/// Workers add received byte counts to the shared counter; the coordinator
/// calls [`sample`](SpeedSampler::sample) about once per second.
#[derive(Debug)]
pub struct SpeedSampler {
    counter: Arc<AtomicU64>,
    last_total: u64,
    last_at: Instant,
    rate: u64,
}

impl SpeedSampler {
    pub fn new(counter: Arc<AtomicU64>) -> Self {
        Self {
            counter,
            last_total: 0,
            last_at: Instant::now(),
            rate: 0,
        }
    }

    /// Recompute the rate from bytes received since the previous sample.
    pub fn sample(&mut self) -> u64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_at).as_secs_f64();
        if elapsed <= 0.0 {
            return self.rate;
        }
        let total = self.counter.load(Ordering::Relaxed);
        let delta = total.saturating_sub(self.last_total);
        self.rate = (delta as f64 / elapsed) as u64;
        self.last_total = total;
        self.last_at = now;
        self.rate
    }

    /// Most recently sampled rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }
}

/// Paces one connection to its share of the configured speed cap.
///
/// The cap is shared through an atomic so the coordinator can rebalance it
/// as workers come and go; zero means unlimited.
#[derive(Debug)]
pub struct SpeedLimiter {
    cap: Arc<AtomicU64>,
    window_start: Instant,
    window_bytes: u64,
}

impl SpeedLimiter {
    pub fn new(cap: Arc<AtomicU64>) -> Self {
        Self {
            cap,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    /// Account for `bytes` just received and sleep long enough to keep the
    /// window average at or below the cap.
    pub fn throttle(&mut self, bytes: u64) {
        let cap = self.cap.load(Ordering::Relaxed);
        if cap == 0 {
            return;
        }

        self.window_bytes += bytes;
        let budget = Duration::from_secs_f64(self.window_bytes as f64 / cap as f64);
        let elapsed = self.window_start.elapsed();
        if budget > elapsed {
            thread::sleep(budget - elapsed);
        }

        if self.window_start.elapsed() >= Duration::from_secs(1) {
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }
}

/// Fails the session when aggregate throughput stays below a threshold for
/// a configured number of consecutive seconds.
#[derive(Debug)]
pub struct MinSpeedWatchdog {
    min: MinSpeed,
    below_for_secs: u64,
}

impl MinSpeedWatchdog {
    pub fn new(min: MinSpeed) -> Self {
        Self {
            min,
            below_for_secs: 0,
        }
    }

    /// Feed one once-per-second throughput observation. Returns `true` when
    /// the threshold has been violated for the configured duration.
    pub fn observe(&mut self, rate: u64) -> bool {
        if rate < self.min.bytes_per_sec {
            self.below_for_secs += 1;
            self.below_for_secs >= self.min.duration_secs
        } else {
            self.below_for_secs = 0;
            false
        }
    }

    /// Forget accumulated under-speed seconds (used across pauses).
    pub fn reset(&mut self) {
        self.below_for_secs = 0;
    }
}
