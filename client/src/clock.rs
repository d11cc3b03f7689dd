//! Time sources for the session: an estimate of the server's wrapping
//! millisecond clock, the round-trip time, and a local monotonic clock.

use std::time::{Duration, Instant};

pub trait Clock: Send {
    /// Server time in wrapping milliseconds, used for ownership stamps.
    fn server_time_ms(&self) -> u32;

    fn rtt(&self) -> Duration;

    /// Monotonic local milliseconds, used for claim deadlines.
    fn local_ms(&self) -> u64;

    fn observe_welcome(&mut self, _server_time_ms: u32) {}

    fn observe_pong(&mut self, _client_time_ms: u64, _server_time_ms: u32) {}
}

/// Smoothing factor for RTT samples.
pub const RTT_ALPHA: f64 = 0.125;

/// Assumed until the first pong arrives.
pub const INITIAL_RTT: Duration = Duration::from_millis(100);

/// Exponentially weighted moving average of round-trip samples.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    alpha: f64,
    smoothed_ms: Option<f64>,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(RTT_ALPHA)
    }
}

impl RttEstimator {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            smoothed_ms: None,
        }
    }

    pub fn sample(&mut self, rtt_ms: f64) {
        self.smoothed_ms = Some(match self.smoothed_ms {
            None => rtt_ms,
            Some(current) => current + self.alpha * (rtt_ms - current),
        });
    }

    pub fn smoothed_ms(&self) -> Option<f64> {
        self.smoothed_ms
    }

    pub fn rtt(&self) -> Duration {
        self.smoothed_ms
            .map(|ms| Duration::from_secs_f64(ms.max(0.0) / 1000.0))
            .unwrap_or(INITIAL_RTT)
    }
}

/// Tracks the offset between the local monotonic clock and server time.
#[derive(Debug)]
pub struct SyncedClock {
    started: Instant,
    offset: u32,
    rtt: RttEstimator,
}

impl Default for SyncedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncedClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            offset: 0,
            rtt: RttEstimator::default(),
        }
    }

    pub fn with_server_time(server_time_ms: u32) -> Self {
        let mut clock = Self::new();
        clock.observe_welcome(server_time_ms);
        clock
    }

    fn set_server_now(&mut self, server_now_ms: u32) {
        self.offset = server_now_ms.wrapping_sub(self.local_ms() as u32);
    }
}

impl Clock for SyncedClock {
    fn server_time_ms(&self) -> u32 {
        (self.local_ms() as u32).wrapping_add(self.offset)
    }

    fn rtt(&self) -> Duration {
        self.rtt.rtt()
    }

    fn local_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn observe_welcome(&mut self, server_time_ms: u32) {
        self.set_server_now(server_time_ms);
    }

    fn observe_pong(&mut self, client_time_ms: u64, server_time_ms: u32) {
        let now = self.local_ms();
        if client_time_ms > now {
            return;
        }
        let sample = (now - client_time_ms) as f64;
        self.rtt.sample(sample);
        let half_rtt = (self.rtt.rtt().as_millis() / 2) as u32;
        self.set_server_now(server_time_ms.wrapping_add(half_rtt));
    }
}

/// Hand-driven clock for deterministic tests and tools.
#[derive(Debug, Clone)]
pub struct ManualClock {
    pub server_ms: u32,
    pub local_ms: u64,
    pub rtt: Duration,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            server_ms: 0,
            local_ms: 0,
            rtt: INITIAL_RTT,
        }
    }
}

impl ManualClock {
    pub fn new(server_ms: u32) -> Self {
        Self {
            server_ms,
            ..Self::default()
        }
    }

    pub fn advance(&mut self, by: Duration) {
        let ms = by.as_millis() as u64;
        self.local_ms += ms;
        self.server_ms = self.server_ms.wrapping_add(ms as u32);
    }
}

impl Clock for ManualClock {
    fn server_time_ms(&self) -> u32 {
        self.server_ms
    }

    fn rtt(&self) -> Duration {
        self.rtt
    }

    fn local_ms(&self) -> u64 {
        self.local_ms
    }
}
