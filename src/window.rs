//! Sliding latency window
//!
//! Fixed-capacity ring of round-trip samples. Only the most recent
//! `N` samples are kept; the published latency is their maximum.

use std::time::Duration;

/// Number of ping samples a server keeps
pub const PING_WINDOW: usize = 6;

/// Ring of the last `N` latency samples
#[derive(Debug, Clone)]
pub struct LatencyWindow<const N: usize = PING_WINDOW> {
    samples: [Duration; N],
    next: usize,
    count: u64,
}

impl<const N: usize> Default for LatencyWindow<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> LatencyWindow<N> {
    pub fn new() -> Self {
        Self {
            samples: [Duration::ZERO; N],
            next: 0,
            count: 0,
        }
    }

    /// Record a sample, evicting the oldest one once the window is full
    pub fn push(&mut self, sample: Duration) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % N;
        self.count += 1;
    }

    /// Largest sample currently in the window (zero when empty)
    pub fn max(&self) -> Duration {
        self.filled().iter().copied().max().unwrap_or(Duration::ZERO)
    }

    /// Number of samples recorded over the window's lifetime
    pub fn total(&self) -> u64 {
        self.count
    }

    /// Number of samples currently held
    pub fn len(&self) -> usize {
        (self.count as usize).min(N)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn filled(&self) -> &[Duration] {
        &self.samples[..self.len()]
    }
}
