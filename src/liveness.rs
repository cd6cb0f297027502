//! Lane liveness.
//!
//! Each execution lane owns a `Heartbeat` and beats it at least once per loop
//! iteration (and between batches of long administrative work). The status
//! report flags any lane whose last beat is older than its stall threshold.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Heartbeat {
    name: &'static str,
    epoch: Instant,
    /// Milliseconds since `epoch` at the last beat.
    last_beat_ms: AtomicU64,
    beats: AtomicU64,
}

impl Heartbeat {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            epoch: Instant::now(),
            last_beat_ms: AtomicU64::new(0),
            beats: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn beat(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_beat_ms.store(now, Ordering::Release);
        self.beats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    /// Time since the last beat (or since creation, before the first beat).
    pub fn silent_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_beat_ms.load(Ordering::Acquire);
        Duration::from_millis(now.saturating_sub(last))
    }

    pub fn is_stalled(&self, threshold: Duration) -> bool {
        self.silent_for() > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_resets_silence() {
        let heartbeat = Heartbeat::new("worker");
        std::thread::sleep(Duration::from_millis(30));
        assert!(heartbeat.is_stalled(Duration::from_millis(10)));
        heartbeat.beat();
        assert!(!heartbeat.is_stalled(Duration::from_millis(500)));
        assert_eq!(heartbeat.beats(), 1);
        assert_eq!(heartbeat.name(), "worker");
    }
}
