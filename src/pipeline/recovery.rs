use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::gate::StorageGate;
use crate::frame::BufferPool;
use crate::memory::{MemoryPressure, MemoryProbe, ResourcePolicy};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Memory was below the admission threshold when called.
    pub ran: bool,
    pub released_bytes: usize,
    /// A storage flush ran because memory stayed critical.
    pub flushed: bool,
    pub free_after: u64,
}

/// Frees transient memory when the free-memory reading drops.
///
/// Safe to call repeatedly; with enough free memory it only takes a reading.
pub struct MemoryRecovery {
    pool: Arc<BufferPool>,
    probe: Arc<dyn MemoryProbe>,
    policy: ResourcePolicy,
    pause: Duration,
    runs: AtomicU64,
}

impl MemoryRecovery {
    pub fn new(
        pool: Arc<BufferPool>,
        probe: Arc<dyn MemoryProbe>,
        policy: ResourcePolicy,
        pause: Duration,
    ) -> Self {
        Self {
            pool,
            probe,
            policy,
            pause,
            runs: AtomicU64::new(0),
        }
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn recover(&self, gate: &StorageGate) -> RecoveryOutcome {
        let free = self.probe.free_bytes();
        if self.policy.memory_pressure(free) == MemoryPressure::Normal {
            return RecoveryOutcome {
                free_after: free,
                ..RecoveryOutcome::default()
            };
        }
        self.runs.fetch_add(1, Ordering::Relaxed);

        let released_bytes = self.pool.shrink();
        std::thread::yield_now();
        if !self.pause.is_zero() {
            std::thread::sleep(self.pause);
        }

        let mut free_after = self.probe.free_bytes();
        let mut flushed = false;
        if self.policy.memory_pressure(free_after) == MemoryPressure::Critical {
            // Only flush if the gate is free right now; never queue behind a writer.
            match gate.try_acquire() {
                Some(mut device) => match device.sync() {
                    Ok(()) => flushed = true,
                    Err(err) => debug!("storage flush during recovery failed: {}", err),
                },
                None => debug!("storage busy, skipping flush during recovery"),
            }
            free_after = self.probe.free_bytes();
        }

        warn!(
            "memory recovery: free {} -> {} bytes, released {} buffer bytes{}",
            free,
            free_after,
            released_bytes,
            if flushed { ", storage flushed" } else { "" }
        );
        RecoveryOutcome {
            ran: true,
            released_bytes,
            flushed,
            free_after,
        }
    }
}
