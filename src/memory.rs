//! Free-memory readings and the resource-pressure policy.
//!
//! `ResourcePolicy` is the one place the memory and queue thresholds live; the
//! admission controller and the capture worker both consult it.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::PipelineLimits;

/// Source of free-memory readings.
pub trait MemoryProbe: Send + Sync {
    fn free_bytes(&self) -> u64;
}

/// Reads free memory from the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    #[cfg(target_os = "linux")]
    fn free_bytes(&self) -> u64 {
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        // SAFETY: info is a valid out-pointer for the duration of the call.
        if unsafe { libc::sysinfo(&mut info) } != 0 {
            return u64::MAX;
        }
        let unit = u64::from(info.mem_unit.max(1));
        (info.freeram as u64 + info.bufferram as u64).saturating_mul(unit)
    }

    #[cfg(not(target_os = "linux"))]
    fn free_bytes(&self) -> u64 {
        u64::MAX
    }
}

/// Probe whose reading is set by hand. Used by the maintenance CLI, where no
/// capture runs, and by tests.
#[derive(Debug)]
pub struct ManualMemoryProbe {
    free: AtomicU64,
}

impl ManualMemoryProbe {
    pub fn new(free: u64) -> Self {
        Self {
            free: AtomicU64::new(free),
        }
    }

    pub fn set(&self, free: u64) {
        self.free.store(free, Ordering::SeqCst);
    }
}

impl MemoryProbe for ManualMemoryProbe {
    fn free_bytes(&self) -> u64 {
        self.free.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Normal,
    /// Below the admission threshold.
    Low,
    /// Below the critical threshold.
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourcePolicy {
    pub min_free_bytes_for_capture: u64,
    pub critical_free_bytes: u64,
    pub min_queue_spaces: usize,
}

impl ResourcePolicy {
    pub fn from_limits(limits: &PipelineLimits) -> Self {
        Self {
            min_free_bytes_for_capture: limits.min_free_bytes_for_capture,
            critical_free_bytes: limits.critical_free_bytes,
            min_queue_spaces: limits.min_queue_spaces,
        }
    }

    pub fn memory_pressure(&self, free_bytes: u64) -> MemoryPressure {
        if free_bytes < self.critical_free_bytes {
            MemoryPressure::Critical
        } else if free_bytes < self.min_free_bytes_for_capture {
            MemoryPressure::Low
        } else {
            MemoryPressure::Normal
        }
    }

    /// Admission needs strictly more free slots than the reserve.
    pub fn queue_has_room(&self, free_slots: usize) -> bool {
        free_slots > self.min_queue_spaces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ResourcePolicy {
        ResourcePolicy {
            min_free_bytes_for_capture: 1000,
            critical_free_bytes: 400,
            min_queue_spaces: 2,
        }
    }

    #[test]
    fn classifies_memory_pressure() {
        let policy = policy();
        assert_eq!(policy.memory_pressure(5000), MemoryPressure::Normal);
        assert_eq!(policy.memory_pressure(1000), MemoryPressure::Normal);
        assert_eq!(policy.memory_pressure(999), MemoryPressure::Low);
        assert_eq!(policy.memory_pressure(400), MemoryPressure::Low);
        assert_eq!(policy.memory_pressure(399), MemoryPressure::Critical);
    }

    #[test]
    fn queue_reserve_is_exclusive() {
        let policy = policy();
        assert!(policy.queue_has_room(3));
        assert!(!policy.queue_has_room(2));
        assert!(!policy.queue_has_room(0));
    }

    #[test]
    fn manual_probe_reports_what_was_set() {
        let probe = ManualMemoryProbe::new(10);
        assert_eq!(probe.free_bytes(), 10);
        probe.set(20);
        assert_eq!(probe.free_bytes(), 20);
    }

    #[test]
    fn system_probe_reports_something() {
        assert!(SystemMemoryProbe.free_bytes() > 0);
    }
}
