use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::gate::StorageGate;
use super::queue::{CaptureCommand, CaptureOrigin, CaptureSender};
use super::recovery::MemoryRecovery;
use super::status::{Counter, PipelinePhase, SharedStatus};
use crate::error::RejectReason;
use crate::memory::{MemoryPressure, MemoryProbe, ResourcePolicy};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The command is in the queue. `ticket` is its admission sequence number.
    Accepted { ticket: u64 },
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted { .. })
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Admission::Accepted { .. } => None,
            Admission::Rejected(reason) => Some(*reason),
        }
    }
}

/// Decides whether a capture request may enter the queue.
///
/// Runs on the interactive lane, so it never waits longer than the bounded
/// enqueue timeout.
pub struct AdmissionController {
    queue: CaptureSender,
    status: Arc<SharedStatus>,
    probe: Arc<dyn MemoryProbe>,
    policy: ResourcePolicy,
    recovery: Arc<MemoryRecovery>,
    gate: Arc<StorageGate>,
    enqueue_timeout: Duration,
    min_interval: Duration,
    next_ticket: AtomicU64,
    last_interactive: Mutex<Option<Instant>>,
}

pub(crate) struct AdmissionParts {
    pub queue: CaptureSender,
    pub status: Arc<SharedStatus>,
    pub probe: Arc<dyn MemoryProbe>,
    pub policy: ResourcePolicy,
    pub recovery: Arc<MemoryRecovery>,
    pub gate: Arc<StorageGate>,
    pub enqueue_timeout: Duration,
    pub min_interval: Duration,
}

impl AdmissionController {
    pub(crate) fn new(parts: AdmissionParts) -> Self {
        Self {
            queue: parts.queue,
            status: parts.status,
            probe: parts.probe,
            policy: parts.policy,
            recovery: parts.recovery,
            gate: parts.gate,
            enqueue_timeout: parts.enqueue_timeout,
            min_interval: parts.min_interval,
            next_ticket: AtomicU64::new(1),
            last_interactive: Mutex::new(None),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn try_admit(&self, origin: CaptureOrigin) -> Admission {
        if let Some(reason) = self.phase_rejection() {
            return self.reject(origin, reason);
        }
        let admission = match origin {
            CaptureOrigin::Interactive => {
                // Held across evaluation so two racing requests cannot both pass.
                let mut last = self.last_interactive.lock();
                if let Some(at) = *last {
                    if at.elapsed() < self.min_interval {
                        return self.reject(origin, RejectReason::RateLimited);
                    }
                }
                let admission = self.evaluate(origin);
                if admission.is_accepted() {
                    *last = Some(Instant::now());
                }
                admission
            }
            CaptureOrigin::Timer => self.evaluate(origin),
        };
        if admission.is_accepted() {
            self.status.bump(Counter::Admitted);
        }
        admission
    }

    fn phase_rejection(&self) -> Option<RejectReason> {
        match self.status.phase() {
            PipelinePhase::Paused => Some(RejectReason::Busy),
            PipelinePhase::Degraded => Some(RejectReason::Degraded),
            PipelinePhase::Idle | PipelinePhase::Capturing => None,
        }
    }

    fn evaluate(&self, origin: CaptureOrigin) -> Admission {
        match self.policy.memory_pressure(self.probe.free_bytes()) {
            MemoryPressure::Normal => {}
            MemoryPressure::Low => return self.reject(origin, RejectReason::LowMemory),
            MemoryPressure::Critical => {
                self.status.bump(Counter::Recovery);
                self.recovery.recover(&self.gate);
                return self.reject(origin, RejectReason::LowMemory);
            }
        }

        if !self.policy.queue_has_room(self.queue.free_slots()) {
            return self.reject(origin, RejectReason::QueueSaturated);
        }

        let command = CaptureCommand {
            origin,
            timestamp_ms: unix_millis(),
            sequence: self.next_ticket.fetch_add(1, Ordering::SeqCst),
        };
        match self.queue.enqueue_within(command, self.enqueue_timeout) {
            Ok(()) => Admission::Accepted {
                ticket: command.sequence,
            },
            Err(_) => self.reject(origin, RejectReason::EnqueueTimeout),
        }
    }

    fn reject(&self, origin: CaptureOrigin, reason: RejectReason) -> Admission {
        self.status.bump(Counter::Rejected);
        debug!("{:?} capture rejected: {}", origin, reason.describe());
        Admission::Rejected(reason)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
