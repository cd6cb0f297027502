//! The capture worker lane.
//!
//! One long-lived thread drains the capture queue. Every wait on this lane is
//! bounded (queue poll, storage gate), so the lane beats its heartbeat at
//! least once per poll interval even while idle. No failure terminates the
//! loop; each one is local to the command being processed.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::gate::StorageGate;
use super::queue::{CaptureCommand, CaptureReceiver};
use super::recovery::MemoryRecovery;
use super::status::{Counter, PipelinePhase, SharedStatus};
use crate::config::PipelineLimits;
use crate::error::PipelineError;
use crate::liveness::Heartbeat;
use crate::memory::{MemoryPressure, MemoryProbe, ResourcePolicy};
use crate::sensor::FrameSource;
use crate::storage::PhotoName;

/// Longest pause between two commands, used when the queue is empty.
const MAX_IDLE_YIELD: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Sensor or storage not ready at dequeue time.
    NotReady,
    Paused,
    CriticalMemory,
    StorageBusy,
}

#[derive(Debug)]
pub enum CaptureOutcome {
    Stored { name: PhotoName, bytes: usize },
    Dropped(DropReason),
    Failed(PipelineError),
}

pub struct CaptureWorker {
    source: Box<dyn FrameSource>,
    queue: CaptureReceiver,
    status: Arc<SharedStatus>,
    gate: Arc<StorageGate>,
    probe: Arc<dyn MemoryProbe>,
    policy: ResourcePolicy,
    recovery: Arc<MemoryRecovery>,
    heartbeat: Arc<Heartbeat>,
    limits: PipelineLimits,
    consecutive_failures: u32,
    last_reinit: Option<Instant>,
}

pub(crate) struct WorkerParts {
    pub queue: CaptureReceiver,
    pub status: Arc<SharedStatus>,
    pub gate: Arc<StorageGate>,
    pub probe: Arc<dyn MemoryProbe>,
    pub recovery: Arc<MemoryRecovery>,
    pub heartbeat: Arc<Heartbeat>,
    pub limits: PipelineLimits,
}

impl CaptureWorker {
    pub(crate) fn new(source: Box<dyn FrameSource>, parts: WorkerParts) -> Self {
        Self {
            source,
            queue: parts.queue,
            status: parts.status,
            gate: parts.gate,
            probe: parts.probe,
            policy: ResourcePolicy::from_limits(&parts.limits),
            recovery: parts.recovery,
            heartbeat: parts.heartbeat,
            limits: parts.limits,
            consecutive_failures: 0,
            last_reinit: None,
        }
    }

    /// Bring the sensor up. Failure leaves it not ready; idle ticks retry.
    pub fn connect_sensor(&mut self) {
        self.last_reinit = Some(Instant::now());
        match self.source.connect() {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.status.set_sensor_ready(true);
                info!("sensor ready ({})", self.source.stats().source);
            }
            Err(err) => {
                self.status.set_sensor_ready(false);
                warn!("sensor init failed: {}", err);
            }
        }
    }

    /// Re-initialise the sensor when asked to, or periodically while it is
    /// not ready.
    fn maintain_sensor(&mut self) {
        let requested = self.status.take_sensor_reinit();
        let retry_due = (!self.status.sensor_ready() || !self.source.is_healthy())
            && self
                .last_reinit
                .map_or(true, |at| at.elapsed() >= self.limits.sensor_retry_interval);
        if requested || retry_due {
            self.connect_sensor();
        }
    }

    /// Wait for and process at most one command.
    pub fn run_once(&mut self) -> Option<CaptureOutcome> {
        self.heartbeat.beat();
        self.maintain_sensor();
        let command = self.queue.next_within(self.limits.worker_poll)?;
        let outcome = self.process(command);
        self.heartbeat.beat();
        Some(outcome)
    }

    pub fn run(mut self, shutdown: Arc<AtomicBool>) {
        self.connect_sensor();
        info!("capture worker started");
        while !shutdown.load(Ordering::SeqCst) {
            if self.run_once().is_some() {
                let pause = self.yield_interval();
                if !pause.is_zero() {
                    std::thread::sleep(pause);
                }
            }
        }
        let stats = self.source.stats();
        info!(
            "capture worker stopped ({}: {} frames, {} failures)",
            stats.source, stats.frames_captured, stats.failures
        );
    }

    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> Result<WorkerHandle> {
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("capture-worker".to_string())
            .spawn(move || self.run(shutdown_thread))?;
        Ok(WorkerHandle {
            shutdown,
            join: Some(join),
        })
    }

    /// Shorter pauses the fuller the queue gets.
    fn yield_interval(&self) -> Duration {
        let capacity = self.limits.queue_capacity.max(1) as u32;
        let free = capacity.saturating_sub(self.queue.len() as u32);
        MAX_IDLE_YIELD * free / capacity
    }

    pub fn process(&mut self, command: CaptureCommand) -> CaptureOutcome {
        let outcome = self.capture(command);
        self.status.end_capture();
        match &outcome {
            CaptureOutcome::Stored { name, bytes } => {
                self.status.bump(Counter::Stored);
                info!("stored {} ({} bytes, ticket {})", name, bytes, command.sequence);
            }
            CaptureOutcome::Dropped(reason) => {
                self.status.bump(Counter::Dropped);
                warn!("capture {} dropped: {:?}", command.sequence, reason);
            }
            CaptureOutcome::Failed(err) => {
                self.status.bump(Counter::Failed);
                warn!("capture {} failed: {}", command.sequence, err);
            }
        }

        if self.policy.memory_pressure(self.probe.free_bytes()) != MemoryPressure::Normal {
            self.status.bump(Counter::Recovery);
            self.recovery.recover(&self.gate);
        }
        outcome
    }

    fn capture(&mut self, command: CaptureCommand) -> CaptureOutcome {
        if !self.status.sensor_ready() || !self.status.storage_ready() {
            return CaptureOutcome::Dropped(DropReason::NotReady);
        }
        if self.policy.memory_pressure(self.probe.free_bytes()) == MemoryPressure::Critical {
            return CaptureOutcome::Dropped(DropReason::CriticalMemory);
        }
        if !self.status.begin_capture() {
            return match self.status.phase() {
                PipelinePhase::Paused => CaptureOutcome::Dropped(DropReason::Paused),
                _ => CaptureOutcome::Dropped(DropReason::NotReady),
            };
        }

        let frame = match self.source.acquire_frame() {
            Ok(frame) => {
                self.consecutive_failures = 0;
                frame
            }
            Err(err) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.limits.sensor_failure_limit {
                    warn!(
                        "sensor failed {} times in a row, marking it not ready",
                        self.consecutive_failures
                    );
                    self.status.set_sensor_ready(false);
                }
                return CaptureOutcome::Failed(err);
            }
        };
        debug!(
            "frame {}x{} ({} bytes) for ticket {}",
            frame.width,
            frame.height,
            frame.len(),
            command.sequence
        );

        let mut device = match self.gate.acquire(self.limits.worker_gate_timeout) {
            Ok(device) => device,
            Err(_) => {
                self.source.release_frame(frame);
                return CaptureOutcome::Dropped(DropReason::StorageBusy);
            }
        };
        // An admin operation may have paused us while we waited on the gate.
        if self.status.phase() == PipelinePhase::Paused {
            drop(device);
            self.source.release_frame(frame);
            return CaptureOutcome::Dropped(DropReason::Paused);
        }

        let name = PhotoName::new(self.status.allocate_sequence());
        let expected = frame.len();
        let outcome = match device.write_photo(name, frame.bytes()) {
            Ok(written) if written == expected => {
                self.status.record_photo(&device, name);
                CaptureOutcome::Stored {
                    name,
                    bytes: written,
                }
            }
            Ok(written) => {
                self.status.bump(Counter::PartialWrite);
                if self.limits.discard_partial_writes {
                    if let Err(err) = device.remove_photo(name) {
                        debug!("could not remove partial {}: {}", name, err);
                    }
                }
                CaptureOutcome::Failed(PipelineError::PartialWrite { written, expected })
            }
            Err(err) => {
                if matches!(err, PipelineError::StorageUnavailable(_)) {
                    self.status.set_storage_ready(false);
                }
                CaptureOutcome::Failed(err)
            }
        };
        drop(device);
        debug!(
            "ticket {} held its frame for {} ms",
            command.sequence,
            frame.held_for_ms()
        );
        self.source.release_frame(frame);
        outcome
    }
}

#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("capture worker thread panicked"))?;
        }
        Ok(())
    }
}
