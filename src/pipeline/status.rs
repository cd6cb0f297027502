//! The shared status block.
//!
//! Scalars (`phase`, readiness flags, counters) are single-word atomics that
//! anyone may read without blocking. The compound pair `photo_count` +
//! `last_filename` lives in the photo ledger: it is only ever mutated while
//! the storage gate is held (mutators take a `StorageGuard` as proof), and a
//! snapshot always reads both halves together.

use log::warn;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use super::gate::StorageGuard;
use crate::storage::{PhotoName, PhotoSummary};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Idle,
    Capturing,
    Paused,
    Degraded,
}

const PHASE_IDLE: u8 = 0;
const PHASE_CAPTURING: u8 = 1;
const PHASE_PAUSED: u8 = 2;
const PHASE_DEGRADED: u8 = 3;

impl PipelinePhase {
    fn to_u8(self) -> u8 {
        match self {
            PipelinePhase::Idle => PHASE_IDLE,
            PipelinePhase::Capturing => PHASE_CAPTURING,
            PipelinePhase::Paused => PHASE_PAUSED,
            PipelinePhase::Degraded => PHASE_DEGRADED,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            PHASE_CAPTURING => PipelinePhase::Capturing,
            PHASE_PAUSED => PipelinePhase::Paused,
            PHASE_DEGRADED => PipelinePhase::Degraded,
            _ => PipelinePhase::Idle,
        }
    }
}

/// Point-in-time copy of the shared status block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub photo_count: u64,
    /// Device path of the newest stored photo. `Some` iff `photo_count > 0`.
    pub last_filename: Option<String>,
    pub phase: PipelinePhase,
    pub storage_ready: bool,
    pub sensor_ready: bool,
    pub next_sequence: u64,
    pub counters: CaptureCounters,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CaptureCounters {
    pub admitted: u64,
    pub rejected: u64,
    pub stored: u64,
    pub dropped: u64,
    pub failed: u64,
    pub partial_writes: u64,
    pub recoveries: u64,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Counter {
    Admitted,
    Rejected,
    Stored,
    Dropped,
    Failed,
    PartialWrite,
    Recovery,
}

#[derive(Default)]
struct Counters {
    admitted: AtomicU64,
    rejected: AtomicU64,
    stored: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    partial_writes: AtomicU64,
    recoveries: AtomicU64,
}

impl Counters {
    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Admitted => &self.admitted,
            Counter::Rejected => &self.rejected,
            Counter::Stored => &self.stored,
            Counter::Dropped => &self.dropped,
            Counter::Failed => &self.failed,
            Counter::PartialWrite => &self.partial_writes,
            Counter::Recovery => &self.recoveries,
        }
    }

    fn snapshot(&self) -> CaptureCounters {
        CaptureCounters {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            partial_writes: self.partial_writes.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct PhotoLedger {
    count: u64,
    last: Option<PhotoName>,
}

pub struct SharedStatus {
    phase: AtomicU8,
    storage_ready: AtomicBool,
    sensor_ready: AtomicBool,
    sensor_reinit: AtomicBool,
    /// Number of administrative operations currently holding the pause.
    /// Phase transitions out of `Paused` happen under this lock.
    pause_holders: Mutex<usize>,
    next_sequence: AtomicU64,
    ledger: RwLock<PhotoLedger>,
    counters: Counters,
}

impl Default for SharedStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStatus {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(PHASE_IDLE),
            storage_ready: AtomicBool::new(false),
            sensor_ready: AtomicBool::new(false),
            sensor_reinit: AtomicBool::new(false),
            pause_holders: Mutex::new(0),
            next_sequence: AtomicU64::new(1),
            ledger: RwLock::new(PhotoLedger::default()),
            counters: Counters::default(),
        }
    }

    pub fn snapshot(&self) -> PipelineStatus {
        let (photo_count, last_filename) = {
            let ledger = self.ledger.read();
            (ledger.count, ledger.last.map(|name| name.device_path()))
        };
        PipelineStatus {
            photo_count,
            last_filename,
            phase: self.phase(),
            storage_ready: self.storage_ready(),
            sensor_ready: self.sensor_ready(),
            next_sequence: self.next_sequence.load(Ordering::SeqCst),
            counters: self.counters.snapshot(),
        }
    }

    pub fn phase(&self) -> PipelinePhase {
        PipelinePhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn storage_ready(&self) -> bool {
        self.storage_ready.load(Ordering::SeqCst)
    }

    pub fn sensor_ready(&self) -> bool {
        self.sensor_ready.load(Ordering::SeqCst)
    }

    pub fn latest_photo(&self) -> Option<PhotoName> {
        self.ledger.read().last
    }

    pub(crate) fn bump(&self, counter: Counter) {
        self.counters.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_storage_ready(&self, ready: bool) {
        self.storage_ready.store(ready, Ordering::SeqCst);
        self.settle();
    }

    pub(crate) fn set_sensor_ready(&self, ready: bool) {
        self.sensor_ready.store(ready, Ordering::SeqCst);
        self.settle();
    }

    pub(crate) fn request_sensor_reinit(&self) {
        self.sensor_reinit.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_sensor_reinit(&self) -> bool {
        self.sensor_reinit.swap(false, Ordering::SeqCst)
    }

    fn resting_phase(&self) -> u8 {
        if self.storage_ready() && self.sensor_ready() {
            PHASE_IDLE
        } else {
            PHASE_DEGRADED
        }
    }

    /// Re-derive Idle/Degraded after a readiness change. Leaves `Paused`
    /// alone, and leaves `Capturing` alone while everything is ready.
    fn settle(&self) {
        let holders = self.pause_holders.lock();
        if *holders > 0 {
            return;
        }
        let target = self.resting_phase();
        let _ = self
            .phase
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current == target || (current == PHASE_CAPTURING && target == PHASE_IDLE) {
                    None
                } else {
                    Some(target)
                }
            });
    }

    pub(crate) fn pause(&self) {
        let mut holders = self.pause_holders.lock();
        *holders += 1;
        self.phase
            .store(PipelinePhase::Paused.to_u8(), Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        let mut holders = self.pause_holders.lock();
        *holders = holders.saturating_sub(1);
        if *holders == 0 {
            self.phase.store(self.resting_phase(), Ordering::SeqCst);
        }
    }

    /// Idle -> Capturing. Fails when paused, degraded or already capturing.
    pub(crate) fn begin_capture(&self) -> bool {
        self.phase
            .compare_exchange(
                PHASE_IDLE,
                PHASE_CAPTURING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Capturing -> Idle, unless someone moved the phase meanwhile.
    pub(crate) fn end_capture(&self) {
        let _ = self.phase.compare_exchange(
            PHASE_CAPTURING,
            PHASE_IDLE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Next file sequence number. Strictly increasing, never handed out twice.
    pub(crate) fn allocate_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn record_photo(&self, _gate: &StorageGuard<'_>, name: PhotoName) {
        let mut ledger = self.ledger.write();
        ledger.count += 1;
        ledger.last = Some(name);
    }

    /// Account for `deleted` removed photos, given how many remain on the card.
    pub(crate) fn forget_photos(&self, _gate: &StorageGuard<'_>, deleted: u64, remaining: u64) {
        let mut ledger = self.ledger.write();
        ledger.count = ledger.count.saturating_sub(deleted).min(remaining);
        if ledger.count == 0 {
            ledger.last = None;
        }
    }

    pub(crate) fn reset_photos(&self, _gate: &StorageGuard<'_>) {
        let mut ledger = self.ledger.write();
        ledger.count = 0;
        ledger.last = None;
    }

    /// Take over photos already on the card. The sequence allocator only
    /// ever moves forward.
    pub(crate) fn adopt(&self, _gate: &StorageGuard<'_>, summary: PhotoSummary) {
        let mut ledger = self.ledger.write();
        ledger.count = summary.count;
        ledger.last = summary.newest.filter(|_| summary.count > 0);
        if let Some(newest) = summary.newest {
            match newest.sequence().checked_add(1) {
                Some(next) => {
                    self.next_sequence.fetch_max(next, Ordering::SeqCst);
                }
                None => warn!("{} leaves no sequence numbers to allocate after it", newest),
            }
        }
    }
}
