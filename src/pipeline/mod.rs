//! The concurrent photo-capture pipeline.
//!
//! Two lanes share the pipeline:
//! - the interactive lane (front end and capture timer) runs admission and
//!   the administrative operations;
//! - the worker lane runs `CaptureWorker`, draining the capture queue.
//!
//! The storage device is reachable only through `StorageGate`. Front ends
//! hold a `Pipeline` and nothing else.

pub mod admin;
pub mod admission;
pub mod gate;
pub mod queue;
pub mod recovery;
pub mod status;
pub mod worker;

use anyhow::{anyhow, Result};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PipelineLimits;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::BufferPool;
use crate::liveness::Heartbeat;
use crate::memory::{MemoryPressure, MemoryProbe, ResourcePolicy};
use crate::sensor::FrameSource;
use crate::storage::{newest_page, PhotoName, PhotoPage, StorageDevice};

pub use admin::{BulkDeleteReport, ReformatReport, RemountReport, StorageAdmin};
pub use admission::{Admission, AdmissionController};
pub use gate::{StorageGate, StorageGuard};
pub use queue::{CaptureCommand, CaptureOrigin};
pub use recovery::{MemoryRecovery, RecoveryOutcome};
pub use status::{CaptureCounters, PipelinePhase, PipelineStatus, SharedStatus};
pub use worker::{CaptureOutcome, CaptureWorker, DropReason, WorkerHandle};

use admission::AdmissionParts;
use queue::{capture_queue, CaptureReceiver};
use worker::WorkerParts;

/// Largest gallery page served at once.
pub const MAX_PAGE_SIZE: usize = 100;

/// Slack added to a lane's longest bounded wait before it counts as stalled.
const STALL_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Serialize)]
pub struct LaneReport {
    pub name: &'static str,
    pub silent_ms: u64,
    pub stalled: bool,
}

/// Everything the status endpoint and the periodic report show.
#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub status: PipelineStatus,
    pub uptime_secs: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub free_memory_bytes: u64,
    pub memory_pressure: MemoryPressure,
    pub retained_buffer_bytes: usize,
    pub lanes: Vec<LaneReport>,
}

impl StatusReport {
    /// One-line rendering for the log.
    pub fn summary_line(&self) -> String {
        let lanes: Vec<String> = self
            .lanes
            .iter()
            .map(|lane| {
                format!(
                    "{}={}ms{}",
                    lane.name,
                    lane.silent_ms,
                    if lane.stalled { "(stalled)" } else { "" }
                )
            })
            .collect();
        format!(
            "uptime={}s free_mem={} phase={:?} photos={} last={} queue={}/{} stored={} dropped={} failed={} lanes[{}]",
            self.uptime_secs,
            self.free_memory_bytes,
            self.status.phase,
            self.status.photo_count,
            self.status.last_filename.as_deref().unwrap_or("-"),
            self.queue_depth,
            self.queue_capacity,
            self.status.counters.stored,
            self.status.counters.dropped,
            self.status.counters.failed,
            lanes.join(" ")
        )
    }
}

pub struct Pipeline {
    limits: PipelineLimits,
    status: Arc<SharedStatus>,
    gate: Arc<StorageGate>,
    admission: AdmissionController,
    admin: StorageAdmin,
    pool: Arc<BufferPool>,
    probe: Arc<dyn MemoryProbe>,
    recovery: Arc<MemoryRecovery>,
    receiver: Mutex<Option<CaptureReceiver>>,
    worker_heartbeat: Arc<Heartbeat>,
    interactive_heartbeat: Arc<Heartbeat>,
    started: Instant,
}

impl Pipeline {
    /// Assemble the pipeline and mount the device. A failed mount leaves the
    /// pipeline `Degraded` rather than failing; `request_remount` recovers.
    pub fn open(
        limits: PipelineLimits,
        device: Box<dyn StorageDevice>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self> {
        limits.validate()?;
        let policy = ResourcePolicy::from_limits(&limits);
        let status = Arc::new(SharedStatus::new());
        let gate = Arc::new(StorageGate::new(device));
        let pool = Arc::new(BufferPool::new(limits.retained_buffers));
        let recovery = Arc::new(MemoryRecovery::new(
            pool.clone(),
            probe.clone(),
            policy,
            limits.recovery_pause,
        ));
        let (sender, receiver) = capture_queue(limits.queue_capacity);
        let interactive_heartbeat = Arc::new(Heartbeat::new("interactive"));
        let worker_heartbeat = Arc::new(Heartbeat::new("worker"));

        {
            let mut device = gate
                .acquire(limits.admin_gate_timeout)
                .map_err(|err| anyhow!("storage gate unavailable at startup: {}", err))?;
            match admin::mount_and_adopt(&status, &mut device) {
                Ok((mount, photos)) => {
                    info!(
                        "storage mounted{}: {} photos, {} free bytes",
                        if mount.formatted { " after format" } else { "" },
                        photos,
                        mount
                            .usage
                            .map(|u| u.free_bytes.to_string())
                            .unwrap_or_else(|| "unknown".to_string())
                    );
                }
                Err(err) => warn!("storage unavailable, starting degraded: {}", err),
            }
        }

        let admission = AdmissionController::new(AdmissionParts {
            queue: sender,
            status: status.clone(),
            probe: probe.clone(),
            policy,
            recovery: recovery.clone(),
            gate: gate.clone(),
            enqueue_timeout: limits.enqueue_timeout,
            min_interval: limits.capture_interval,
        });
        let admin = StorageAdmin::new(
            status.clone(),
            gate.clone(),
            interactive_heartbeat.clone(),
            limits.clone(),
        );

        Ok(Self {
            limits,
            status,
            gate,
            admission,
            admin,
            pool,
            probe,
            recovery,
            receiver: Mutex::new(Some(receiver)),
            worker_heartbeat,
            interactive_heartbeat,
            started: Instant::now(),
        })
    }

    pub fn limits(&self) -> &PipelineLimits {
        &self.limits
    }

    /// Buffer pool frame sources should draw from.
    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    pub fn interactive_heartbeat(&self) -> Arc<Heartbeat> {
        self.interactive_heartbeat.clone()
    }

    /// Build the capture worker. There is one queue consumer, so this
    /// succeeds once.
    pub fn worker(&self, source: Box<dyn FrameSource>) -> Result<CaptureWorker> {
        let queue = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| anyhow!("capture worker already created"))?;
        Ok(CaptureWorker::new(
            source,
            WorkerParts {
                queue,
                status: self.status.clone(),
                gate: self.gate.clone(),
                probe: self.probe.clone(),
                recovery: self.recovery.clone(),
                heartbeat: self.worker_heartbeat.clone(),
                limits: self.limits.clone(),
            },
        ))
    }

    pub fn spawn_worker(
        &self,
        source: Box<dyn FrameSource>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<WorkerHandle> {
        self.worker(source)?.spawn(shutdown)
    }

    /// Interactive capture request.
    pub fn request_capture(&self) -> Admission {
        self.interactive_heartbeat.beat();
        self.admission.try_admit(CaptureOrigin::Interactive)
    }

    /// Periodic timer trigger.
    pub fn tick(&self) -> Admission {
        self.interactive_heartbeat.beat();
        self.admission.try_admit(CaptureOrigin::Timer)
    }

    pub fn request_bulk_delete(&self, max_batch: usize) -> PipelineResult<BulkDeleteReport> {
        self.admin.bulk_delete(max_batch)
    }

    pub fn request_reformat(&self) -> PipelineResult<ReformatReport> {
        self.admin.reformat()
    }

    pub fn request_remount(&self) -> PipelineResult<RemountReport> {
        self.admin.remount()
    }

    /// Non-blocking snapshot.
    pub fn status(&self) -> PipelineStatus {
        self.status.snapshot()
    }

    pub fn status_report(&self) -> StatusReport {
        let free = self.probe.free_bytes();
        let worker_limit =
            self.limits.worker_poll + self.limits.worker_gate_timeout + STALL_GRACE;
        let interactive_limit =
            self.limits.admin_gate_timeout + self.limits.delete_time_budget + STALL_GRACE;
        let lanes = [
            (&self.interactive_heartbeat, interactive_limit),
            (&self.worker_heartbeat, worker_limit),
        ]
        .into_iter()
        .map(|(heartbeat, limit)| LaneReport {
            name: heartbeat.name(),
            silent_ms: heartbeat.silent_for().as_millis() as u64,
            stalled: heartbeat.is_stalled(limit),
        })
        .collect();
        StatusReport {
            status: self.status.snapshot(),
            uptime_secs: self.started.elapsed().as_secs(),
            queue_depth: self.admission.queue_depth(),
            queue_capacity: self.admission.queue_capacity(),
            free_memory_bytes: free,
            memory_pressure: ResourcePolicy::from_limits(&self.limits).memory_pressure(free),
            retained_buffer_bytes: self.pool.retained_bytes(),
            lanes,
        }
    }

    /// Newest-first gallery page. `per_page` is clamped to `1..=MAX_PAGE_SIZE`.
    pub fn list_photos(&self, page: usize, per_page: usize) -> PipelineResult<PhotoPage> {
        let per_page = per_page.clamp(1, MAX_PAGE_SIZE);
        let mut device = self.gate.acquire(self.limits.read_gate_timeout)?;
        if !device.is_mounted() {
            return Err(PipelineError::StorageUnavailable(
                "storage is not mounted".to_string(),
            ));
        }
        let listing = newest_page(device.photos()?, page, per_page);
        Ok(listing)
    }

    /// Read a stored photo by file name or device path.
    pub fn read_photo(&self, name: &str) -> PipelineResult<Vec<u8>> {
        let photo =
            PhotoName::parse(name).ok_or_else(|| PipelineError::InvalidPhotoName(name.to_string()))?;
        let mut device = self.gate.acquire(self.limits.read_gate_timeout)?;
        device.read_photo(photo)
    }

    /// The most recently stored photo.
    pub fn latest_photo(&self) -> PipelineResult<(PhotoName, Vec<u8>)> {
        let mut device = self.gate.acquire(self.limits.read_gate_timeout)?;
        let latest = self
            .status
            .latest_photo()
            .ok_or_else(|| PipelineError::PhotoNotFound("no photos stored".to_string()))?;
        let bytes = device.read_photo(latest)?;
        Ok((latest, bytes))
    }
}
