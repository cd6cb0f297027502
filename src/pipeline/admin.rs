//! Administrative storage operations: bulk delete, reformat, remount.
//!
//! Each one pauses the pipeline, lets an in-flight write settle, then takes
//! the storage gate with a bounded timeout. Failing to get the gate aborts
//! the operation with `StorageBusy` before anything is touched. Long-running
//! work is split into batches with a heartbeat between them.

use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::gate::{StorageGate, StorageGuard};
use super::status::SharedStatus;
use crate::config::PipelineLimits;
use crate::error::{PipelineError, PipelineResult};
use crate::liveness::Heartbeat;
use crate::storage::{oldest, summarize, MountInfo, StorageUsage};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BulkDeleteReport {
    pub deleted: u64,
    pub remaining: u64,
    pub success: bool,
    /// The time or file-count cap stopped this call with photos left.
    pub budget_exhausted: bool,
}

impl BulkDeleteReport {
    /// The cap that stopped this call, if any. Repeating the call resumes.
    pub fn budget_error(&self) -> Option<PipelineError> {
        self.budget_exhausted
            .then_some(PipelineError::OperationBudgetExceeded {
                completed: self.deleted,
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReformatReport {
    pub success: bool,
    pub deleted: u64,
    pub strays_removed: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RemountReport {
    pub success: bool,
    pub photos_found: u64,
    pub formatted: bool,
    pub usage: Option<StorageUsage>,
}

/// Holds the pipeline paused for as long as it lives.
struct PauseGuard<'a> {
    status: &'a SharedStatus,
}

impl<'a> PauseGuard<'a> {
    fn new(status: &'a SharedStatus) -> Self {
        status.pause();
        Self { status }
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.status.resume();
    }
}

struct DeleteProgress {
    deleted: u64,
    hit_budget: bool,
    error: Option<PipelineError>,
}

pub struct StorageAdmin {
    status: Arc<SharedStatus>,
    gate: Arc<StorageGate>,
    heartbeat: Arc<Heartbeat>,
    limits: PipelineLimits,
}

impl StorageAdmin {
    pub fn new(
        status: Arc<SharedStatus>,
        gate: Arc<StorageGate>,
        heartbeat: Arc<Heartbeat>,
        limits: PipelineLimits,
    ) -> Self {
        Self {
            status,
            gate,
            heartbeat,
            limits,
        }
    }

    /// Pause, settle and take the gate.
    fn enter(&self) -> PipelineResult<(PauseGuard<'_>, StorageGuard<'_>)> {
        let pause = PauseGuard::new(&self.status);
        self.heartbeat.beat();
        if !self.limits.admin_settle.is_zero() {
            std::thread::sleep(self.limits.admin_settle);
        }
        let device = self.gate.acquire(self.limits.admin_gate_timeout)?;
        self.heartbeat.beat();
        Ok((pause, device))
    }

    /// Remove up to `max_batch` of the oldest photos (0 means the configured
    /// per-call maximum). Stops early when the time budget runs out.
    pub fn bulk_delete(&self, max_batch: usize) -> PipelineResult<BulkDeleteReport> {
        let (_pause, mut device) = self.enter()?;
        if !device.is_mounted() {
            return Err(PipelineError::StorageUnavailable(
                "storage is not mounted".to_string(),
            ));
        }

        let cap = match max_batch {
            0 => self.limits.delete_max_files,
            n => n.min(self.limits.delete_max_files),
        };
        let deadline = Instant::now() + self.limits.delete_time_budget;
        let progress = self.delete_oldest(&mut device, cap as u64, Some(deadline));

        let counted = device.photos().map(|photos| photos.count() as u64);
        let remaining = match counted {
            Ok(remaining) => remaining,
            Err(err) => {
                self.status.forget_photos(&device, progress.deleted, u64::MAX);
                self.mark_unavailable(&err);
                return Err(err);
            }
        };
        self.status.forget_photos(&device, progress.deleted, remaining);

        let report = BulkDeleteReport {
            deleted: progress.deleted,
            remaining,
            success: progress.error.is_none(),
            budget_exhausted: remaining > 0
                && (progress.hit_budget || progress.deleted >= cap as u64),
        };
        match &progress.error {
            Some(err) => {
                self.mark_unavailable(err);
                warn!("bulk delete stopped after {} files: {}", report.deleted, err);
            }
            None => info!(
                "bulk delete removed {} photos, {} remaining",
                report.deleted, report.remaining
            ),
        }
        Ok(report)
    }

    /// Delete every photo and stray file, then rebuild the mount.
    pub fn reformat(&self) -> PipelineResult<ReformatReport> {
        let (_pause, mut device) = self.enter()?;
        if !device.is_mounted() {
            if let Err(err) = device.mount() {
                self.status.set_storage_ready(false);
                return Err(err);
            }
        }

        let progress = self.delete_oldest(&mut device, u64::MAX, None);
        if let Some(err) = progress.error {
            let remaining = device.photos().map(|p| p.count() as u64).unwrap_or(u64::MAX);
            self.status.forget_photos(&device, progress.deleted, remaining);
            self.mark_unavailable(&err);
            warn!("reformat failed after deleting {} photos: {}", progress.deleted, err);
            return Ok(ReformatReport {
                success: false,
                deleted: progress.deleted,
                strays_removed: 0,
            });
        }
        let strays_removed = match device.remove_stray_files() {
            Ok(n) => n,
            Err(err) => {
                warn!("could not remove stray files: {}", err);
                0
            }
        };
        self.heartbeat.beat();

        device.unmount();
        let remounted = device.mount();
        let empty = remounted.is_ok()
            && device
                .photos()
                .map(|mut photos| photos.next().is_none())
                .unwrap_or(false);
        self.status.reset_photos(&device);
        self.status.set_storage_ready(remounted.is_ok());

        match &remounted {
            Ok(_) if empty => info!(
                "reformat removed {} photos and {} stray files",
                progress.deleted, strays_removed
            ),
            Ok(_) => warn!("reformat finished but photos remain on the card"),
            Err(err) => warn!("remount after reformat failed: {}", err),
        }
        Ok(ReformatReport {
            success: empty,
            deleted: progress.deleted,
            strays_removed,
        })
    }

    /// Tear down and rebuild the mount without touching content.
    pub fn remount(&self) -> PipelineResult<RemountReport> {
        let (_pause, mut device) = self.enter()?;
        device.unmount();
        let report = match mount_and_adopt(&self.status, &mut device) {
            Ok((info, photos_found)) => {
                info!("storage remounted, {} photos on card", photos_found);
                RemountReport {
                    success: true,
                    photos_found,
                    formatted: info.formatted,
                    usage: info.usage,
                }
            }
            Err(err) => {
                warn!("remount failed: {}", err);
                RemountReport {
                    success: false,
                    photos_found: 0,
                    formatted: false,
                    usage: None,
                }
            }
        };
        self.status.request_sensor_reinit();
        Ok(report)
    }

    fn delete_oldest(
        &self,
        device: &mut StorageGuard<'_>,
        cap: u64,
        deadline: Option<Instant>,
    ) -> DeleteProgress {
        let mut progress = DeleteProgress {
            deleted: 0,
            hit_budget: false,
            error: None,
        };
        'batches: while progress.deleted < cap {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                progress.hit_budget = true;
                break;
            }
            let want = (cap - progress.deleted).min(self.limits.delete_batch_size as u64) as usize;
            let batch = match device.photos() {
                Ok(photos) => oldest(photos, want),
                Err(err) => {
                    progress.error = Some(err);
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            for name in batch {
                match device.remove_photo(name) {
                    Ok(()) => progress.deleted += 1,
                    Err(PipelineError::PhotoNotFound(_)) => {}
                    Err(err) => {
                        progress.error = Some(err);
                        break 'batches;
                    }
                }
            }
            self.heartbeat.beat();
            std::thread::sleep(Duration::from_millis(1));
        }
        progress
    }

    fn mark_unavailable(&self, err: &PipelineError) {
        if matches!(err, PipelineError::StorageUnavailable(_)) {
            self.status.set_storage_ready(false);
        }
    }
}

/// Mount the device and take over whatever photos it already holds.
pub(crate) fn mount_and_adopt(
    status: &SharedStatus,
    device: &mut StorageGuard<'_>,
) -> PipelineResult<(MountInfo, u64)> {
    let mounted = device.mount().and_then(|info| {
        let summary = summarize(device.photos()?);
        Ok((info, summary))
    });
    match mounted {
        Ok((info, summary)) => {
            status.adopt(device, summary);
            status.set_storage_ready(true);
            Ok((info, summary.count))
        }
        Err(err) => {
            status.set_storage_ready(false);
            Err(err)
        }
    }
}
