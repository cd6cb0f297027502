//! Timelapse Kernel
//!
//! This crate implements the capture core of an embedded timelapse camera:
//! periodic still captures persisted to a removable card, while a local
//! management API stays responsive.
//!
//! # Architecture
//!
//! The pipeline keeps these guarantees by construction:
//!
//! 1. **Bounded Waits**: Every blocking point (enqueue, dequeue, storage gate)
//!    has a timeout. Nothing on either lane can hang.
//! 2. **Single Storage Owner**: All card access goes through the storage gate.
//!    Captures and administrative operations never interleave on the device.
//! 3. **Unique Names**: Photo sequence numbers strictly increase and are never
//!    reused, even across deletes and remounts.
//! 4. **Consistent Status**: Photo count and last filename change together,
//!    under the gate. Readers never block.
//! 5. **Nothing Fatal**: Every failure is local to one command or one
//!    operation. The worst state is `Degraded`, which a remount clears.
//!
//! # Module Structure
//!
//! - `pipeline`: admission, capture queue, worker, storage gate, admin operations
//! - `sensor`: frame sources (synthetic JPEG, V4L2)
//! - `storage`: the removable card and its photo naming scheme
//! - `memory`: free-memory probes and the resource-pressure policy
//! - `api`: local HTTP front end and capture timer

pub mod api;
pub mod config;
pub mod error;
pub mod frame;
pub mod liveness;
pub mod memory;
pub mod pipeline;
pub mod sensor;
pub mod storage;

pub use config::{CameraConfig, PipelineLimits, SensorSettings, StorageSettings};
pub use error::{PipelineError, PipelineResult, RejectReason};
pub use frame::{BufferPool, Frame};
pub use liveness::Heartbeat;
pub use memory::{ManualMemoryProbe, MemoryPressure, MemoryProbe, ResourcePolicy, SystemMemoryProbe};
pub use pipeline::{
    Admission, BulkDeleteReport, CaptureOutcome, CaptureWorker, DropReason, Pipeline,
    PipelinePhase, PipelineStatus, ReformatReport, RemountReport, StatusReport, WorkerHandle,
};
pub use sensor::{open_sensor, FrameSource, SensorStats, SyntheticSensor};
pub use storage::{DirStorage, MountInfo, PhotoName, PhotoPage, StorageDevice, StorageUsage};
