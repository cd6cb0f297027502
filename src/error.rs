//! Pipeline error taxonomy.
//!
//! Every failure the capture pipeline can observe is one of the variants below.
//! None of them is fatal to the process: the component that detects a failure
//! handles it locally and hands a structured result back to its caller. The
//! worst reachable outcome is the `Degraded` phase, which `request_remount`
//! recovers from.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Convenience alias for results carrying a [`PipelineError`].
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Frame acquisition failed. Transient; the next trigger tries again.
    #[error("sensor unavailable: {0}")]
    SensorUnavailable(String),

    /// The storage mount is missing or failed. Captures are rejected until a
    /// successful remount.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The storage gate could not be acquired within its timeout.
    #[error("storage busy")]
    StorageBusy,

    /// Memory or queue pressure.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Fewer bytes reached the device than the frame carried.
    #[error("partial write: {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },

    /// An administrative batch hit its time or file-count cap.
    #[error("operation budget exceeded after {completed} items")]
    OperationBudgetExceeded { completed: u64 },

    #[error("invalid photo name: {0}")]
    InvalidPhotoName(String),

    #[error("photo not found: {0}")]
    PhotoNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Stable machine-readable code for front ends.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::SensorUnavailable(_) => "sensor_unavailable",
            PipelineError::StorageUnavailable(_) => "storage_unavailable",
            PipelineError::StorageBusy => "storage_busy",
            PipelineError::ResourceExhausted(_) => "resource_exhausted",
            PipelineError::PartialWrite { .. } => "partial_write",
            PipelineError::OperationBudgetExceeded { .. } => "operation_budget_exceeded",
            PipelineError::InvalidPhotoName(_) => "invalid_photo_name",
            PipelineError::PhotoNotFound(_) => "photo_not_found",
            PipelineError::Io(_) => "io",
        }
    }
}

/// Why the admission controller turned a capture request away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// An administrative operation paused the pipeline.
    Busy,
    /// Storage or sensor is not ready.
    Degraded,
    /// Free memory is below the admission threshold.
    LowMemory,
    /// Too few free queue slots remain.
    QueueSaturated,
    /// The bounded enqueue did not complete in time.
    EnqueueTimeout,
    /// An interactive request arrived sooner than one capture interval after
    /// the previous one.
    RateLimited,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Busy => "busy",
            RejectReason::Degraded => "degraded",
            RejectReason::LowMemory => "low_memory",
            RejectReason::QueueSaturated => "queue_saturated",
            RejectReason::EnqueueTimeout => "enqueue_timeout",
            RejectReason::RateLimited => "rate_limited",
        }
    }

    /// Human-readable explanation for status displays.
    pub fn describe(&self) -> &'static str {
        match self {
            RejectReason::Busy => "storage maintenance in progress",
            RejectReason::Degraded => "camera or storage not ready",
            RejectReason::LowMemory => "not enough free memory to capture",
            RejectReason::QueueSaturated => "capture queue is full",
            RejectReason::EnqueueTimeout => "capture queue did not accept the request in time",
            RejectReason::RateLimited => "captures are limited to one per interval",
        }
    }

    /// The error a resource-pressure rejection stands for. Phase and rate
    /// rejections are not errors.
    pub fn as_error(&self) -> Option<PipelineError> {
        match self {
            RejectReason::LowMemory | RejectReason::QueueSaturated | RejectReason::EnqueueTimeout => {
                Some(PipelineError::ResourceExhausted(self.describe().to_string()))
            }
            RejectReason::Busy | RejectReason::Degraded | RejectReason::RateLimited => None,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_write_message_carries_byte_counts() {
        let err = PipelineError::PartialWrite {
            written: 10,
            expected: 20,
        };
        assert_eq!(err.to_string(), "partial write: 10 of 20 bytes");
        assert_eq!(err.code(), "partial_write");
    }

    #[test]
    fn reject_reasons_serialize_as_snake_case() {
        let json = serde_json::to_string(&RejectReason::QueueSaturated).unwrap();
        assert_eq!(json, "\"queue_saturated\"");
        assert_eq!(RejectReason::LowMemory.to_string(), "low_memory");
    }

    #[test]
    fn only_pressure_rejections_are_resource_errors() {
        let err = RejectReason::QueueSaturated.as_error().unwrap();
        assert_eq!(err.code(), "resource_exhausted");
        assert_eq!(err.to_string(), "resource exhausted: capture queue is full");
        assert!(RejectReason::LowMemory.as_error().is_some());
        assert!(RejectReason::Busy.as_error().is_none());
        assert!(RejectReason::RateLimited.as_error().is_none());
    }
}
