//! Image sensor frame sources.
//!
//! This module provides the sources the capture worker draws frames from:
//! - Synthetic JPEG sensor (`stub://` sources, tests and bench setups)
//! - USB/V4L2 devices (feature: sensor-v4l2)
//!
//! Every source hands out a `Frame` whose buffer belongs to the caller until it
//! is passed back through `release_frame`. Sources draw their buffers from the
//! shared `BufferPool` so released buffers are reused by the next capture.

pub mod synthetic;
#[cfg(feature = "sensor-v4l2")]
pub mod v4l2;

use anyhow::Result;
use std::sync::Arc;

use crate::config::SensorSettings;
use crate::error::PipelineResult;
use crate::frame::{BufferPool, Frame};

pub use synthetic::SyntheticSensor;
#[cfg(feature = "sensor-v4l2")]
pub use v4l2::V4l2Sensor;

/// Capability the capture worker depends on.
pub trait FrameSource: Send {
    /// (Re)initialise the sensor.
    fn connect(&mut self) -> PipelineResult<()>;

    /// Capture one frame. Ownership of the buffer moves to the caller.
    fn acquire_frame(&mut self) -> PipelineResult<Frame>;

    /// Return a frame obtained from `acquire_frame`.
    fn release_frame(&mut self, frame: Frame);

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SensorStats;
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SensorStats {
    pub frames_captured: u64,
    pub failures: u64,
    pub source: String,
}

/// Build the frame source named by `settings.source`.
pub fn open_sensor(settings: &SensorSettings, pool: Arc<BufferPool>) -> Result<Box<dyn FrameSource>> {
    if settings.source.starts_with("stub://") {
        return Ok(Box::new(SyntheticSensor::new(settings.clone(), pool)));
    }
    #[cfg(feature = "sensor-v4l2")]
    {
        Ok(Box::new(V4l2Sensor::new(settings.clone(), pool)))
    }
    #[cfg(not(feature = "sensor-v4l2"))]
    {
        anyhow::bail!(
            "sensor source '{}' requires the sensor-v4l2 feature",
            settings.source
        )
    }
}
