//! V4L2 sensor.
//!
//! Captures MJPEG frames from a local device node (e.g. /dev/video0). Each
//! frame is copied out of the driver's mmap ring into a pooled buffer, so the
//! driver buffer is requeued immediately and the worker owns its copy.

use ouroboros::self_referencing;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{FrameSource, SensorStats};
use crate::config::SensorSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{BufferPool, Frame};

const MMAP_BUFFERS: u32 = 2;

pub struct V4l2Sensor {
    settings: SensorSettings,
    pool: Arc<BufferPool>,
    state: Option<DeviceState>,
    frame_count: u64,
    failures: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Sensor {
    pub fn new(settings: SensorSettings, pool: Arc<BufferPool>) -> Self {
        Self {
            active_width: settings.width,
            active_height: settings.height,
            settings,
            pool,
            state: None,
            frame_count: 0,
            failures: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn unavailable(&mut self, message: String) -> PipelineError {
        self.failures += 1;
        self.last_error = Some(message.clone());
        PipelineError::SensorUnavailable(message)
    }

    fn health_grace(&self) -> Duration {
        Duration::from_secs(10)
    }
}

impl FrameSource for V4l2Sensor {
    fn connect(&mut self) -> PipelineResult<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        self.state = None;
        let mut device = v4l::Device::with_path(&self.settings.source).map_err(|err| {
            self.unavailable(format!("open v4l2 device {}: {}", self.settings.source, err))
        })?;
        let mut format = device
            .format()
            .map_err(|err| self.unavailable(format!("read v4l2 format: {}", err)))?;
        format.width = self.settings.width;
        format.height = self.settings.height;
        format.fourcc = v4l::FourCC::new(b"MJPG");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Sensor: failed to set format on {}: {}",
                    self.settings.source,
                    err
                );
                device
                    .format()
                    .map_err(|err| self.unavailable(format!("read v4l2 format: {}", err)))?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"MJPG") {
            return Err(self.unavailable(format!(
                "{} does not deliver MJPG frames",
                self.settings.source
            )));
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, MMAP_BUFFERS)
            },
        }
        .try_build()
        .map_err(|err| self.unavailable(format!("create v4l2 buffer stream: {}", err)))?;
        self.state = Some(state);
        self.last_error = None;

        log::info!(
            "V4l2Sensor: connected to {} ({}x{})",
            self.settings.source,
            self.active_width,
            self.active_height
        );
        Ok(())
    }

    fn acquire_frame(&mut self) -> PipelineResult<Frame> {
        use v4l::io::traits::CaptureStream;

        let Some(state) = self.state.as_mut() else {
            return Err(self.unavailable("v4l2 device not connected".to_string()));
        };
        let mut buf = self.pool.take(0);
        let captured = state.with_mut(|fields| {
            fields.stream.next().map(|(data, meta)| {
                let used = (meta.bytesused as usize).min(data.len());
                buf.extend_from_slice(&data[..used]);
            })
        });
        if let Err(err) = captured {
            self.pool.give(buf);
            return Err(self.unavailable(format!("capture v4l2 frame: {}", err)));
        }

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Frame::new(buf, self.active_width, self.active_height))
    }

    fn release_frame(&mut self, frame: Frame) {
        self.pool.give(frame.into_buffer());
    }

    fn is_healthy(&self) -> bool {
        if self.state.is_none() || self.last_error.is_some() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SensorStats {
        SensorStats {
            frames_captured: self.frame_count,
            failures: self.failures,
            source: self.settings.source.clone(),
        }
    }
}
