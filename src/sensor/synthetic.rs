//! Synthetic JPEG sensor.
//!
//! Renders a moving test pattern and encodes it as a real JPEG so the rest of
//! the pipeline handles the same payloads it would from hardware.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::sync::Arc;

use super::{FrameSource, SensorStats};
use crate::config::SensorSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{BufferPool, Frame};

pub struct SyntheticSensor {
    settings: SensorSettings,
    pool: Arc<BufferPool>,
    connected: bool,
    frame_count: u64,
    failures: u64,
    /// RGB render target, reused across frames.
    scratch: Vec<u8>,
}

impl SyntheticSensor {
    pub fn new(settings: SensorSettings, pool: Arc<BufferPool>) -> Self {
        Self {
            settings,
            pool,
            connected: false,
            frame_count: 0,
            failures: 0,
            scratch: Vec::new(),
        }
    }

    /// Vertical bar sweeping across a gradient, with a little sensor noise.
    fn render(&mut self) {
        let width = self.settings.width as usize;
        let height = self.settings.height as usize;
        self.scratch.resize(width * height * 3, 0);

        let bar = (self.frame_count as usize * 7) % width.max(1);
        let noise: u8 = rand::random::<u8>() & 0x0f;
        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) * 3;
                let on_bar = x.abs_diff(bar) < 4;
                self.scratch[idx] = if on_bar { 255 } else { (x * 255 / width.max(1)) as u8 };
                self.scratch[idx + 1] = (y * 255 / height.max(1)) as u8;
                self.scratch[idx + 2] = noise.wrapping_add((self.frame_count % 256) as u8);
            }
        }
    }
}

impl FrameSource for SyntheticSensor {
    /// Synthetic sensors are always "connected".
    fn connect(&mut self) -> PipelineResult<()> {
        self.connected = true;
        log::info!("SyntheticSensor: connected to {}", self.settings.source);
        Ok(())
    }

    fn acquire_frame(&mut self) -> PipelineResult<Frame> {
        if !self.connected {
            self.failures += 1;
            return Err(PipelineError::SensorUnavailable(
                "synthetic sensor not connected".to_string(),
            ));
        }
        self.frame_count += 1;
        self.render();

        let width = self.settings.width;
        let height = self.settings.height;
        // Compressed output rarely exceeds a tenth of the raw size.
        let mut buf = self.pool.take(self.scratch.len() / 10);
        let encoded = {
            let mut encoder = JpegEncoder::new_with_quality(&mut buf, self.settings.jpeg_quality);
            encoder.encode(&self.scratch, width, height, ExtendedColorType::Rgb8)
        };
        if let Err(err) = encoded {
            self.failures += 1;
            self.pool.give(buf);
            return Err(PipelineError::SensorUnavailable(format!(
                "jpeg encode failed: {}",
                err
            )));
        }
        Ok(Frame::new(buf, width, height))
    }

    fn release_frame(&mut self, frame: Frame) {
        self.pool.give(frame.into_buffer());
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SensorStats {
        SensorStats {
            frames_captured: self.frame_count,
            failures: self.failures,
            source: self.settings.source.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_settings() -> SensorSettings {
        SensorSettings {
            source: "stub://test".to_string(),
            width: 64,
            height: 48,
            jpeg_quality: 60,
        }
    }

    #[test]
    fn produces_jpeg_frames() -> PipelineResult<()> {
        let mut sensor = SyntheticSensor::new(stub_settings(), Arc::new(BufferPool::new(2)));
        sensor.connect()?;

        let frame = sensor.acquire_frame()?;
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 48);
        assert_eq!(&frame.bytes()[..2], &[0xFF, 0xD8]);
        assert_eq!(&frame.bytes()[frame.len() - 2..], &[0xFF, 0xD9]);
        sensor.release_frame(frame);
        assert_eq!(sensor.stats().frames_captured, 1);
        Ok(())
    }

    #[test]
    fn acquisition_requires_connect() {
        let mut sensor = SyntheticSensor::new(stub_settings(), Arc::new(BufferPool::new(2)));
        assert!(matches!(
            sensor.acquire_frame(),
            Err(PipelineError::SensorUnavailable(_))
        ));
        assert_eq!(sensor.stats().failures, 1);
    }

    #[test]
    fn released_buffers_return_to_pool() -> PipelineResult<()> {
        let pool = Arc::new(BufferPool::new(2));
        let mut sensor = SyntheticSensor::new(stub_settings(), pool.clone());
        sensor.connect()?;

        let frame = sensor.acquire_frame()?;
        assert_eq!(pool.retained(), 0);
        sensor.release_frame(frame);
        assert_eq!(pool.retained(), 1);
        Ok(())
    }
}
