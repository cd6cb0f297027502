use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_API_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_STORAGE_ROOT: &str = "sdcard";
const DEFAULT_SENSOR: &str = "stub://ov2640";
const DEFAULT_SENSOR_WIDTH: u32 = 800;
const DEFAULT_SENSOR_HEIGHT: u32 = 600;
const DEFAULT_JPEG_QUALITY: u8 = 80;

const MIB: u64 = 1024 * 1024;

/// Resource thresholds and timing budgets for the capture pipeline.
///
/// Every field is externally tunable; none of them is an invariant of the
/// pipeline's algorithms.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineLimits {
    /// Fixed capacity of the capture queue.
    pub queue_capacity: usize,
    /// Admission requires strictly more free queue slots than this.
    pub min_queue_spaces: usize,
    /// Free memory required to admit a capture.
    pub min_free_bytes_for_capture: u64,
    /// Below this, memory recovery runs and the worker drops commands.
    pub critical_free_bytes: u64,
    /// Timer period, also the minimum spacing of interactive requests.
    pub capture_interval: Duration,
    pub enqueue_timeout: Duration,
    /// Bounded wait for a command on the worker lane.
    pub worker_poll: Duration,
    pub worker_gate_timeout: Duration,
    pub admin_gate_timeout: Duration,
    /// Grace period after pausing, before an admin operation contends for the gate.
    pub admin_settle: Duration,
    pub read_gate_timeout: Duration,
    /// Files removed between two liveness pings of a bulk delete.
    pub delete_batch_size: usize,
    /// Upper bound on files removed by one bulk delete request.
    pub delete_max_files: usize,
    pub delete_time_budget: Duration,
    /// Consecutive acquisition failures before the sensor is marked not ready.
    pub sensor_failure_limit: u32,
    pub sensor_retry_interval: Duration,
    /// Pause granted to the allocator during memory recovery.
    pub recovery_pause: Duration,
    /// Frame buffers kept for reuse between captures.
    pub retained_buffers: usize,
    /// Remove the orphan left by a partial write while the gate is still held.
    pub discard_partial_writes: bool,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            queue_capacity: 5,
            min_queue_spaces: 2,
            min_free_bytes_for_capture: 32 * MIB,
            critical_free_bytes: 8 * MIB,
            capture_interval: Duration::from_secs(1),
            enqueue_timeout: Duration::from_millis(10),
            worker_poll: Duration::from_millis(100),
            worker_gate_timeout: Duration::from_millis(500),
            admin_gate_timeout: Duration::from_secs(5),
            admin_settle: Duration::from_millis(100),
            read_gate_timeout: Duration::from_millis(500),
            delete_batch_size: 20,
            delete_max_files: 500,
            delete_time_budget: Duration::from_secs(3),
            sensor_failure_limit: 5,
            sensor_retry_interval: Duration::from_secs(5),
            recovery_pause: Duration::from_millis(10),
            retained_buffers: 2,
            discard_partial_writes: true,
        }
    }
}

impl PipelineLimits {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be greater than zero"));
        }
        if self.min_queue_spaces >= self.queue_capacity {
            return Err(anyhow!(
                "min_queue_spaces ({}) must be below queue_capacity ({})",
                self.min_queue_spaces,
                self.queue_capacity
            ));
        }
        if self.critical_free_bytes > self.min_free_bytes_for_capture {
            return Err(anyhow!(
                "critical_free_bytes must not exceed min_free_bytes_for_capture"
            ));
        }
        if self.delete_batch_size == 0 || self.delete_max_files == 0 {
            return Err(anyhow!("delete batch size and max files must be greater than zero"));
        }
        if self.worker_poll.is_zero() {
            return Err(anyhow!("worker_poll must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    api: Option<ApiConfigFile>,
    storage: Option<StorageConfigFile>,
    sensor: Option<SensorConfigFile>,
    limits: Option<LimitsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    root: Option<PathBuf>,
    format_if_mount_failed: Option<bool>,
    discard_partial_writes: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct SensorConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitsConfigFile {
    queue_capacity: Option<usize>,
    min_queue_spaces: Option<usize>,
    min_free_bytes_for_capture: Option<u64>,
    critical_free_bytes: Option<u64>,
    capture_interval_ms: Option<u64>,
    enqueue_timeout_ms: Option<u64>,
    worker_poll_ms: Option<u64>,
    worker_gate_timeout_ms: Option<u64>,
    admin_gate_timeout_ms: Option<u64>,
    admin_settle_ms: Option<u64>,
    read_gate_timeout_ms: Option<u64>,
    delete_batch_size: Option<usize>,
    delete_max_files: Option<usize>,
    delete_time_budget_ms: Option<u64>,
    sensor_failure_limit: Option<u32>,
    sensor_retry_interval_ms: Option<u64>,
    recovery_pause_ms: Option<u64>,
    retained_buffers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub api_addr: String,
    pub storage: StorageSettings,
    pub sensor: SensorSettings,
    pub limits: PipelineLimits,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Mount point of the removable card.
    pub root: PathBuf,
    pub format_if_mount_failed: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            format_if_mount_failed: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SensorSettings {
    /// `stub://...` for the synthetic sensor, a device path otherwise.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            source: DEFAULT_SENSOR.to_string(),
            width: DEFAULT_SENSOR_WIDTH,
            height: DEFAULT_SENSOR_HEIGHT,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl CameraConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMERA_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CameraConfigFile) -> Self {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let storage_file = file.storage.unwrap_or_default();
        let storage_defaults = StorageSettings::default();
        let storage = StorageSettings {
            root: storage_file.root.unwrap_or(storage_defaults.root),
            format_if_mount_failed: storage_file
                .format_if_mount_failed
                .unwrap_or(storage_defaults.format_if_mount_failed),
        };

        let sensor_file = file.sensor.unwrap_or_default();
        let sensor = SensorSettings {
            source: sensor_file
                .source
                .unwrap_or_else(|| DEFAULT_SENSOR.to_string()),
            width: sensor_file.width.unwrap_or(DEFAULT_SENSOR_WIDTH),
            height: sensor_file.height.unwrap_or(DEFAULT_SENSOR_HEIGHT),
            jpeg_quality: sensor_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        let mut limits = file
            .limits
            .map(LimitsConfigFile::into_limits)
            .unwrap_or_default();
        if let Some(discard) = storage_file.discard_partial_writes {
            limits.discard_partial_writes = discard;
        }

        Self {
            api_addr,
            storage,
            sensor,
            limits,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("CAMERA_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(root) = std::env::var("CAMERA_STORAGE_ROOT") {
            if !root.trim().is_empty() {
                self.storage.root = PathBuf::from(root);
            }
        }
        if let Ok(source) = std::env::var("CAMERA_SENSOR") {
            if !source.trim().is_empty() {
                self.sensor.source = source;
            }
        }
        if let Ok(interval) = std::env::var("CAMERA_CAPTURE_INTERVAL_MS") {
            let millis: u64 = interval.parse().map_err(|_| {
                anyhow!("CAMERA_CAPTURE_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.limits.capture_interval = Duration::from_millis(millis);
        }
        if let Ok(capacity) = std::env::var("CAMERA_QUEUE_CAPACITY") {
            self.limits.queue_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("CAMERA_QUEUE_CAPACITY must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        if self.limits.capture_interval.is_zero() {
            return Err(anyhow!("capture interval must be greater than zero"));
        }
        if !(1..=100).contains(&self.sensor.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be within 1..=100"));
        }
        if self.sensor.width == 0 || self.sensor.height == 0 {
            return Err(anyhow!("sensor dimensions must be non-zero"));
        }
        Ok(())
    }
}

impl LimitsConfigFile {
    fn into_limits(self) -> PipelineLimits {
        let d = PipelineLimits::default();
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        PipelineLimits {
            queue_capacity: self.queue_capacity.unwrap_or(d.queue_capacity),
            min_queue_spaces: self.min_queue_spaces.unwrap_or(d.min_queue_spaces),
            min_free_bytes_for_capture: self
                .min_free_bytes_for_capture
                .unwrap_or(d.min_free_bytes_for_capture),
            critical_free_bytes: self.critical_free_bytes.unwrap_or(d.critical_free_bytes),
            capture_interval: ms(self.capture_interval_ms, d.capture_interval),
            enqueue_timeout: ms(self.enqueue_timeout_ms, d.enqueue_timeout),
            worker_poll: ms(self.worker_poll_ms, d.worker_poll),
            worker_gate_timeout: ms(self.worker_gate_timeout_ms, d.worker_gate_timeout),
            admin_gate_timeout: ms(self.admin_gate_timeout_ms, d.admin_gate_timeout),
            admin_settle: ms(self.admin_settle_ms, d.admin_settle),
            read_gate_timeout: ms(self.read_gate_timeout_ms, d.read_gate_timeout),
            delete_batch_size: self.delete_batch_size.unwrap_or(d.delete_batch_size),
            delete_max_files: self.delete_max_files.unwrap_or(d.delete_max_files),
            delete_time_budget: ms(self.delete_time_budget_ms, d.delete_time_budget),
            sensor_failure_limit: self.sensor_failure_limit.unwrap_or(d.sensor_failure_limit),
            sensor_retry_interval: ms(self.sensor_retry_interval_ms, d.sensor_retry_interval),
            recovery_pause: ms(self.recovery_pause_ms, d.recovery_pause),
            retained_buffers: self.retained_buffers.unwrap_or(d.retained_buffers),
            discard_partial_writes: d.discard_partial_writes,
        }
    }
}

fn read_config_file(path: &Path) -> Result<CameraConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_valid() {
        PipelineLimits::default().validate().unwrap();
    }

    #[test]
    fn rejects_queue_spaces_at_capacity() {
        let limits = PipelineLimits {
            queue_capacity: 3,
            min_queue_spaces: 3,
            ..PipelineLimits::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn rejects_critical_threshold_above_admission_threshold() {
        let limits = PipelineLimits {
            min_free_bytes_for_capture: MIB,
            critical_free_bytes: 2 * MIB,
            ..PipelineLimits::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn partial_limits_fall_back_to_defaults() {
        let file: CameraConfigFile =
            serde_json::from_str(r#"{"limits": {"queue_capacity": 8, "delete_time_budget_ms": 250}}"#)
                .unwrap();
        let cfg = CameraConfig::from_file(file);
        assert_eq!(cfg.limits.queue_capacity, 8);
        assert_eq!(cfg.limits.delete_time_budget, Duration::from_millis(250));
        assert_eq!(cfg.limits.min_queue_spaces, 2);
        assert_eq!(cfg.sensor.source, DEFAULT_SENSOR);
        assert!(cfg.limits.discard_partial_writes);
    }

    #[test]
    fn recovery_pause_is_configurable() {
        let file: CameraConfigFile =
            serde_json::from_str(r#"{"limits": {"recovery_pause_ms": 0}}"#).unwrap();
        let cfg = CameraConfig::from_file(file);
        assert_eq!(cfg.limits.recovery_pause, Duration::ZERO);
        assert_eq!(
            CameraConfig::from_file(CameraConfigFile::default()).limits.recovery_pause,
            PipelineLimits::default().recovery_pause
        );
    }

    #[test]
    fn storage_section_controls_partial_write_handling() {
        let file: CameraConfigFile = serde_json::from_str(
            r#"{"storage": {"root": "/mnt/card", "discard_partial_writes": false}}"#,
        )
        .unwrap();
        let cfg = CameraConfig::from_file(file);
        assert_eq!(cfg.storage.root, PathBuf::from("/mnt/card"));
        assert!(!cfg.limits.discard_partial_writes);
    }
}
