#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use timelapse_kernel::{
    DirStorage, Frame, FrameSource, ManualMemoryProbe, MountInfo, PhotoName, Pipeline,
    PipelineError, PipelineLimits, PipelineResult, SensorStats, StorageDevice, StorageSettings,
    StorageUsage,
};

pub const PLENTY_OF_MEMORY: u64 = 1 << 30;

/// Limits tuned for tests: no rate limit, short settle and poll times.
pub fn test_limits() -> PipelineLimits {
    PipelineLimits {
        capture_interval: Duration::ZERO,
        admin_settle: Duration::from_millis(5),
        worker_poll: Duration::from_millis(20),
        worker_gate_timeout: Duration::from_millis(500),
        admin_gate_timeout: Duration::from_secs(3),
        min_free_bytes_for_capture: 1_000_000,
        critical_free_bytes: 100_000,
        recovery_pause: Duration::ZERO,
        ..PipelineLimits::default()
    }
}

pub fn dir_storage(root: &Path) -> DirStorage {
    DirStorage::new(&StorageSettings {
        root: root.to_path_buf(),
        format_if_mount_failed: false,
    })
}

pub fn open_pipeline(
    limits: PipelineLimits,
    card: impl StorageDevice + 'static,
) -> (Arc<Pipeline>, Arc<ManualMemoryProbe>) {
    let probe = Arc::new(ManualMemoryProbe::new(PLENTY_OF_MEMORY));
    let pipeline = Pipeline::open(limits, Box::new(card), probe.clone()).expect("open pipeline");
    (Arc::new(pipeline), probe)
}

/// Put a photo on the card without going through the pipeline.
pub fn seed_photo(root: &Path, sequence: u64, payload: &[u8]) {
    let dir = root.join("photos");
    std::fs::create_dir_all(&dir).expect("create photos dir");
    std::fs::write(dir.join(PhotoName::new(sequence).file_name()), payload).expect("seed photo");
}

pub fn files_on_card(root: &Path) -> usize {
    std::fs::read_dir(root.join("photos"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Payload of the `n`th frame (1-based) produced by `PatternSensor`.
pub fn frame_payload(n: u64) -> Vec<u8> {
    let mut payload = vec![0xFF, 0xD8];
    payload.extend(format!("frame-{n:04}-").repeat(64).into_bytes());
    payload.extend([0xFF, 0xD9]);
    payload
}

/// Sensor producing deterministic payloads, optionally failing every acquire.
pub struct PatternSensor {
    produced: u64,
    failures: u64,
    connected: bool,
    failing: Arc<AtomicBool>,
}

impl PatternSensor {
    pub fn new() -> Self {
        Self::with_failures(Arc::new(AtomicBool::new(false)))
    }

    pub fn with_failures(failing: Arc<AtomicBool>) -> Self {
        Self {
            produced: 0,
            failures: 0,
            connected: false,
            failing,
        }
    }
}

impl FrameSource for PatternSensor {
    fn connect(&mut self) -> PipelineResult<()> {
        self.connected = true;
        Ok(())
    }

    fn acquire_frame(&mut self) -> PipelineResult<Frame> {
        if !self.connected || self.failing.load(Ordering::SeqCst) {
            self.failures += 1;
            return Err(PipelineError::SensorUnavailable("lens cap on".to_string()));
        }
        self.produced += 1;
        Ok(Frame::new(frame_payload(self.produced), 8, 8))
    }

    fn release_frame(&mut self, _frame: Frame) {}

    fn is_healthy(&self) -> bool {
        self.connected && !self.failing.load(Ordering::SeqCst)
    }

    fn stats(&self) -> SensorStats {
        SensorStats {
            frames_captured: self.produced,
            failures: self.failures,
            source: "pattern".to_string(),
        }
    }
}

/// Holds writes until released, once armed.
pub struct WriteHold {
    pub armed: Arc<AtomicBool>,
    started: Sender<u64>,
    release: Receiver<()>,
}

pub struct HoldControl {
    pub armed: Arc<AtomicBool>,
    pub started: Receiver<u64>,
    pub release: Sender<()>,
}

pub fn write_hold() -> (WriteHold, HoldControl) {
    let armed = Arc::new(AtomicBool::new(false));
    let (started_tx, started_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    (
        WriteHold {
            armed: armed.clone(),
            started: started_tx,
            release: release_rx,
        },
        HoldControl {
            armed,
            started: started_rx,
            release: release_tx,
        },
    )
}

/// A `DirStorage` with knobs: short writes, held writes and a log of every
/// completed write.
pub struct TestCard {
    inner: DirStorage,
    pub short_writes: bool,
    hold: Option<WriteHold>,
    written: Arc<Mutex<Vec<u64>>>,
}

impl TestCard {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: dir_storage(root),
            short_writes: false,
            hold: None,
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn short_writes(mut self) -> Self {
        self.short_writes = true;
        self
    }

    pub fn with_hold(mut self, hold: WriteHold) -> Self {
        self.hold = Some(hold);
        self
    }

    pub fn write_log(&self) -> Arc<Mutex<Vec<u64>>> {
        self.written.clone()
    }
}

impl StorageDevice for TestCard {
    fn mount(&mut self) -> PipelineResult<MountInfo> {
        self.inner.mount()
    }

    fn unmount(&mut self) {
        self.inner.unmount()
    }

    fn is_mounted(&self) -> bool {
        self.inner.is_mounted()
    }

    fn write_photo(&mut self, name: PhotoName, payload: &[u8]) -> PipelineResult<usize> {
        if let Some(hold) = &self.hold {
            if hold.armed.load(Ordering::SeqCst) {
                let _ = hold.started.send(name.sequence());
                let _ = hold.release.recv_timeout(Duration::from_secs(5));
            }
        }
        let payload = if self.short_writes {
            &payload[..payload.len() / 2]
        } else {
            payload
        };
        let written = self.inner.write_photo(name, payload)?;
        self.written
            .lock()
            .expect("write log")
            .push(name.sequence());
        Ok(written)
    }

    fn read_photo(&mut self, name: PhotoName) -> PipelineResult<Vec<u8>> {
        self.inner.read_photo(name)
    }

    fn remove_photo(&mut self, name: PhotoName) -> PipelineResult<()> {
        self.inner.remove_photo(name)
    }

    fn photos(&mut self) -> PipelineResult<Box<dyn Iterator<Item = PhotoName> + '_>> {
        self.inner.photos()
    }

    fn remove_stray_files(&mut self) -> PipelineResult<u64> {
        self.inner.remove_stray_files()
    }

    fn sync(&mut self) -> PipelineResult<()> {
        self.inner.sync()
    }

    fn usage(&self) -> Option<StorageUsage> {
        self.inner.usage()
    }
}
