//! Removable photo storage.
//!
//! The device holds a single `/photos` directory of images named
//! `photo_NNNNNN.jpg`, where `NNNNNN` is a zero-padded sequence number that is
//! strictly increasing and never reused. All access goes through the
//! `StorageDevice` trait, and every caller holds the pipeline's storage gate
//! while using it.

pub mod dir;
pub mod index;

use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

use crate::error::PipelineResult;

pub use dir::DirStorage;
pub use index::{newest_page, oldest, summarize, PhotoPage, PhotoSummary};

/// Directory holding the photos, relative to the card root.
pub const PHOTOS_DIR: &str = "photos";

/// Largest sequence a stored name may carry (18 digits). The allocator can
/// always move past it.
pub const MAX_SEQUENCE: u64 = 999_999_999_999_999_999;

/// Name of a stored image, identified by its sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhotoName {
    sequence: u64,
}

impl PhotoName {
    pub fn new(sequence: u64) -> Self {
        Self { sequence }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// File name inside the photos directory.
    pub fn file_name(&self) -> String {
        format!("photo_{:06}.jpg", self.sequence)
    }

    /// Path as seen on the device, e.g. `/photos/photo_000042.jpg`.
    pub fn device_path(&self) -> String {
        format!("/{}/{}", PHOTOS_DIR, self.file_name())
    }

    /// Parse either a bare file name or a device path. Only the canonical
    /// spelling is accepted, so each sequence maps to exactly one name.
    pub fn parse(name: &str) -> Option<Self> {
        static PHOTO_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
        let re = PHOTO_NAME_RE
            .get_or_init(|| regex::Regex::new(r"^(?:/photos/)?photo_(\d{6,18})\.jpg$").unwrap());
        let caps = re.captures(name)?;
        let sequence: u64 = caps.get(1)?.as_str().parse().ok()?;
        let parsed = Self { sequence };
        let bare = name.trim_start_matches("/photos/");
        (bare == parsed.file_name()).then_some(parsed)
    }
}

impl fmt::Display for PhotoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.device_path())
    }
}

/// Capacity figures reported by the platform, when available.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Clone, Debug, Default)]
pub struct MountInfo {
    pub usage: Option<StorageUsage>,
    /// The card had to be formatted before it would mount.
    pub formatted: bool,
}

/// The single removable storage device.
pub trait StorageDevice: Send {
    fn mount(&mut self) -> PipelineResult<MountInfo>;

    fn unmount(&mut self);

    fn is_mounted(&self) -> bool;

    /// Write a photo and return how many bytes reached the device. A short
    /// count is not an error at this layer; the caller decides.
    fn write_photo(&mut self, name: PhotoName, payload: &[u8]) -> PipelineResult<usize>;

    fn read_photo(&mut self, name: PhotoName) -> PipelineResult<Vec<u8>>;

    fn remove_photo(&mut self, name: PhotoName) -> PipelineResult<()>;

    /// Lazily enumerate stored photos, in no particular order.
    fn photos(&mut self) -> PipelineResult<Box<dyn Iterator<Item = PhotoName> + '_>>;

    /// Remove files that are not photos, from the photos directory and the
    /// card root. Returns how many were removed.
    fn remove_stray_files(&mut self) -> PipelineResult<u64>;

    /// Flush pending writes to the card.
    fn sync(&mut self) -> PipelineResult<()>;

    fn usage(&self) -> Option<StorageUsage>;
}
