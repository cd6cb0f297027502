//! Filesystem-backed storage device.
//!
//! `DirStorage` treats a directory as the mount point of the removable card.
//! Mounting verifies the card is present and writable (a probe file is
//! written, read back and removed) and creates the photos directory. If the
//! card vanishes underneath a mounted device, the next access reports
//! `StorageUnavailable` and the device considers itself unmounted.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::{MountInfo, PhotoName, StorageDevice, StorageUsage, PHOTOS_DIR};
use crate::config::StorageSettings;
use crate::error::{PipelineError, PipelineResult};

const PROBE_FILE: &str = ".mount_probe";
const PROBE_CONTENT: &[u8] = b"timelapse-kernel mount probe\n";

pub struct DirStorage {
    root: PathBuf,
    format_if_mount_failed: bool,
    mounted: bool,
}

impl DirStorage {
    pub fn new(settings: &StorageSettings) -> Self {
        Self {
            root: settings.root.clone(),
            format_if_mount_failed: settings.format_if_mount_failed,
            mounted: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn photos_dir(&self) -> PathBuf {
        self.root.join(PHOTOS_DIR)
    }

    fn photo_path(&self, name: PhotoName) -> PathBuf {
        self.photos_dir().join(name.file_name())
    }

    fn ensure_mounted(&mut self) -> PipelineResult<()> {
        if !self.mounted {
            return Err(PipelineError::StorageUnavailable(
                "storage not mounted".to_string(),
            ));
        }
        if !self.photos_dir().is_dir() {
            self.mounted = false;
            return Err(PipelineError::StorageUnavailable(format!(
                "{} disappeared",
                self.photos_dir().display()
            )));
        }
        Ok(())
    }

    /// Fold an I/O error into the taxonomy: a vanished path means the card
    /// went away.
    fn classify(&mut self, err: std::io::Error) -> PipelineError {
        if err.kind() == ErrorKind::NotFound && !self.root.is_dir() {
            self.mounted = false;
            return PipelineError::StorageUnavailable(format!(
                "card at {} is gone",
                self.root.display()
            ));
        }
        PipelineError::Io(err)
    }

    fn probe(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.photos_dir())?;
        let probe = self.root.join(PROBE_FILE);
        fs::write(&probe, PROBE_CONTENT)?;
        let read_back = fs::read(&probe);
        fs::remove_file(&probe)?;
        if read_back? != PROBE_CONTENT {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                "mount probe read back different bytes",
            ));
        }
        Ok(())
    }

    /// Wipe the card.
    fn format(&self) -> std::io::Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

impl StorageDevice for DirStorage {
    fn mount(&mut self) -> PipelineResult<MountInfo> {
        self.mounted = false;
        if !self.root.is_dir() {
            return Err(PipelineError::StorageUnavailable(format!(
                "no card at {}",
                self.root.display()
            )));
        }

        let mut formatted = false;
        if let Err(err) = self.probe() {
            if !self.format_if_mount_failed {
                return Err(PipelineError::StorageUnavailable(format!(
                    "mount probe failed on {}: {}",
                    self.root.display(),
                    err
                )));
            }
            log::warn!(
                "DirStorage: mount probe failed on {} ({}), formatting",
                self.root.display(),
                err
            );
            self.format()
                .and_then(|_| self.probe())
                .map_err(|err| {
                    PipelineError::StorageUnavailable(format!(
                        "mount failed after format on {}: {}",
                        self.root.display(),
                        err
                    ))
                })?;
            formatted = true;
        }

        self.mounted = true;
        let usage = self.usage();
        if let Some(usage) = usage {
            log::info!(
                "DirStorage: mounted {} ({} MB total, {} MB free)",
                self.root.display(),
                usage.total_bytes / (1024 * 1024),
                usage.free_bytes / (1024 * 1024)
            );
        } else {
            log::info!("DirStorage: mounted {}", self.root.display());
        }
        Ok(MountInfo { usage, formatted })
    }

    fn unmount(&mut self) {
        if self.mounted {
            log::info!("DirStorage: unmounted {}", self.root.display());
        }
        self.mounted = false;
    }

    fn is_mounted(&self) -> bool {
        self.mounted
    }

    fn write_photo(&mut self, name: PhotoName, payload: &[u8]) -> PipelineResult<usize> {
        self.ensure_mounted()?;
        let path = self.photo_path(name);
        let mut file = File::create(&path).map_err(|err| self.classify(err))?;

        let mut written = 0usize;
        while written < payload.len() {
            match file.write(&payload[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::warn!("DirStorage: write to {} stopped: {}", path.display(), err);
                    break;
                }
            }
        }
        if written == payload.len() {
            file.sync_data().map_err(|err| self.classify(err))?;
        }
        Ok(written)
    }

    fn read_photo(&mut self, name: PhotoName) -> PipelineResult<Vec<u8>> {
        self.ensure_mounted()?;
        match fs::read(self.photo_path(name)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound && self.root.is_dir() => {
                Err(PipelineError::PhotoNotFound(name.file_name()))
            }
            Err(err) => Err(self.classify(err)),
        }
    }

    fn remove_photo(&mut self, name: PhotoName) -> PipelineResult<()> {
        self.ensure_mounted()?;
        match fs::remove_file(self.photo_path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound && self.root.is_dir() => {
                Err(PipelineError::PhotoNotFound(name.file_name()))
            }
            Err(err) => Err(self.classify(err)),
        }
    }

    fn photos(&mut self) -> PipelineResult<Box<dyn Iterator<Item = PhotoName> + '_>> {
        self.ensure_mounted()?;
        let entries = fs::read_dir(self.photos_dir()).map_err(|err| self.classify(err))?;
        let iter = entries.filter_map(|entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("DirStorage: skipping unreadable entry: {}", err);
                    return None;
                }
            };
            if !entry.file_type().ok()?.is_file() {
                return None;
            }
            PhotoName::parse(entry.file_name().to_str()?)
        });
        Ok(Box::new(iter))
    }

    fn remove_stray_files(&mut self) -> PipelineResult<u64> {
        self.ensure_mounted()?;
        let mut removed = 0u64;
        for dir in [self.root.clone(), self.photos_dir()] {
            let entries = fs::read_dir(&dir).map_err(|err| self.classify(err))?;
            for entry in entries {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let is_photo = dir != self.root
                    && entry
                        .file_name()
                        .to_str()
                        .and_then(PhotoName::parse)
                        .is_some();
                if !is_photo {
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn sync(&mut self) -> PipelineResult<()> {
        self.ensure_mounted()?;
        let dir = File::open(self.photos_dir()).map_err(|err| self.classify(err))?;
        dir.sync_all()?;
        Ok(())
    }

    fn usage(&self) -> Option<StorageUsage> {
        filesystem_usage(&self.root)
    }
}

#[cfg(target_os = "linux")]
fn filesystem_usage(path: &Path) -> Option<StorageUsage> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let block = stat.f_frsize as u64;
    Some(StorageUsage {
        total_bytes: stat.f_blocks as u64 * block,
        free_bytes: stat.f_bavail as u64 * block,
    })
}

#[cfg(not(target_os = "linux"))]
fn filesystem_usage(_path: &Path) -> Option<StorageUsage> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn storage_at(root: &Path) -> DirStorage {
        DirStorage::new(&StorageSettings {
            root: root.to_path_buf(),
            ..StorageSettings::default()
        })
    }

    #[test]
    fn mount_creates_photos_dir_and_cleans_probe() -> PipelineResult<()> {
        let dir = tempdir()?;
        let mut storage = storage_at(dir.path());
        storage.mount()?;
        assert!(storage.is_mounted());
        assert!(dir.path().join(PHOTOS_DIR).is_dir());
        assert!(!dir.path().join(PROBE_FILE).exists());
        Ok(())
    }

    #[test]
    fn mount_fails_without_card() {
        let dir = tempdir().unwrap();
        let mut storage = storage_at(&dir.path().join("missing"));
        assert!(matches!(
            storage.mount(),
            Err(PipelineError::StorageUnavailable(_))
        ));
        assert!(!storage.is_mounted());
    }

    #[test]
    fn written_photo_reads_back_identically() -> PipelineResult<()> {
        let dir = tempdir()?;
        let mut storage = storage_at(dir.path());
        storage.mount()?;

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let name = PhotoName::new(1);
        let written = storage.write_photo(name, &payload)?;
        assert_eq!(written, payload.len());
        assert_eq!(storage.read_photo(name)?, payload);
        Ok(())
    }

    #[test]
    fn unmounted_device_refuses_access() -> PipelineResult<()> {
        let dir = tempdir()?;
        let mut storage = storage_at(dir.path());
        storage.mount()?;
        storage.unmount();
        assert!(matches!(
            storage.write_photo(PhotoName::new(1), b"x"),
            Err(PipelineError::StorageUnavailable(_))
        ));
        Ok(())
    }

    #[test]
    fn vanished_card_unmounts_device() -> PipelineResult<()> {
        let dir = tempdir()?;
        let card = dir.path().join("card");
        fs::create_dir(&card)?;
        let mut storage = storage_at(&card);
        storage.mount()?;
        fs::remove_dir_all(&card)?;

        assert!(matches!(
            storage.write_photo(PhotoName::new(1), b"x"),
            Err(PipelineError::StorageUnavailable(_))
        ));
        assert!(!storage.is_mounted());
        Ok(())
    }

    #[test]
    fn enumerates_only_photos_and_removes_strays() -> PipelineResult<()> {
        let dir = tempdir()?;
        let mut storage = storage_at(dir.path());
        storage.mount()?;
        storage.write_photo(PhotoName::new(2), b"a")?;
        storage.write_photo(PhotoName::new(5), b"b")?;
        fs::write(dir.path().join(PHOTOS_DIR).join("notes.txt"), b"x")?;
        fs::write(dir.path().join("hello.txt"), b"x")?;

        let mut found: Vec<_> = storage.photos()?.collect();
        found.sort();
        assert_eq!(found, vec![PhotoName::new(2), PhotoName::new(5)]);

        assert_eq!(storage.remove_stray_files()?, 2);
        assert_eq!(storage.photos()?.count(), 2);
        assert!(!dir.path().join("hello.txt").exists());
        Ok(())
    }

    #[test]
    fn removing_missing_photo_reports_not_found() -> PipelineResult<()> {
        let dir = tempdir()?;
        let mut storage = storage_at(dir.path());
        storage.mount()?;
        assert!(matches!(
            storage.remove_photo(PhotoName::new(9)),
            Err(PipelineError::PhotoNotFound(_))
        ));
        Ok(())
    }
}
