use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::storage::StorageDevice;

/// Mutual exclusion over the whole storage device.
///
/// Every storage operation holds the gate for its full duration. Acquisition
/// is always bounded; a timeout surfaces as `StorageBusy`.
pub struct StorageGate {
    device: Mutex<Box<dyn StorageDevice>>,
}

impl StorageGate {
    pub fn new(device: Box<dyn StorageDevice>) -> Self {
        Self {
            device: Mutex::new(device),
        }
    }

    pub fn acquire(&self, timeout: Duration) -> PipelineResult<StorageGuard<'_>> {
        self.device
            .try_lock_for(timeout)
            .map(|device| StorageGuard { device })
            .ok_or(PipelineError::StorageBusy)
    }

    /// Take the gate only if nobody holds it.
    pub fn try_acquire(&self) -> Option<StorageGuard<'_>> {
        self.device.try_lock().map(|device| StorageGuard { device })
    }
}

/// Proof of holding the storage gate. Compound status updates require one.
pub struct StorageGuard<'a> {
    device: MutexGuard<'a, Box<dyn StorageDevice>>,
}

impl Deref for StorageGuard<'_> {
    type Target = dyn StorageDevice;

    fn deref(&self) -> &Self::Target {
        &**self.device
    }
}

impl DerefMut for StorageGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageSettings;
    use crate::storage::DirStorage;
    use std::sync::Arc;
    use std::time::Instant;

    fn gate() -> StorageGate {
        StorageGate::new(Box::new(DirStorage::new(&StorageSettings::default())))
    }

    #[test]
    fn second_acquire_times_out_as_busy() {
        let gate = gate();
        let _held = gate.acquire(Duration::from_millis(10)).unwrap();
        let started = Instant::now();
        assert!(matches!(
            gate.acquire(Duration::from_millis(50)),
            Err(PipelineError::StorageBusy)
        ));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(gate.try_acquire().is_none());
    }

    #[test]
    fn gate_is_released_on_drop() {
        let gate = Arc::new(gate());
        {
            let guard = gate.acquire(Duration::from_millis(10)).unwrap();
            assert!(!guard.is_mounted());
        }
        assert!(gate.try_acquire().is_some());
    }
}
