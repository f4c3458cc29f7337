use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Exclusive claim on the sweep hardware, shared by every manager and probe
/// wired to the same device.
#[derive(Clone, Default)]
pub struct DeviceLock {
    inner: Arc<Mutex<()>>,
}

/// Held for as long as a session or probe owns the device.
pub struct DeviceLease {
    _guard: OwnedMutexGuard<()>,
}

impl DeviceLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<DeviceLease> {
        self.inner
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| DeviceLease { _guard: guard })
    }

    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_lease_at_a_time() {
        let lock = DeviceLock::new();
        let shared = lock.clone();
        let lease = lock.try_acquire().unwrap();
        assert!(shared.try_acquire().is_none());
        assert!(shared.is_held());
        drop(lease);
        assert!(shared.try_acquire().is_some());
    }
}
