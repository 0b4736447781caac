use super::DrainLock;

/// One registered unit of work, released on drop.
///
/// Drop runs on every exit path, including `?` returns and unwinding panics.
#[must_use = "dropping the guard immediately releases the registered unit of work"]
#[derive(Debug)]
pub struct DrainGuard {
    lock: DrainLock,
}

impl DrainGuard {
    pub(super) fn new(lock: DrainLock) -> Self {
        Self { lock }
    }

    /// Coordinator this guard is registered with.
    #[inline]
    pub fn drain_lock(&self) -> &DrainLock {
        &self.lock
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
