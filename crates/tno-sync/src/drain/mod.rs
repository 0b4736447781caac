//! Shutdown coordination for in-flight background work.
//!
//! A [`DrainLock`] counts registered units of work. Work registers with [`DrainLock::lock`]
//! (or, preferably, [`DrainLock::guard`]) and releases with [`DrainLock::unlock`]. A shutdown
//! routine calls [`DrainLock::wait_for_drain`] to block until every unit has been released or
//! the timeout elapses.
//!
//! ## States
//!
//! ```text
//! Active --start_shutdown()--> ShutdownRequested --count <= 0--> Drained
//! ```
//!
//! A shutdown started with nothing in flight goes straight to `Drained`.
//! The shutdown flag is never cleared. `Drained` is terminal for waiting: later waits return
//! at once, and later registrations are still counted but logged as a warning.
mod guard;
pub use guard::DrainGuard;

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static GLOBAL: OnceLock<DrainLock> = OnceLock::new();

/// Process-wide coordinator, created on first use.
pub fn global() -> &'static DrainLock {
    GLOBAL.get_or_init(DrainLock::new)
}

/// Coordinator lifecycle as observed by [`DrainLock::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Active,
    ShutdownRequested,
    Drained,
}

/// Result of [`DrainLock::wait_for_drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum DrainOutcome {
    /// Every registered unit was released.
    Drained,
    /// The timeout elapsed with `remaining` units still registered.
    TimedOut { remaining: i64 },
}

impl DrainOutcome {
    #[inline]
    pub fn is_drained(&self) -> bool {
        matches!(self, DrainOutcome::Drained)
    }
}

/// Counting shutdown coordinator.
///
/// Clones share the same state. Use [`global`] for the process-wide instance or
/// [`DrainLock::new`] for an isolated one.
#[derive(Debug, Clone, Default)]
pub struct DrainLock {
    inner: Arc<Mutex<DrainInner>>,
}

/// Counter, flag and gate share one mutex so a reader never sees a count from one
/// transition and a flag from another.
#[derive(Debug, Default)]
struct DrainInner {
    pending: i64,
    shutdown: bool,
    drained: bool,
    /// Created by the first waiter that has to block.
    gate: Option<CancellationToken>,
}

impl DrainInner {
    fn mark_drained(&mut self) {
        self.drained = true;
        if let Some(gate) = &self.gate {
            gate.cancel();
        }
    }
}

impl DrainLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same as [`global`].
    #[inline]
    pub fn global() -> &'static DrainLock {
        global()
    }

    // None of the critical sections can panic, so a poisoned mutex still holds consistent state.
    fn inner(&self) -> MutexGuard<'_, DrainInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register one unit of work.
    ///
    /// Always counted. Once shutdown has started this also logs a warning, since new work
    /// is delaying a drain that is already under way.
    pub fn lock(&self) {
        let (pending, shutdown) = {
            let mut inner = self.inner();
            inner.pending += 1;
            (inner.pending, inner.shutdown)
        };

        if shutdown {
            warn!(pending, "shutdown already in progress but new work was registered");
        }
    }

    /// Release one unit of work.
    ///
    /// Every [`lock`](Self::lock) must be paired with exactly one `unlock`. Extra unlocks
    /// drive the count negative, which is tolerated and treated as drained.
    pub fn unlock(&self) {
        let (remaining, shutdown) = {
            let mut inner = self.inner();
            inner.pending -= 1;
            if inner.shutdown && inner.pending <= 0 {
                inner.mark_drained();
            }
            (inner.pending, inner.shutdown)
        };

        if shutdown {
            info!(remaining, "in-flight work finished during shutdown");
            if remaining <= 0 {
                info!("all in-flight work drained");
            }
        }
    }

    /// Register one unit of work and release it when the returned guard drops.
    pub fn guard(&self) -> DrainGuard {
        self.lock();
        DrainGuard::new(self.clone())
    }

    /// Keep one unit registered while `fut` runs.
    pub async fn track<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        let _guard = self.guard();
        fut.await
    }

    /// Spawn `fut` on the tokio runtime, registered for its whole lifetime.
    ///
    /// The unit is registered before the task is spawned and released when the task
    /// completes, panics or is aborted.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.guard();
        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
    }

    /// Current number of registered units. May be negative after unbalanced unlocks.
    pub fn count(&self) -> i64 {
        self.inner().pending
    }

    pub fn is_shutdown_started(&self) -> bool {
        self.inner().shutdown
    }

    pub fn state(&self) -> DrainState {
        let inner = self.inner();
        match (inner.shutdown, inner.drained) {
            (false, _) => DrainState::Active,
            (true, false) => DrainState::ShutdownRequested,
            (true, true) => DrainState::Drained,
        }
    }

    /// Mark shutdown as started. Repeated calls have no further effect.
    ///
    /// With nothing in flight the lock is drained at once.
    pub fn start_shutdown(&self) {
        let (first, pending) = {
            let mut inner = self.inner();
            let first = !inner.shutdown;
            inner.shutdown = true;
            if inner.pending <= 0 {
                inner.mark_drained();
            }
            (first, inner.pending)
        };

        if first {
            info!(pending, "shutdown started");
            if pending <= 0 {
                debug!(pending, "nothing in flight, drained immediately");
            }
        }
    }

    /// Start shutdown and wait until every registered unit is released or `timeout` elapses.
    ///
    /// Never fails: a timeout is reported as [`DrainOutcome::TimedOut`] and the caller
    /// decides whether to force the shutdown.
    pub async fn wait_for_drain(&self, timeout: Duration) -> DrainOutcome {
        self.start_shutdown();

        let (gate, remaining) = {
            let mut inner = self.inner();
            // Idle locks were drained by `start_shutdown`; later unlocks drain under this mutex.
            if inner.drained {
                return DrainOutcome::Drained;
            }
            let gate = inner
                .gate
                .get_or_insert_with(CancellationToken::new)
                .clone();
            (gate, inner.pending)
        };

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        info!(remaining, timeout_ms, "waiting for in-flight work to drain");

        tokio::select! {
            biased;
            _ = gate.cancelled() => DrainOutcome::Drained,
            _ = tokio::time::sleep(timeout) => {
                let remaining = self.count();
                if remaining <= 0 {
                    return DrainOutcome::Drained;
                }
                warn!(remaining, timeout_ms, "timed out waiting for in-flight work to drain");
                DrainOutcome::TimedOut { remaining }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    use tno_observe::capture;
    use tracing::Level;

    fn explode() -> u32 {
        panic!("boom")
    }

    #[test]
    fn counter_tolerates_unbalanced_unlocks() {
        let lock = DrainLock::new();

        lock.lock();
        lock.lock();
        lock.unlock();
        assert_eq!(lock.count(), 1);

        lock.unlock();
        lock.unlock();
        assert_eq!(lock.count(), -1);
    }

    #[test]
    fn clones_share_state() {
        let lock = DrainLock::new();
        let other = lock.clone();

        other.lock();
        assert_eq!(lock.count(), 1);

        lock.start_shutdown();
        assert!(other.is_shutdown_started());
    }

    #[test]
    fn global_is_a_single_instance() {
        assert!(std::ptr::eq(global(), DrainLock::global()));
    }

    #[test]
    fn lock_before_shutdown_is_silent() {
        let (captured, _guard) = capture::install();
        let lock = DrainLock::new();

        lock.lock();
        lock.unlock();

        assert!(captured.events().is_empty());
    }

    #[test]
    fn repeated_start_shutdown_warns_once_per_lock() {
        let (captured, _guard) = capture::install();
        let lock = DrainLock::new();

        lock.start_shutdown();
        lock.start_shutdown();
        assert_eq!(captured.count(Level::WARN), 0);
        assert_eq!(captured.with_message("shutdown started").len(), 1);

        lock.lock();
        assert_eq!(captured.count(Level::WARN), 1);

        lock.lock();
        assert_eq!(captured.count(Level::WARN), 2);
        assert_eq!(lock.count(), 2);
    }

    #[test]
    fn unlock_during_shutdown_reports_remaining() {
        let (captured, _guard) = capture::install();
        let lock = DrainLock::new();

        lock.lock();
        lock.lock();
        lock.start_shutdown();

        lock.unlock();
        let finished = captured.with_message("in-flight work finished during shutdown");
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].field("remaining"), Some("1"));
        assert!(captured.with_message("all in-flight work drained").is_empty());

        lock.unlock();
        assert_eq!(captured.with_message("all in-flight work drained").len(), 1);
        assert_eq!(lock.state(), DrainState::Drained);
    }

    #[test]
    fn state_transitions() {
        let lock = DrainLock::new();
        assert_eq!(lock.state(), DrainState::Active);

        lock.lock();
        lock.start_shutdown();
        assert_eq!(lock.state(), DrainState::ShutdownRequested);

        lock.unlock();
        assert_eq!(lock.state(), DrainState::Drained);

        // The flag is never reset.
        lock.lock();
        assert_eq!(lock.state(), DrainState::Drained);
        assert!(lock.is_shutdown_started());
    }

    #[test]
    fn start_shutdown_when_idle_is_drained() {
        let (captured, _guard) = capture::install();
        let lock = DrainLock::new();

        lock.start_shutdown();

        assert_eq!(lock.count(), 0);
        assert_eq!(lock.state(), DrainState::Drained);
        assert_eq!(
            captured
                .with_message("nothing in flight, drained immediately")
                .len(),
            1
        );

        let unbalanced = DrainLock::new();
        unbalanced.unlock();
        unbalanced.start_shutdown();
        assert_eq!(unbalanced.state(), DrainState::Drained);
    }

    #[test]
    fn guard_releases_on_early_return() {
        fn work(lock: &DrainLock, fail: bool) -> Result<(), &'static str> {
            let _guard = lock.guard();
            if fail {
                return Err("early");
            }
            Ok(())
        }

        let lock = DrainLock::new();
        assert!(work(&lock, true).is_err());
        assert!(work(&lock, false).is_ok());
        assert_eq!(lock.count(), 0);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let lock = DrainLock::new();

        let started = Instant::now();
        let outcome = lock.wait_for_drain(Duration::from_secs(5)).await;

        assert_eq!(outcome, DrainOutcome::Drained);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(lock.state(), DrainState::Drained);
    }

    #[tokio::test]
    async fn unbounded_timeout_is_logged_saturated() {
        let (captured, _guard) = capture::install();
        let lock = DrainLock::new();
        lock.lock();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.wait_for_drain(Duration::MAX).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiting = captured.with_message("waiting for in-flight work to drain");
        assert_eq!(waiting.len(), 1);
        let expected = u64::MAX.to_string();
        assert_eq!(waiting[0].field("timeout_ms"), Some(expected.as_str()));

        lock.unlock();
        assert_eq!(waiter.await.unwrap(), DrainOutcome::Drained);
    }

    #[tokio::test]
    async fn wait_treats_negative_count_as_drained() {
        let lock = DrainLock::new();
        lock.unlock();

        let outcome = lock.wait_for_drain(Duration::from_secs(5)).await;
        assert!(outcome.is_drained());
        assert_eq!(lock.count(), -1);
    }

    #[tokio::test]
    async fn unlock_releases_blocked_waiter() {
        let lock = DrainLock::new();
        lock.lock();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.wait_for_drain(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lock.state(), DrainState::ShutdownRequested);

        let released = Instant::now();
        lock.unlock();
        let outcome = waiter.await.unwrap();

        assert_eq!(outcome, DrainOutcome::Drained);
        assert!(released.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn unlock_releases_every_waiter() {
        let lock = DrainLock::new();
        lock.lock();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                tokio::spawn(async move { lock.wait_for_drain(Duration::from_secs(5)).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.unlock();

        for waiter in waiters {
            assert!(waiter.await.unwrap().is_drained());
        }
    }

    #[tokio::test]
    async fn wait_times_out_with_warning() {
        let (captured, _guard) = capture::install();
        let lock = DrainLock::new();
        lock.lock();

        let started = Instant::now();
        let outcome = lock.wait_for_drain(Duration::from_millis(200)).await;
        let elapsed = started.elapsed();

        assert_eq!(outcome, DrainOutcome::TimedOut { remaining: 1 });
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));

        let warned = captured.with_message("timed out waiting for in-flight work to drain");
        assert_eq!(warned.len(), 1);
        assert_eq!(warned[0].level, Level::WARN);
        assert_eq!(warned[0].field("remaining"), Some("1"));
        assert_eq!(lock.count(), 1);
    }

    #[tokio::test]
    async fn wait_after_drain_returns_immediately() {
        let lock = DrainLock::new();
        assert!(lock.wait_for_drain(Duration::from_secs(5)).await.is_drained());

        lock.lock();
        let started = Instant::now();
        assert!(lock.wait_for_drain(Duration::from_secs(5)).await.is_drained());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn track_holds_a_unit_while_running() {
        let lock = DrainLock::new();

        let seen = lock.track(async { lock.count() }).await;

        assert_eq!(seen, 1);
        assert_eq!(lock.count(), 0);
    }

    #[tokio::test]
    async fn spawned_work_is_registered_until_done() {
        let lock = DrainLock::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = lock.spawn(async move {
            let _ = rx.await;
        });
        assert_eq!(lock.count(), 1);

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(lock.count(), 0);
    }

    #[tokio::test]
    async fn spawned_work_releases_on_panic() {
        let lock = DrainLock::new();

        let handle = lock.spawn(async { explode() });

        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(lock.count(), 0);
    }
}
