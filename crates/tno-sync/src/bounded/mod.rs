//! Bounded fan-out / fan-in over a batch of inputs.
//!
//! [`BoundedRun`] applies a mapping function to every input with at most `concurrency`
//! invocations in flight and returns the outputs in input order. Each call owns its own
//! admission semaphore, so concurrent batches never share a limit. The whole batch is held
//! as a single unit of work on a [`DrainLock`], so a shutdown waits for in-flight batches.
use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, instrument};

use crate::{
    drain::{self, DrainGuard, DrainLock},
    error::{RunError, RunResult},
};

/// Output of one task, tagged with the position of its input.
type Slot<O> = (usize, std::thread::Result<O>);

/// Held by a task while it runs. The batch's drain unit is released only after the caller
/// and every task have dropped their share, even if the batch future itself is dropped.
struct Admission {
    _permit: OwnedSemaphorePermit,
    _batch: Arc<DrainGuard>,
}

/// Bounded batch runner.
#[derive(Debug, Clone)]
pub struct BoundedRun {
    concurrency: usize,
    drain: DrainLock,
}

impl BoundedRun {
    /// Runner with the given limit, registered with the process-wide [`DrainLock`].
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            drain: drain::global().clone(),
        }
    }

    /// Register batches with `drain` instead of the process-wide coordinator.
    #[inline]
    pub fn with_drain_lock(mut self, drain: DrainLock) -> Self {
        self.drain = drain;
        self
    }

    #[inline]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    #[inline]
    pub fn drain_lock(&self) -> &DrainLock {
        &self.drain
    }

    /// Run an async mapping function over `inputs`.
    ///
    /// Returns `outputs` with `outputs[i] == f(inputs[i])`. Blocks until every task has
    /// finished. A panicking task does not stop the others; once all are done the batch
    /// fails with [`RunError::TaskPanicked`].
    #[instrument(
        level = "debug",
        skip_all,
        fields(concurrency = self.concurrency, tasks = tracing::field::Empty)
    )]
    pub async fn run<I, O, F, Fut>(
        &self,
        inputs: impl IntoIterator<Item = I>,
        f: F,
    ) -> RunResult<Vec<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        let f = Arc::new(f);
        self.drive(inputs, move |set, index, input, admission| {
            let f = Arc::clone(&f);
            set.spawn(async move {
                let outcome = AssertUnwindSafe(async move { f(input).await })
                    .catch_unwind()
                    .await;
                drop(admission);
                (index, outcome)
            });
        })
        .await
    }

    /// Same as [`run`](Self::run) for a synchronous mapping function.
    ///
    /// Each invocation runs on tokio's blocking pool, so `f` may do CPU-heavy or
    /// blocking work.
    #[instrument(
        level = "debug",
        skip_all,
        fields(concurrency = self.concurrency, tasks = tracing::field::Empty)
    )]
    pub async fn run_blocking<I, O, F>(
        &self,
        inputs: impl IntoIterator<Item = I>,
        f: F,
    ) -> RunResult<Vec<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> O + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.drive(inputs, move |set, index, input, admission| {
            let f = Arc::clone(&f);
            set.spawn_blocking(move || {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| f(input)));
                drop(admission);
                (index, outcome)
            });
        })
        .await
    }

    async fn drive<I, O, S>(
        &self,
        inputs: impl IntoIterator<Item = I>,
        mut spawn: S,
    ) -> RunResult<Vec<O>>
    where
        O: Send + 'static,
        S: FnMut(&mut JoinSet<Slot<O>>, usize, I, Admission),
    {
        let inputs: Vec<I> = inputs.into_iter().collect();
        let total = inputs.len();
        tracing::Span::current().record("tasks", total);
        if total == 0 {
            return Ok(Vec::new());
        }
        if self.concurrency == 0 {
            return Err(RunError::ZeroConcurrency);
        }

        let batch = Arc::new(self.drain.guard());
        let semaphore = Arc::new(Semaphore::new(self.concurrency.min(Semaphore::MAX_PERMITS)));
        let mut set = JoinSet::new();

        for (index, input) in inputs.into_iter().enumerate() {
            // Admission: a task is spawned only once it holds a permit.
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| RunError::Join(e.to_string()))?;
            let admission = Admission {
                _permit: permit,
                _batch: Arc::clone(&batch),
            };
            spawn(&mut set, index, input, admission);
        }
        debug!(tasks = total, "all tasks admitted");

        let mut slots: Vec<Option<O>> = std::iter::repeat_with(|| None).take(total).collect();
        let mut panicked: Vec<(usize, String)> = Vec::new();
        let mut join_failure: Option<RunError> = None;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(output))) => slots[index] = Some(output),
                Ok((index, Err(payload))) => {
                    let message = panic_message(&*payload);
                    error!(index, %message, "task panicked; the rest of the batch keeps running");
                    panicked.push((index, message));
                }
                Err(e) => {
                    error!(error = %e, "task could not be joined");
                    join_failure.get_or_insert(RunError::from(e));
                }
            }
        }

        if let Some((index, message)) = panicked.iter().min_by_key(|(index, _)| *index).cloned() {
            return Err(RunError::TaskPanicked {
                index,
                panicked: panicked.len(),
                message,
            });
        }
        if let Some(e) = join_failure {
            return Err(e);
        }

        // Every joined task either filled its slot or returned above.
        let outputs: Vec<O> = slots.into_iter().flatten().collect();
        drop(batch);

        debug!(tasks = total, "batch completed");
        Ok(outputs)
    }
}

/// Run `f` over `inputs` with at most `concurrency` invocations in flight.
///
/// Registered with the process-wide [`DrainLock`].
pub async fn run_bounded<I, O, F, Fut>(
    concurrency: usize,
    inputs: impl IntoIterator<Item = I>,
    f: F,
) -> RunResult<Vec<O>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
{
    BoundedRun::new(concurrency).run(inputs, f).await
}

/// Blocking-pool variant of [`run_bounded`].
pub async fn run_bounded_blocking<I, O, F>(
    concurrency: usize,
    inputs: impl IntoIterator<Item = I>,
    f: F,
) -> RunResult<Vec<O>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
{
    BoundedRun::new(concurrency).run_blocking(inputs, f).await
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
