//! A bounded, single-worker background pool for eviction tasks.
//!
//! The queue is deliberately small and lossy: eviction is probabilistic
//! and self-correcting (the next write re-samples), so dropping excess
//! tasks under load is preferable to unbounded memory growth or added
//! write-path latency.

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use layered::Service;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::failsafe::Failsafe;

/// Capacity of the background task queue. Once full, [`Executor::submit`]
/// discards the task rather than blocking the caller.
pub const QUEUE_CAPACITY: usize = 100;

/// The tag a panicking or erroring background task is reported under.
pub const ASYNC_TAG: &str = "async";

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A unit of background work: a closure that, when called, produces the
/// future to run. Boxed as `FnOnce` so each task can move its own state
/// in without the executor needing to know its shape.
pub type Task = Box<dyn FnOnce() -> BoxFuture + Send>;

/// The optional per-task host-runtime wrapper — e.g. ensuring a host
/// framework's class-autoloading is active before a task touches
/// application code. Implemented as a [`layered::Service`] so host
/// integrations compose it the same way they compose any other
/// middleware.
pub trait RuntimeWrapper: Service<Task, Out = ()> + Send + Sync + 'static {}
impl<T> RuntimeWrapper for T where T: Service<Task, Out = ()> + Send + Sync + 'static {}

/// The default wrapper: runs the task with no surrounding setup.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRuntime;

impl Service<Task> for NoopRuntime {
    type Out = ();

    async fn execute(&self, task: Task) -> Self::Out {
        task().await;
    }
}

/// The bounded background worker pool described in the execution-layer
/// design: one worker, a capacity-100 queue, discard on overflow.
pub struct Executor<R = NoopRuntime>
where
    R: RuntimeWrapper,
{
    sender: mpsc::Sender<Task>,
    _worker: tokio::task::JoinHandle<()>,
    _runtime: PhantomData<R>,
}

impl<R> std::fmt::Debug for Executor<R>
where
    R: RuntimeWrapper,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").field("queue_capacity", &QUEUE_CAPACITY).finish_non_exhaustive()
    }
}

impl<R> Executor<R>
where
    R: RuntimeWrapper,
{
    /// Starts the single background worker. `runtime` wraps every task
    /// before it runs; `failsafe` receives uncaught task panics tagged
    /// [`ASYNC_TAG`] so they never bring the worker down.
    #[must_use]
    pub fn spawn(runtime: R, failsafe: Failsafe) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Task>(QUEUE_CAPACITY);
        let runtime = Arc::new(runtime);

        let worker = tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                let outcome = AssertUnwindSafe(runtime.execute(task)).catch_unwind().await;
                if outcome.is_err() {
                    let synthetic = Error::Storage(sqlx::Error::Protocol("background task panicked".into()));
                    let _ = failsafe.guard(ASYNC_TAG, (), || async { Err::<(), Error>(synthetic) }).await;
                }
            }
        });

        Self { sender, _worker: worker, _runtime: PhantomData }
    }

    /// Enqueues `task`. Returns `true` if it was accepted, `false` if the
    /// queue was full and the task was discarded.
    pub fn submit(&self, task: Task) -> bool {
        self.sender.try_send(task).is_ok()
    }

    /// Current queue capacity, exposed for tests and diagnostics.
    #[must_use]
    pub fn capacity(&self) -> usize {
        QUEUE_CAPACITY
    }
}
