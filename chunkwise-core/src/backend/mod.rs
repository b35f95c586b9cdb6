//! Execution backends.
//!
//! A [`BackendEngine`] is a long-lived handle on a compute resource. Each
//! parallel call opens one [`BackendSession`] on it, submits its partitions
//! through the session and drops it when done; dropping releases whatever
//! the session holds.
//!
//! Three families are provided:
//!
//! * [`SequentialBackend`] runs every task immediately on the caller's thread.
//! * [`LocalWorkerPool`] runs tasks on a fixed pool of worker threads.
//! * [`ClusterBackend`] talks to a scheduler addressed by name, which runs
//!   every task on a dedicated worker and keeps preloaded objects in a store.

mod cluster;
mod future;
mod pool;
mod sequential;

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::args::ArgValue;
use crate::error::{panic_message, Error, Result};
use crate::profiler::{elapsed_ns, timed, TraceTime};

pub use self::cluster::{ClusterBackend, ClusterScheduler, ObjectRef};
pub use self::future::{FutureCompleter, ProfiledFuture};
pub use self::pool::LocalWorkerPool;
pub use self::sequential::SequentialBackend;

/// Value produced by a task.
pub type TaskOutput = Box<dyn Any + Send>;

/// Unit of work submitted to a session.
pub type Task = Box<dyn FnOnce() -> Result<TaskOutput> + Send>;

/// Scoped submission handle for one parallel call.
///
/// Not meant to be shared between threads. Resources are released on drop.
pub trait BackendSession {
    /// Stages a value once for reuse by many tasks.
    ///
    /// Tasks must pass the returned value through [`resolve_value`] to get
    /// the original back.
    fn preload_value(&mut self, value: ArgValue) -> Result<ArgValue> {
        Ok(value)
    }

    /// Submits a task for asynchronous execution.
    ///
    /// Blocks while the session's concurrency limit is reached.
    fn submit(&mut self, task: Task) -> Result<ProfiledFuture>;
}

/// Shareable handle on a compute resource.
pub trait BackendEngine: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Opens a session for one parallel call.
    fn session(&self) -> Result<Box<dyn BackendSession>>;

    /// Releases engine-owned resources. Calling it twice is harmless.
    fn shutdown(&self);

    /// Whether tasks may submit tasks to this same engine without
    /// deadlocking it.
    fn allows_nested_tasks(&self) -> bool;
}

/// Returns the value a preloaded handle stands for, or the value itself.
pub fn resolve_value(value: &ArgValue) -> Result<ArgValue> {
    match value.downcast_ref::<ObjectRef>() {
        Some(reference) => reference.resolve(),
        None => Ok(value.clone())
    }
}

/// Counting semaphore bounding the in-flight tasks of a session.
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Self {
        Semaphore { permits: Mutex::new(permits), cond: Condvar::new() }
    }

    pub(crate) fn acquire(&self) -> Result<()> {
        let mut permits = self.permits.lock()?;
        while *permits == 0 {
            permits = self.cond.wait(permits)?;
        }
        *permits -= 1;
        Ok(())
    }

    pub(crate) fn release(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|p| p.into_inner());
        *permits += 1;
        self.cond.notify_one();
    }
}

/// Runs `task` the way every concurrent backend does: skip it if canceled,
/// time it, free its permit and complete the future with
/// `overhead + submit + execution + release` nanoseconds.
pub(crate) fn run_profiled(
    task: Task,
    completer: FutureCompleter,
    guard: Arc<Semaphore>,
    submit_duration: TraceTime,
    overhead: TraceTime
) {
    if !completer.set_running() {
        trace!("skipping canceled task");
        guard.release();
        return;
    }

    let (result, function_duration) = timed(|| run_catching(task));

    let release_start = Instant::now();
    guard.release();
    let release_duration = elapsed_ns(release_start);

    let function_duration = if result.is_ok() { function_duration } else { 0 };
    completer.set_result(result, overhead + submit_duration + function_duration + release_duration);
}

/// Runs a task, turning a panic into a task error.
pub(crate) fn run_catching(task: Task) -> Result<TaskOutput> {
    catch_unwind(AssertUnwindSafe(task))
        .unwrap_or_else(|payload| Err(Error::TaskPanicked(panic_message(payload.as_ref()))))
}
