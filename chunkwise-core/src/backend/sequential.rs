use crate::error::Result;
use crate::profiler::{timed, TraceTime};
use super::{run_catching, BackendEngine, BackendSession, ProfiledFuture, Task};

/// Scheduling overhead not captured by timing the task itself.
const CONSTANT_SCHEDULING_OVERHEAD: TraceTime = 5_000;

/// Runs every submitted task immediately, on the submitting thread.
///
/// Mostly useful for debugging partitioning and combining code.
#[derive(Debug,Clone,Default)]
pub struct SequentialBackend;

impl SequentialBackend {
    /// A new sequential backend. It holds no resources.
    pub fn new() -> Self {
        SequentialBackend
    }
}

struct SequentialSession;

impl BackendSession for SequentialSession {
    fn submit(&mut self, task: Task) -> Result<ProfiledFuture> {
        let (future, completer) = ProfiledFuture::new();
        if !completer.set_running() {
            return Ok(future);
        }
        let (result, duration) = timed(|| run_catching(task));
        let duration = if result.is_ok() { duration } else { 0 };
        completer.set_result(result, CONSTANT_SCHEDULING_OVERHEAD + duration);
        Ok(future)
    }
}

impl BackendEngine for SequentialBackend {
    fn name(&self) -> &str {
        "sequential-in-process"
    }

    fn session(&self) -> Result<Box<dyn BackendSession>> {
        Ok(Box::new(SequentialSession))
    }

    fn shutdown(&self) {}

    fn allows_nested_tasks(&self) -> bool {
        false
    }
}
