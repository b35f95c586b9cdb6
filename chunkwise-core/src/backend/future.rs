use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::profiler::TraceTime;
use super::TaskOutput;

enum State {
    Pending,
    Running,
    Done(Result<TaskOutput>, TraceTime),
    // Result already handed out
    Consumed(TraceTime),
    Canceled
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar
}

impl Shared {
    fn lock(&self) -> MutexGuard<State> {
        // State transitions never panic while holding the lock
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Handle on an asynchronously running task, completed with the task's
/// result and its profiled duration.
///
/// The duration is set together with the result, under the same lock, so
/// any observer that sees the task done also sees its duration.
pub struct ProfiledFuture {
    shared: Arc<Shared>
}

/// Executor side of a [`ProfiledFuture`].
///
/// Dropping it without completing fails the future with a backend error.
pub struct FutureCompleter {
    shared: Arc<Shared>
}

impl ProfiledFuture {
    /// Creates a pending future and the completer that resolves it.
    pub fn new() -> (ProfiledFuture, FutureCompleter) {
        let shared = Arc::new(Shared { state: Mutex::new(State::Pending), cond: Condvar::new() });
        (ProfiledFuture { shared: shared.clone() }, FutureCompleter { shared })
    }

    /// True once the task finished, failed or was canceled.
    pub fn done(&self) -> bool {
        !matches!(*self.shared.lock(), State::Pending | State::Running)
    }

    /// True if the task was canceled before it started.
    pub fn cancelled(&self) -> bool {
        matches!(*self.shared.lock(), State::Canceled)
    }

    /// Cancels the task if it has not started yet.
    ///
    /// Returns true if the future is canceled after the call.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.lock();
        match *state {
            State::Pending => {
                *state = State::Canceled;
                self.shared.cond.notify_all();
                true
            },
            State::Canceled => true,
            _ => false
        }
    }

    fn wait_done(&self, timeout: Option<Duration>) -> Result<MutexGuard<State>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();
        while matches!(*state, State::Pending | State::Running) {
            state = match deadline {
                None => self.shared.cond.wait(state).unwrap_or_else(|p| p.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    self.shared.cond.wait_timeout(state, deadline - now)
                        .unwrap_or_else(|p| p.into_inner()).0
                }
            };
        }
        Ok(state)
    }

    /// Blocks until the task is done or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.wait_done(timeout).map(|_| ())
    }

    /// Profiled duration of the task, once done.
    pub fn duration(&self, timeout: Option<Duration>) -> Result<Option<TraceTime>> {
        let state = self.wait_done(timeout)?;
        Ok(match *state {
            State::Done(_, d) | State::Consumed(d) => Some(d),
            _ => None
        })
    }

    /// Waits for the task and takes its result along with its duration.
    ///
    /// The task's own error is returned as is; a canceled task yields
    /// [`Error::Canceled`].
    pub fn result_and_duration(self, timeout: Option<Duration>) -> Result<(TaskOutput, TraceTime)> {
        let mut state = self.wait_done(timeout)?;
        match std::mem::replace(&mut *state, State::Canceled) {
            State::Done(result, duration) => {
                *state = State::Consumed(duration);
                result.map(|r| (r, duration))
            },
            State::Consumed(d) => {
                *state = State::Consumed(d);
                Err(Error::backend("future result was already consumed"))
            },
            _ => Err(Error::Canceled)
        }
    }
}

impl FutureCompleter {
    /// Marks the task as started. Returns false if it was canceled, in which
    /// case it must not run.
    pub fn set_running(&self) -> bool {
        let mut state = self.shared.lock();
        match *state {
            State::Pending => {
                *state = State::Running;
                true
            },
            _ => false
        }
    }

    /// Completes the future with the task's outcome and duration.
    pub fn set_result(self, result: Result<TaskOutput>, duration: TraceTime) {
        self.complete(result, duration);
    }

    fn complete(&self, result: Result<TaskOutput>, duration: TraceTime) {
        let mut state = self.shared.lock();
        if matches!(*state, State::Pending | State::Running) {
            *state = State::Done(result, duration);
            self.shared.cond.notify_all();
        }
    }
}

impl Drop for FutureCompleter {
    fn drop(&mut self) {
        self.complete(Err(Error::backend("task was dropped before completion")), 0);
    }
}
