//! One task per item, without partitioning or size estimation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendSession, Task, TaskOutput};
use crate::context;
use crate::error::{panic_message, BoxError, Error, Result};
use crate::profiler::{timed, TraceTime};
use crate::task::{SessionHandle, SubmissionStream};

/// Streamed results of a parallel map.
pub type MapResults<'s, R> = Box<dyn Iterator<Item = Result<R>> + 's>;

/// Streamed results of a timed parallel map.
pub type TimedMapResults<'s, R> = Box<dyn Iterator<Item = Result<(R, TraceTime)>> + 's>;

fn call_item<A, R, F>(func: &F, item: A) -> Result<R>
        where F: Fn(A) -> std::result::Result<R, BoxError> {
    match catch_unwind(AssertUnwindSafe(|| func(item))) {
        Ok(r) => r.map_err(Error::Task),
        Err(payload) => Err(Error::TaskPanicked(panic_message(payload.as_ref())))
    }
}

/// Like [`parallel_map`], also yielding every task's profiled duration,
/// scheduling included.
///
/// With `timeout`, waiting for results fails with [`Error::Timeout`] once
/// that much time passed since the call.
pub fn parallel_timed_map<'s, A, R, F, I>(
    func: F,
    items: I,
    session: Option<&'s mut dyn BackendSession>,
    timeout: Option<Duration>
) -> Result<TimedMapResults<'s, R>>
        where F: Fn(A) -> std::result::Result<R, BoxError> + Send + Sync + 'static,
              A: Send + 'static,
              R: Send + 'static,
              I: IntoIterator<Item = A>,
              I::IntoIter: 's {
    let session = match session {
        Some(session) => SessionHandle::Borrowed(session),
        None => match context::current_backend() {
            Some(backend) => SessionHandle::Owned(backend.session()?),
            None => {
                warn!("no parallel backend engine set, running the map sequentially");
                return Ok(Box::new(items.into_iter().map(move |item| {
                    let (r, duration) = timed(|| call_item(&func, item));
                    r.map(|r| (r, duration))
                })));
            }
        }
    };

    let func = Arc::new(func);
    let tasks = items.into_iter().map(move |item| {
        let func = func.clone();
        let task: Task = Box::new(move || call_item(func.as_ref(), item).map(|r| Box::new(r) as TaskOutput));
        Ok((task, ()))
    });
    let stream = SubmissionStream::new(session, tasks, timeout);
    Ok(Box::new(stream.map(|r| r.map(|(r, _, duration)| (r, duration)))))
}

/// Applies `func` to every item on the current backend, or on `session` if
/// given, and streams the results back in item order.
///
/// Items are consumed lazily as results are read. The first failure cancels
/// the tasks still in flight and ends the stream.
///
/// ```
/// use chunkwise::functions::parallel_map;
///
/// let roots: Vec<f64> = parallel_map(|x: f64| Ok(x.sqrt()), vec![4.0, 9.0, 16.0], None, None)
///     .unwrap()
///     .collect::<Result<_, _>>()
///     .unwrap();
/// assert_eq!(roots, vec![2.0, 3.0, 4.0]);
/// ```
pub fn parallel_map<'s, A, R, F, I>(
    func: F,
    items: I,
    session: Option<&'s mut dyn BackendSession>,
    timeout: Option<Duration>
) -> Result<MapResults<'s, R>>
        where F: Fn(A) -> std::result::Result<R, BoxError> + Send + Sync + 'static,
              A: Send + 'static,
              R: Send + 'static,
              I: IntoIterator<Item = A>,
              I::IntoIter: 's {
    let results = parallel_timed_map(func, items, session, timeout)?;
    Ok(Box::new(results.map(|r| r.map(|(r, _)| r))))
}
