use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::args::{ArgValue, NamedArguments};
use crate::backend::{resolve_value, BackendEngine, BackendSession, ProfiledFuture, Task, TaskOutput};
use crate::context;
use crate::error::{panic_message, BoxError, Error, Result};
use crate::profiler::TraceTime;

/// User function wrapped by a parallel function.
pub type WrappedFunction<R> = Arc<dyn Fn(&NamedArguments) -> std::result::Result<R, BoxError> + Send + Sync>;

/// Wraps a closure over named arguments into a [`WrappedFunction`].
pub fn wrap_function<R, F>(f: F) -> WrappedFunction<R>
        where F: Fn(&NamedArguments) -> std::result::Result<R, BoxError> + Send + Sync + 'static {
    Arc::new(f)
}

/// Calls `function`, turning both its errors and its panics into task errors.
pub fn call_function<R>(function: &WrappedFunction<R>, args: &NamedArguments) -> Result<R> {
    match catch_unwind(AssertUnwindSafe(|| function(args))) {
        Ok(Ok(r)) => Ok(r),
        Ok(Err(e)) => Err(Error::Task(e)),
        Err(payload) => Err(Error::TaskPanicked(panic_message(payload.as_ref())))
    }
}

/// Runs the function on one partition the way a worker does.
///
/// The worker marker is set for the whole call, and `nested_backend`, if
/// any, becomes the current backend so the function may issue parallel
/// calls of its own.
pub fn run_function_in_worker<R>(
    function: &WrappedFunction<R>,
    non_partitioned: &NamedArguments,
    partition: &NamedArguments,
    nested_backend: Option<Arc<dyn BackendEngine>>
) -> Result<R> {
    let merged = non_partitioned.merge(partition);
    let _worker = context::enter_worker(nested_backend);
    call_function(function, &merged)
}

/// Builds the backend task for one partition.
///
/// `preloaded` is the session's handle on the non-partitioned arguments.
pub(crate) fn partition_task<R: Send + 'static>(
    function: WrappedFunction<R>,
    preloaded: ArgValue,
    partition: NamedArguments,
    nested_backend: Option<Arc<dyn BackendEngine>>
) -> Task {
    Box::new(move || {
        let resolved = resolve_value(&preloaded)?;
        let non_partitioned = resolved.downcast_ref::<NamedArguments>()
            .ok_or_else(|| Error::backend("preloaded value does not hold call arguments"))?;
        let r = run_function_in_worker(&function, non_partitioned, &partition, nested_backend)?;
        Ok(Box::new(r) as TaskOutput)
    })
}

/// Session a stream submits to, owned or borrowed from the caller.
pub(crate) enum SessionHandle<'s> {
    Owned(Box<dyn BackendSession>),
    Borrowed(&'s mut dyn BackendSession)
}

impl <'s> SessionHandle<'s> {
    fn get(&mut self) -> &mut dyn BackendSession {
        match self {
            SessionHandle::Owned(session) => session.as_mut(),
            SessionHandle::Borrowed(session) => &mut **session
        }
    }
}

/// Submits tasks lazily and yields their results in submission order.
///
/// Before pulling the next task, every finished future at the head of the
/// in-flight queue is yielded. Once the tasks are exhausted the remaining
/// futures are awaited in order. The first error, whether from building a
/// task, submitting it or running it, cancels every future still in flight
/// and ends the stream. Dropping the stream cancels them as well.
pub(crate) struct SubmissionStream<'s, I, T, R> {
    session: SessionHandle<'s>,
    tasks: I,
    in_flight: VecDeque<(ProfiledFuture, T)>,
    deadline: Option<Instant>,
    finished: bool,
    _result: PhantomData<fn() -> R>
}

impl <'s, I, T, R> SubmissionStream<'s, I, T, R>
        where I: Iterator<Item = Result<(Task, T)>>,
              R: 'static {
    pub(crate) fn new(session: SessionHandle<'s>, tasks: I, timeout: Option<Duration>) -> Self {
        SubmissionStream {
            session,
            tasks,
            in_flight: VecDeque::new(),
            deadline: timeout.map(|t| Instant::now() + t),
            finished: false,
            _result: PhantomData
        }
    }

    fn fail(&mut self, e: Error) -> Option<Result<(R, T, TraceTime)>> {
        self.finished = true;
        self.cancel_all();
        Some(Err(e))
    }

    fn cancel_all(&mut self) {
        if !self.in_flight.is_empty() {
            debug!("canceling {} in-flight task(s)", self.in_flight.len());
        }
        for (future, _) in self.in_flight.drain(..) {
            future.cancel();
        }
    }

    fn pop_head(&mut self) -> Option<Result<(R, T, TraceTime)>> {
        let (future, tag) = self.in_flight.pop_front()?;
        let timeout = self.deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let outcome = future.result_and_duration(timeout).and_then(|(output, duration)| {
            output.downcast::<R>()
                .map(|r| (*r, tag, duration))
                .map_err(|_| Error::backend("task returned a value of an unexpected type"))
        });
        match outcome {
            Ok(item) => Some(Ok(item)),
            Err(e) => self.fail(e)
        }
    }
}

impl <'s, I, T, R> Iterator for SubmissionStream<'s, I, T, R>
        where I: Iterator<Item = Result<(Task, T)>>,
              R: 'static {
    type Item = Result<(R, T, TraceTime)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            if self.in_flight.front().map(|(f, _)| f.done()).unwrap_or(false) {
                return self.pop_head();
            }
            match self.tasks.next() {
                Some(Ok((task, tag))) => match self.session.get().submit(task) {
                    Ok(future) => {
                        trace!("submitted task, {} in flight", self.in_flight.len() + 1);
                        self.in_flight.push_back((future, tag));
                    },
                    Err(e) => return self.fail(e)
                },
                Some(Err(e)) => return self.fail(e),
                None if self.in_flight.is_empty() => {
                    self.finished = true;
                    return None;
                },
                None => return self.pop_head()
            }
        }
    }
}

impl <'s, I, T, R> Drop for SubmissionStream<'s, I, T, R> {
    fn drop(&mut self) {
        for (future, _) in self.in_flight.drain(..) {
            future.cancel();
        }
    }
}

#[cfg(test)]
mod task_test {
    use super::*;
    use crate::backend::{LocalWorkerPool, SequentialBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn double() -> WrappedFunction<i64> {
        wrap_function(|args: &NamedArguments| Ok(*args.get_as::<i64>("x")? * 2))
    }

    fn named(name: &str, v: i64) -> NamedArguments {
        NamedArguments::from_parts(vec![(name.to_owned(), ArgValue::new(v))], Default::default(), Vec::new()).unwrap()
    }

    #[test]
    fn test_call_function_captures_panics() {
        let f: WrappedFunction<i64> = wrap_function(|_: &NamedArguments| panic!("bad partition"));
        assert!(matches!(call_function(&f, &NamedArguments::new()), Err(Error::TaskPanicked(_))));
        let f: WrappedFunction<i64> = wrap_function(|_: &NamedArguments| Err("nope".into()));
        assert!(matches!(call_function(&f, &NamedArguments::new()), Err(Error::Task(_))));
    }

    #[test]
    fn test_worker_marker_is_scoped() {
        let f: WrappedFunction<bool> = wrap_function(|_: &NamedArguments| Ok(context::in_worker()));
        assert!(!context::in_worker());
        assert!(run_function_in_worker(&f, &NamedArguments::new(), &NamedArguments::new(), None).unwrap());
        assert!(!context::in_worker());
    }

    #[test]
    fn test_partition_task_merges_arguments() {
        let f: WrappedFunction<i64> = wrap_function(|args: &NamedArguments| {
            Ok(*args.get_as::<i64>("x")? + *args.get_as::<i64>("y")?)
        });
        let task = partition_task(f, ArgValue::new(named("y", 10)), named("x", 5), None);
        let out = task().unwrap();
        assert_eq!(out.downcast_ref::<i64>(), Some(&15));
    }

    #[test]
    fn test_stream_keeps_submission_order() {
        let pool = LocalWorkerPool::new(3, false).unwrap();
        let f = double();
        let tasks = (0..20i64).map(|i| {
            let task = partition_task(f.clone(), ArgValue::new(NamedArguments::new()), named("x", i), None);
            Ok((task, i))
        });
        let stream: SubmissionStream<_, i64, i64> =
            SubmissionStream::new(SessionHandle::Owned(pool.session().unwrap()), tasks, None);
        let out: Vec<(i64, i64)> = stream.map(|r| r.map(|(v, tag, _)| (v, tag)).unwrap()).collect();
        assert_eq!(out, (0..20i64).map(|i| (i * 2, i)).collect::<Vec<_>>());
    }

    #[test]
    fn test_stream_stops_on_first_error() {
        let backend = SequentialBackend::new();
        let mut session = backend.session().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let tasks = (0..10usize).map(move |i| {
            let c = c.clone();
            let task: Task = Box::new(move || {
                if i == 4 {
                    return Err(Error::task("fifth task failed"));
                }
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(i) as TaskOutput)
            });
            Ok((task, ()))
        });
        let results: Vec<Result<(usize, (), TraceTime)>> =
            SubmissionStream::new(SessionHandle::Borrowed(session.as_mut()), tasks, None).collect();
        assert_eq!(results.len(), 5);
        assert!(results[4].is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
