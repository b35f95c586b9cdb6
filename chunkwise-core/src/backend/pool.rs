use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use jobpool::JobPool;

use crate::error::{Error, Result};
use crate::profiler::{elapsed_ns, TraceTime};
use super::{run_profiled, BackendEngine, BackendSession, ProfiledFuture, Semaphore, Task};

const CONSTANT_SCHEDULING_OVERHEAD: TraceTime = 1_500_000;

type Job = Box<dyn FnOnce() + Send>;

enum Message {
    Run(Job),
    Stop
}

/// Fixed-size pool of worker threads.
///
/// A dispatcher thread owns the [`JobPool`] and feeds it the jobs sessions
/// send over a channel. Each session may have at most `max_workers` tasks in
/// flight.
pub struct LocalWorkerPool {
    max_workers: usize,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>
}

impl LocalWorkerPool {
    /// Starts a pool of `max_workers` threads.
    ///
    /// Tasks are closures over in-memory values, so they cannot be shipped
    /// to worker processes: `is_process_based` must be false.
    pub fn new(max_workers: usize, is_process_based: bool) -> Result<Self> {
        if is_process_based {
            return Err(Error::Config(
                "process-based worker pools are not supported, tasks run on worker threads".into()));
        }
        if max_workers == 0 {
            return Err(Error::Config("a worker pool needs at least one worker".into()));
        }

        let (tx, rx) = mpsc::channel::<Message>();
        let dispatcher = thread::Builder::new()
            .name("chunkwise-pool-dispatcher".into())
            .spawn(move || {
                let mut pool = JobPool::new(max_workers);
                for message in rx {
                    match message {
                        Message::Run(job) => pool.queue(move || job()),
                        Message::Stop => break
                    }
                }
                pool.shutdown();
                debug!("worker pool dispatcher stopped");
            })?;

        debug!("started a worker pool of {} threads", max_workers);
        Ok(LocalWorkerPool {
            max_workers,
            sender: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher))
        })
    }

    /// Number of worker threads, which also bounds each session's in-flight
    /// tasks.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

struct PoolSession {
    sender: mpsc::Sender<Message>,
    guard: Arc<Semaphore>
}

impl BackendSession for PoolSession {
    fn submit(&mut self, task: Task) -> Result<ProfiledFuture> {
        let start = Instant::now();
        let (future, completer) = ProfiledFuture::new();
        self.guard.acquire()?;
        let guard = self.guard.clone();
        let submit_duration = elapsed_ns(start);

        let job: Job = Box::new(move || {
            run_profiled(task, completer, guard, submit_duration, CONSTANT_SCHEDULING_OVERHEAD)
        });
        if self.sender.send(Message::Run(job)).is_err() {
            // The job, and with it the completer, came back with the error
            self.guard.release();
            return Err(Error::backend("worker pool is shut down"));
        }
        Ok(future)
    }
}

impl BackendEngine for LocalWorkerPool {
    fn name(&self) -> &str {
        "local-worker-pool"
    }

    fn session(&self) -> Result<Box<dyn BackendSession>> {
        let sender = self.sender.lock()?
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::backend("worker pool is shut down"))?;
        Ok(Box::new(PoolSession { sender, guard: Arc::new(Semaphore::new(self.max_workers)) }))
    }

    fn shutdown(&self) {
        // Jobs queued before the stop message still run
        if let Ok(mut sender) = self.sender.lock() {
            if let Some(sender) = sender.take() {
                let _ = sender.send(Message::Stop);
            }
        }
        let handle = self.dispatcher.lock().ok().and_then(|mut d| d.take());
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() || handle.join().is_err() {
                warn!("worker pool dispatcher did not stop cleanly");
            }
        }
    }

    fn allows_nested_tasks(&self) -> bool {
        false
    }
}

impl Drop for LocalWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod pool_test {
    use super::*;
    use crate::backend::TaskOutput;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn test_process_based_rejected() {
        assert!(matches!(LocalWorkerPool::new(2, true), Err(Error::Config(_))));
        assert!(matches!(LocalWorkerPool::new(0, false), Err(Error::Config(_))));
    }

    #[test]
    fn test_bounded_concurrency() {
        let workers = 2;
        let pool = LocalWorkerPool::new(workers, false).unwrap();
        let mut session = pool.session().unwrap();

        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let futures: Vec<ProfiledFuture> = (0..6).map(|i| {
            let running = running.clone();
            let max_seen = max_seen.clone();
            session.submit(Box::new(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(Box::new(i) as TaskOutput)
            })).unwrap()
        }).collect();

        let results: Vec<i32> = futures.into_iter()
            .map(|f| *f.result_and_duration(None).unwrap().0.downcast::<i32>().unwrap())
            .collect();
        assert_eq!(results, vec![0, 1, 2, 3, 4, 5]);
        assert!(max_seen.load(Ordering::SeqCst) <= workers);
        // ceil(6 / 2) rounds of 50ms
        assert!(start.elapsed() >= Duration::from_millis(150));
        pool.shutdown();
    }

    #[test]
    fn test_duration_includes_overhead() {
        let pool = LocalWorkerPool::new(1, false).unwrap();
        let mut session = pool.session().unwrap();
        let future = session.submit(Box::new(|| Ok(Box::new(()) as TaskOutput))).unwrap();
        let (_, duration) = future.result_and_duration(None).unwrap();
        assert!(duration >= CONSTANT_SCHEDULING_OVERHEAD);
    }

    #[test]
    fn test_canceled_tasks_never_run() {
        let pool = LocalWorkerPool::new(1, false).unwrap();
        let (release_tx, release_rx) = channel::<()>();
        let (started_tx, started_rx) = channel::<()>();

        // Occupy the only worker thread
        let mut blocking = pool.session().unwrap();
        let blocker = blocking.submit(Box::new(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Ok(Box::new(()) as TaskOutput)
        })).unwrap();
        started_rx.recv().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let mut session = pool.session().unwrap();
        let c = counter.clone();
        let queued = session.submit(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(()) as TaskOutput)
        })).unwrap();

        assert!(queued.cancel());
        release_tx.send(()).unwrap();
        blocker.result_and_duration(None).unwrap();

        // A later task on the same session proves the canceled one was skipped
        let after = session.submit(Box::new(|| Ok(Box::new(()) as TaskOutput))).unwrap();
        after.result_and_duration(None).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(matches!(queued.result_and_duration(None), Err(Error::Canceled)));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let pool = LocalWorkerPool::new(1, false).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert!(pool.session().is_err());
    }
}
