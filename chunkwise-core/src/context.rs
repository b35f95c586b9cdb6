//! Scoped execution context of the calling thread.
//!
//! Holds a stack of backends, the top of which is the backend parallel calls
//! submit to, and the depth of worker invocations the thread is currently
//! running. Both are changed only through guards, so every scope restores
//! what it found on exit.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::backend::BackendEngine;

thread_local! {
    static BACKENDS: RefCell<Vec<Option<Arc<dyn BackendEngine>>>> = RefCell::new(Vec::new());
    static WORKER_DEPTH: Cell<usize> = Cell::new(0);
}

/// The backend of the innermost scope, `None` if parallelism is disabled or
/// no backend was ever set on this thread.
pub fn current_backend() -> Option<Arc<dyn BackendEngine>> {
    BACKENDS.with(|b| b.borrow().last().cloned().flatten())
}

/// Whether any scope on this thread set a backend, even `None`.
pub fn has_backend_scope() -> bool {
    BACKENDS.with(|b| !b.borrow().is_empty())
}

/// Whether the calling thread is running a partition of a parallel call.
pub fn in_worker() -> bool {
    worker_depth() > 0
}

/// Number of nested partitions the calling thread is running.
pub fn worker_depth() -> usize {
    WORKER_DEPTH.with(|d| d.get())
}

fn push(backend: Option<Arc<dyn BackendEngine>>) {
    BACKENDS.with(|b| b.borrow_mut().push(backend));
}

fn pop() -> Option<Arc<dyn BackendEngine>> {
    BACKENDS.with(|b| b.borrow_mut().pop().flatten())
}

/// Makes `backend` current until the guard is dropped.
///
/// On drop the previous backend is restored and `backend` is shut down.
/// Passing `None` disables parallelism for the scope.
pub fn set_backend(backend: Option<Arc<dyn BackendEngine>>) -> BackendGuard {
    match backend.as_ref() {
        Some(b) => info!("using parallel backend {}", b.name()),
        None => info!("parallel backend disabled")
    }
    push(backend);
    BackendGuard { shutdown_on_exit: true, _thread: PhantomData }
}

/// Restores the previous backend on drop.
#[must_use = "the backend is unset as soon as the guard is dropped"]
pub struct BackendGuard {
    shutdown_on_exit: bool,
    // Thread-local state: the guard must be dropped on the thread that made it
    _thread: PhantomData<*const ()>
}

impl Drop for BackendGuard {
    fn drop(&mut self) {
        if let Some(backend) = pop() {
            if self.shutdown_on_exit {
                debug!("shutting down parallel backend {}", backend.name());
                backend.shutdown();
            }
        }
    }
}

/// Marks the calling thread as running a partition, with `nested_backend`
/// as its current backend, until the guard is dropped.
///
/// The nested backend is owned by the parent call and is not shut down.
pub(crate) fn enter_worker(nested_backend: Option<Arc<dyn BackendEngine>>) -> WorkerGuard {
    WORKER_DEPTH.with(|d| d.set(d.get() + 1));
    push(nested_backend);
    WorkerGuard { backend: BackendGuard { shutdown_on_exit: false, _thread: PhantomData } }
}

pub(crate) struct WorkerGuard {
    #[allow(dead_code)]
    backend: BackendGuard
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        WORKER_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}
