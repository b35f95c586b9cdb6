//! Error types shared by every layer of the kernel.

use std::fmt;

/// Boxed error returned by wrapped functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while binding, partitioning, running or
/// reporting a parallel call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two options that cannot be combined were both set.
    #[error("`{first}` and `{second}` cannot be set simultaneously")]
    MutuallyExclusiveOptions {
        /// Option set first.
        first: &'static str,
        /// Option conflicting with `first`.
        second: &'static str,
    },

    /// The requested backend name is not registered.
    #[error("unknown backend `{name}`, supported backends are: {supported:?}")]
    UnknownBackend {
        /// Name that was asked for.
        name: String,
        /// Every registered name.
        supported: Vec<&'static str>,
    },

    /// The argument names selected for partitioning are malformed.
    #[error("invalid partition-on argument(s): {0}")]
    InvalidPartitionOn(String),

    /// Call arguments do not match the wrapped function's signature.
    #[error("signature mismatch: {0}")]
    Signature(String),

    /// Any other invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Zipped negotiating generators reported different partition sizes.
    #[error("all negotiating partition generators should yield identically sized partitions (expected {expected}, got {actual})")]
    PartitionSizeMismatch {
        /// Size of the first generator's partition.
        expected: usize,
        /// Size reported by a later generator.
        actual: usize
    },

    /// A negotiating generator was asked for, or reported, an empty partition.
    #[error("partition generators should use strictly positive partition sizes")]
    NonPositivePartitionSize,

    /// Fixed-sequence and negotiating generators were mixed where the
    /// composition cannot reconcile them.
    #[error("cannot mix negotiating and fixed-sequence generators: {0}")]
    MixedGenerators(&'static str),

    /// The wrapped function returned an error.
    #[error("task failed: {0}")]
    Task(#[source] BoxError),

    /// The wrapped function panicked.
    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// The task was canceled before it could run.
    #[error("task was canceled")]
    Canceled,

    /// Waiting on a future took longer than the allowed timeout.
    #[error("timed out while waiting for a task")]
    Timeout,

    /// The backend could not execute or track a task.
    #[error("backend error: {0}")]
    Backend(String),

    /// Writing a report or a trace export failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps any error raised by user code into a task error.
    pub fn task<E: Into<BoxError>>(err: E) -> Self {
        Error::Task(err.into())
    }

    /// Builds a backend error from anything printable.
    pub fn backend<D: fmt::Display>(msg: D) -> Self {
        Error::Backend(msg.to_string())
    }

    /// True for errors raised before any task was submitted.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::MutuallyExclusiveOptions { .. }
                | Error::UnknownBackend { .. }
                | Error::InvalidPartitionOn(_)
                | Error::Signature(_)
                | Error::Config(_)
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Backend(format!("lock poisoned: {}", err))
    }
}

/// Turns a captured panic payload into a readable message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod error_test {
    use super::*;

    #[test]
    fn test_configuration_errors() {
        let err = Error::MutuallyExclusiveOptions {
            first: "initial_partition_size",
            second: "fixed_partition_size",
        };
        assert!(err.is_configuration());
        assert!(!Error::Canceled.is_configuration());
        assert!(!Error::NonPositivePartitionSize.is_configuration());
    }

    #[test]
    fn test_task_error_source() {
        let err = Error::task("boom");
        assert_eq!(err.to_string(), "task failed: boom");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("oops");
        assert_eq!(panic_message(payload.as_ref()), "oops");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
