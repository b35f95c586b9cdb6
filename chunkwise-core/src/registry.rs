//! Named backends and how to build them.

use std::env;
use std::sync::Arc;

use serde::Deserialize;

use crate::backend::{BackendEngine, ClusterBackend, LocalWorkerPool, SequentialBackend};
use crate::context::{self, BackendGuard};
use crate::error::{Error, Result};

/// Every name [`BackendConfig::from_name`] understands.
pub const BACKEND_NAMES: [&str; 6] = [
    "none",
    "sequential-in-process",
    "local-worker-pool",
    "cluster-local",
    "cluster-remote",
    "cluster-current",
];

const DEFAULT_MAX_IDLE_CLIENTS: usize = 4;

/// Physical core count minus one, and at least one.
pub fn default_worker_count() -> usize {
    num_cpus::get_physical().saturating_sub(1).max(1)
}

fn default_true() -> bool {
    true
}

fn default_max_idle_clients() -> usize {
    DEFAULT_MAX_IDLE_CLIENTS
}

/// Description of one backend, deserializable from configuration files.
///
/// ```
/// use chunkwise::registry::BackendConfig;
///
/// let config: BackendConfig = serde_json::from_str(
///     r#"{"backend": "local-worker-pool", "max_workers": 4}"#).unwrap();
/// assert_eq!(config, BackendConfig::LocalWorkerPool { max_workers: 4, is_process_based: false });
/// ```
#[derive(Debug,Clone,PartialEq,Eq,Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum BackendConfig {
    /// Disables parallelism: wrapped functions run as if unwrapped.
    None,
    /// [`SequentialBackend`].
    SequentialInProcess,
    /// [`LocalWorkerPool`].
    LocalWorkerPool {
        /// Number of worker threads.
        #[serde(default = "default_worker_count")]
        max_workers: usize,
        /// Process-based pools are not supported and fail to build.
        #[serde(default)]
        is_process_based: bool
    },
    /// [`ClusterBackend::local`], with a private scheduler.
    ClusterLocal {
        /// Number of tasks the scheduler runs at once.
        #[serde(default = "default_worker_count")]
        n_workers: usize,
        /// Whether tasks may issue parallel calls of their own.
        #[serde(default = "default_true")]
        allows_nested_tasks: bool,
        /// Idle clients kept for reuse between calls.
        #[serde(default = "default_max_idle_clients")]
        max_idle_clients: usize
    },
    /// [`ClusterBackend::remote`], connecting to a running scheduler.
    ClusterRemote {
        /// `inproc://` address of the scheduler.
        scheduler_address: String,
        /// In-flight task limit of each session.
        #[serde(default = "default_worker_count")]
        n_workers: usize,
        /// Whether tasks may issue parallel calls of their own.
        #[serde(default = "default_true")]
        allows_nested_tasks: bool
    },
    /// [`ClusterBackend::current`], on a cluster worker.
    ClusterCurrent {
        /// In-flight task limit of each session.
        #[serde(default = "default_worker_count")]
        n_workers: usize
    }
}

impl BackendConfig {
    /// Default configuration of a named backend.
    ///
    /// `cluster-remote` has no default scheduler address and is rejected.
    pub fn from_name(name: &str) -> Result<BackendConfig> {
        let workers = default_worker_count();
        match name {
            "none" => Ok(BackendConfig::None),
            "sequential-in-process" => Ok(BackendConfig::SequentialInProcess),
            "local-worker-pool" => Ok(BackendConfig::LocalWorkerPool { max_workers: workers, is_process_based: false }),
            "cluster-local" => Ok(BackendConfig::ClusterLocal {
                n_workers: workers,
                allows_nested_tasks: true,
                max_idle_clients: DEFAULT_MAX_IDLE_CLIENTS
            }),
            "cluster-remote" => Err(Error::Config("`cluster-remote` requires a scheduler address".into())),
            "cluster-current" => Ok(BackendConfig::ClusterCurrent { n_workers: workers }),
            _ => Err(Error::UnknownBackend { name: name.to_owned(), supported: BACKEND_NAMES.to_vec() })
        }
    }

    /// Reads `CHUNKWISE_BACKEND`, `CHUNKWISE_MAX_WORKERS` and
    /// `CHUNKWISE_SCHEDULER_ADDRESS`.
    ///
    /// Returns `None` when `CHUNKWISE_BACKEND` is unset.
    pub fn from_env() -> Result<Option<BackendConfig>> {
        BackendConfig::from_vars(
            env::var("CHUNKWISE_BACKEND").ok(),
            env::var("CHUNKWISE_MAX_WORKERS").ok(),
            env::var("CHUNKWISE_SCHEDULER_ADDRESS").ok())
    }

    fn from_vars(
        backend: Option<String>,
        max_workers: Option<String>,
        scheduler_address: Option<String>
    ) -> Result<Option<BackendConfig>> {
        let name = match backend {
            Some(name) => name,
            None => return Ok(None)
        };

        let mut config = match (name.as_str(), scheduler_address) {
            ("cluster-remote", Some(scheduler_address)) => BackendConfig::ClusterRemote {
                scheduler_address,
                n_workers: default_worker_count(),
                allows_nested_tasks: true
            },
            (name, _) => BackendConfig::from_name(name)?
        };

        if let Some(raw) = max_workers {
            let n: usize = raw.trim().parse()
                .map_err(|_| Error::Config(format!("invalid worker count `{}`", raw)))?;
            config = config.with_workers(n);
        }
        Ok(Some(config))
    }

    /// Same configuration with another worker count, where it has one.
    pub fn with_workers(self, n: usize) -> BackendConfig {
        match self {
            BackendConfig::LocalWorkerPool { is_process_based, .. } =>
                BackendConfig::LocalWorkerPool { max_workers: n, is_process_based },
            BackendConfig::ClusterLocal { allows_nested_tasks, max_idle_clients, .. } =>
                BackendConfig::ClusterLocal { n_workers: n, allows_nested_tasks, max_idle_clients },
            BackendConfig::ClusterRemote { scheduler_address, allows_nested_tasks, .. } =>
                BackendConfig::ClusterRemote { scheduler_address, n_workers: n, allows_nested_tasks },
            BackendConfig::ClusterCurrent { .. } => BackendConfig::ClusterCurrent { n_workers: n },
            other => other
        }
    }

    /// The registered name of this configuration's backend.
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::None => "none",
            BackendConfig::SequentialInProcess => "sequential-in-process",
            BackendConfig::LocalWorkerPool { .. } => "local-worker-pool",
            BackendConfig::ClusterLocal { .. } => "cluster-local",
            BackendConfig::ClusterRemote { .. } => "cluster-remote",
            BackendConfig::ClusterCurrent { .. } => "cluster-current"
        }
    }

    /// Builds the engine, or `None` for [`BackendConfig::None`].
    pub fn build(&self) -> Result<Option<Arc<dyn BackendEngine>>> {
        let engine: Arc<dyn BackendEngine> = match self {
            BackendConfig::None => return Ok(None),
            BackendConfig::SequentialInProcess => Arc::new(SequentialBackend::new()),
            BackendConfig::LocalWorkerPool { max_workers, is_process_based } =>
                Arc::new(LocalWorkerPool::new(*max_workers, *is_process_based)?),
            BackendConfig::ClusterLocal { n_workers, allows_nested_tasks, max_idle_clients } =>
                Arc::new(ClusterBackend::local(*n_workers, *allows_nested_tasks, *max_idle_clients)?),
            BackendConfig::ClusterRemote { scheduler_address, n_workers, allows_nested_tasks } =>
                Arc::new(ClusterBackend::remote(scheduler_address, *n_workers, *allows_nested_tasks)?),
            BackendConfig::ClusterCurrent { n_workers } => Arc::new(ClusterBackend::current(*n_workers)?)
        };
        Ok(Some(engine))
    }
}

/// Builds the configured backend and makes it current for the guard's scope.
pub fn use_backend(config: &BackendConfig) -> Result<BackendGuard> {
    Ok(context::set_backend(config.build()?))
}

/// Same as [`use_backend`] with the default configuration of a named backend.
pub fn use_backend_named(name: &str) -> Result<BackendGuard> {
    use_backend(&BackendConfig::from_name(name)?)
}
