//! Online partition size estimation.
//!
//! An estimator is fed the trace of every completed partition and proposes
//! the size of the next one. While it has too few samples it is
//! [`EstimatorState::Learning`] and tries a fixed schedule of sizes; after
//! that it is [`EstimatorState::Running`] and derives the size from a model
//! of the observed timings.

mod linear;

use std::fmt;

use crate::profiler::PartitionedTaskTrace;

pub use self::linear::{LinearRegressionCoefficients, LinearRegressionEstimator, LinearRegressionEstimatorBuilder};

/// Phase of an estimator.
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum EstimatorState {
    /// Collecting samples on a fixed schedule of sizes.
    Learning,
    /// Estimating from the fitted model.
    Running
}

impl fmt::Display for EstimatorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EstimatorState::Learning => write!(f, "learning"),
            EstimatorState::Running => write!(f, "running")
        }
    }
}

/// A proposed partition size, with the model it was derived from, if any.
#[derive(Debug,Clone,PartialEq)]
pub struct PartitionSizeEstimate {
    /// Proposed size, at least 1.
    pub value: usize,
    /// Model fit the size was derived from.
    pub coefficients: Option<LinearRegressionCoefficients>
}

impl PartitionSizeEstimate {
    /// An estimate not backed by a model, clamped to at least 1.
    pub fn new(value: usize) -> Self {
        PartitionSizeEstimate { value: value.max(1), coefficients: None }
    }
}

/// Control loop choosing partition sizes from completed partition traces.
pub trait PartitionSizeEstimator: Send {
    /// Records a completed partition. Traces without task or combine
    /// durations are ignored.
    fn add_partition_trace(&mut self, trace: &PartitionedTaskTrace);

    /// Current phase.
    fn state(&self) -> EstimatorState;

    /// Proposes the next partition size.
    ///
    /// A dry run returns the same value without advancing any internal
    /// schedule.
    fn estimate(&mut self, dry_run: bool) -> PartitionSizeEstimate;
}

/// Builds a fresh estimator for every parallel function.
pub type EstimatorFactory = std::sync::Arc<dyn Fn() -> Box<dyn PartitionSizeEstimator> + Send + Sync>;

/// The factory used when none is configured.
pub fn default_estimator_factory() -> EstimatorFactory {
    std::sync::Arc::new(|| Box::new(LinearRegressionEstimator::default()))
}
