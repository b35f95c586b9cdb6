use crate::error::{Error, Result};
use crate::profiler::{PartitionedTaskTrace, TraceTime};
use super::{EstimatorState, PartitionSizeEstimate, PartitionSizeEstimator};

const DEFAULT_EFFICIENCY: f64 = 0.95;
const DEFAULT_LEARNING_SAMPLE_COUNT: usize = 5;
const DEFAULT_MAX_TRACES: usize = 100;
const DEFAULT_LEARNING_SAMPLE_SIZES: [usize; 9] = [64, 8, 96, 32, 256, 1, 128, 48, 4];

/// Fit of `duration_per_item(n) = a + b / n`.
///
/// `a` is the per-item cost, `b` the fixed per-task overhead spread over the
/// `n` items of a partition.
#[derive(Debug,Clone,PartialEq)]
pub struct LinearRegressionCoefficients {
    /// Per-item cost.
    pub a: f64,
    /// Fixed per-task overhead.
    pub b: f64,
    /// Coefficient of determination of the fit.
    pub score: f64,
    /// Number of traces the fit is based on.
    pub trace_count: usize
}

/// Estimates the smallest partition size whose fixed overhead stays below
/// `1 - min_parallelism_efficiency` of the task's time.
///
/// Solving `b / n <= (1 - e) * a` gives `n = ceil(b / (a * (1 - e)))`.
#[derive(Debug,Clone)]
pub struct LinearRegressionEstimator {
    min_parallelism_efficiency: f64,
    learning_sample_count: usize,
    learning_sample_sizes: Vec<usize>,
    max_traces: usize,

    current_learning_sample: usize,

    // (partition size, duration per item); sorted by size once full
    run_traces: Vec<(usize, TraceTime)>,
    current_coefficients: Option<LinearRegressionCoefficients>,
    current_estimate: Option<PartitionSizeEstimate>
}

impl Default for LinearRegressionEstimator {
    fn default() -> Self {
        LinearRegressionEstimator {
            min_parallelism_efficiency: DEFAULT_EFFICIENCY,
            learning_sample_count: DEFAULT_LEARNING_SAMPLE_COUNT,
            learning_sample_sizes: DEFAULT_LEARNING_SAMPLE_SIZES.to_vec(),
            max_traces: DEFAULT_MAX_TRACES,
            current_learning_sample: 0,
            run_traces: Vec::new(),
            current_coefficients: None,
            current_estimate: None
        }
    }
}

impl LinearRegressionEstimator {
    /// Builder starting from the default settings.
    pub fn builder() -> LinearRegressionEstimatorBuilder {
        LinearRegressionEstimatorBuilder { inner: LinearRegressionEstimator::default() }
    }

    /// Number of traces currently kept.
    pub fn trace_count(&self) -> usize {
        self.run_traces.len()
    }

    /// Fits the model on the recorded traces, caching the result until the
    /// next trace arrives.
    pub fn coefficients(&mut self) -> LinearRegressionCoefficients {
        if let Some(c) = self.current_coefficients.as_ref() {
            return c.clone();
        }
        let c = fit(&self.run_traces);
        self.current_coefficients = Some(c.clone());
        c
    }

    fn learn_estimate(&mut self, dry_run: bool) -> PartitionSizeEstimate {
        let value = self.learning_sample_sizes[self.current_learning_sample];
        if !dry_run {
            self.current_learning_sample = (self.current_learning_sample + 1) % self.learning_sample_sizes.len();
        }
        PartitionSizeEstimate::new(value)
    }

    /// Replaces the stored sample whose size is nearest to `sample`'s.
    ///
    /// `run_traces` is sorted by size. The candidates are the last sample
    /// smaller than the new one and the first one at least as large; ties go
    /// to the smaller. Either replacement keeps the order.
    fn replace_nearest(&mut self, sample: (usize, TraceTime)) {
        let size = sample.0;
        let idx = self.run_traces.partition_point(|t| t.0 < size);
        let target = if idx == 0 {
            0
        } else if idx >= self.run_traces.len() {
            self.run_traces.len() - 1
        } else {
            let left = self.run_traces[idx - 1].0;
            let right = self.run_traces[idx].0;
            if size - left <= right - size { idx - 1 } else { idx }
        };
        self.run_traces[target] = sample;
    }
}

impl PartitionSizeEstimator for LinearRegressionEstimator {
    fn add_partition_trace(&mut self, trace: &PartitionedTaskTrace) {
        let total = match trace.total_duration() {
            Some(total) if trace.partition_size > 0 => total,
            _ => return
        };
        let sample = (trace.partition_size, total / trace.partition_size as TraceTime);

        if self.run_traces.len() < self.max_traces {
            self.run_traces.push(sample);
            if self.run_traces.len() >= self.max_traces {
                self.run_traces.sort_by_key(|t| t.0);
            }
        } else {
            self.replace_nearest(sample);
        }

        self.current_coefficients = None;
        self.current_estimate = None;
    }

    fn state(&self) -> EstimatorState {
        if self.run_traces.len() < self.learning_sample_count {
            EstimatorState::Learning
        } else {
            EstimatorState::Running
        }
    }

    fn estimate(&mut self, dry_run: bool) -> PartitionSizeEstimate {
        if let Some(estimate) = self.current_estimate.as_ref() {
            return estimate.clone();
        }

        if self.state() == EstimatorState::Learning {
            return self.learn_estimate(dry_run);
        }

        let coefficients = self.coefficients();
        let (a, b) = (coefficients.a, coefficients.b);
        if b <= 0.0 || a <= 0.0 {
            if self.run_traces.len() >= self.max_traces {
                debug!("failed to estimate a valid partition size (a={}, b={}), falling back to learning", a, b);
            }
            return self.learn_estimate(dry_run);
        }

        let size = (b / (a * (1.0 - self.min_parallelism_efficiency))).ceil();
        let estimate = PartitionSizeEstimate {
            value: (size as usize).max(1),
            coefficients: Some(coefficients)
        };
        trace!("estimated partition size: {}", estimate.value);
        self.current_estimate = Some(estimate.clone());
        estimate
    }
}

/// Least squares on `x = 1 / size` with a non-negative slope.
fn fit(samples: &[(usize, TraceTime)]) -> LinearRegressionCoefficients {
    let n = samples.len();
    if n == 0 {
        return LinearRegressionCoefficients { a: 0.0, b: 0.0, score: 0.0, trace_count: 0 };
    }

    let xs: Vec<f64> = samples.iter().map(|(size, _)| 1.0 / *size as f64).collect();
    let ys: Vec<f64> = samples.iter().map(|(_, y)| *y as f64).collect();
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;

    let (sxx, sxy) = xs.iter().zip(ys.iter()).fold((0.0, 0.0), |(sxx, sxy), (x, y)| {
        (sxx + (x - mean_x) * (x - mean_x), sxy + (x - mean_x) * (y - mean_y))
    });

    // A negative slope is clamped, leaving the intercept at the mean
    let b = if sxx > 0.0 { (sxy / sxx).max(0.0) } else { 0.0 };
    let a = mean_y - b * mean_x;

    let (ss_res, ss_tot) = xs.iter().zip(ys.iter()).fold((0.0, 0.0), |(res, tot), (x, y)| {
        let err = y - (a + b * x);
        (res + err * err, tot + (y - mean_y) * (y - mean_y))
    });
    let score = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    };

    LinearRegressionCoefficients { a, b, score, trace_count: n }
}

/// Knobs of [`LinearRegressionEstimator`].
pub struct LinearRegressionEstimatorBuilder {
    inner: LinearRegressionEstimator
}

impl LinearRegressionEstimatorBuilder {
    /// Fraction of a task's time that must be spent on items rather than on
    /// fixed overhead. Must be in `(0, 1)`.
    pub fn min_parallelism_efficiency(mut self, efficiency: f64) -> Self {
        self.inner.min_parallelism_efficiency = efficiency;
        self
    }

    /// Number of traces to collect before trusting the model.
    pub fn learning_sample_count(mut self, count: usize) -> Self {
        self.inner.learning_sample_count = count;
        self
    }

    /// Sizes cycled through while learning.
    pub fn learning_sample_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.inner.learning_sample_sizes = sizes;
        self
    }

    /// Number of samples kept before older ones get replaced.
    pub fn max_traces(mut self, max_traces: usize) -> Self {
        self.inner.max_traces = max_traces;
        self
    }

    /// Checks the settings and builds the estimator.
    pub fn build(self) -> Result<LinearRegressionEstimator> {
        let e = &self.inner;
        if !(e.min_parallelism_efficiency > 0.0 && e.min_parallelism_efficiency < 1.0) {
            return Err(Error::Config(format!(
                "min_parallelism_efficiency must be in (0, 1), got {}", e.min_parallelism_efficiency)));
        }
        if e.learning_sample_sizes.is_empty() || e.learning_sample_sizes.contains(&0) {
            return Err(Error::Config("learning sample sizes must be non-empty and positive".into()));
        }
        if e.max_traces == 0 || e.learning_sample_count > e.max_traces {
            return Err(Error::Config(format!(
                "max_traces ({}) must be positive and at least learning_sample_count ({})",
                e.max_traces, e.learning_sample_count)));
        }
        Ok(self.inner)
    }
}

#[cfg(test)]
mod linear_test {
    use super::*;

    fn trace(size: usize, duration: TraceTime) -> PartitionedTaskTrace {
        let mut t = PartitionedTaskTrace::new(None, size, 0);
        t.task_duration = Some(duration);
        t.combine_duration = Some(0);
        t
    }

    /// Total task time of a partition under `a + b / n` per item.
    fn model(a: u64, b: u64, n: usize) -> TraceTime {
        a * n as u64 + b
    }

    #[test]
    fn test_learning_schedule() {
        let mut estimator = LinearRegressionEstimator::default();
        assert_eq!(estimator.state(), EstimatorState::Learning);

        let first: Vec<usize> = (0..9).map(|_| estimator.estimate(false).value).collect();
        assert_eq!(first, DEFAULT_LEARNING_SAMPLE_SIZES.to_vec());
        // Wraps around
        assert_eq!(estimator.estimate(false).value, 64);

        // Dry runs do not advance the schedule
        assert_eq!(estimator.estimate(true).value, 8);
        assert_eq!(estimator.estimate(true).value, 8);
        assert_eq!(estimator.estimate(false).value, 8);
    }

    #[test]
    fn test_learning_sizes_come_from_schedule() {
        let mut estimator = LinearRegressionEstimator::default();
        for _ in 0..DEFAULT_LEARNING_SAMPLE_COUNT {
            assert_eq!(estimator.state(), EstimatorState::Learning);
            let size = estimator.estimate(false).value;
            assert!(DEFAULT_LEARNING_SAMPLE_SIZES.contains(&size));
            estimator.add_partition_trace(&trace(size, model(1_000, 1_000_000, size)));
        }
        assert_eq!(estimator.state(), EstimatorState::Running);
    }

    #[test]
    fn test_converges_to_model() {
        let (a, b) = (1_000u64, 1_000_000u64);
        let expected = (b as f64 / (a as f64 * (1.0 - DEFAULT_EFFICIENCY))).ceil();

        let mut estimator = LinearRegressionEstimator::default();
        for _ in 0..1_000 {
            let size = estimator.estimate(false).value;
            estimator.add_partition_trace(&trace(size, model(a, b, size)));
        }

        let estimate = estimator.estimate(false);
        assert!((estimate.value as f64 - expected).abs() / expected < 0.2,
                "estimate {} too far from {}", estimate.value, expected);
        let coefficients = estimate.coefficients.expect("running estimate has coefficients");
        assert!(coefficients.score > 0.9);
        assert_eq!(coefficients.trace_count, DEFAULT_MAX_TRACES);
    }

    #[test]
    fn test_estimate_cached_until_new_trace() {
        let mut estimator = LinearRegressionEstimator::default();
        for &size in [1usize, 2, 4, 8, 16].iter() {
            estimator.add_partition_trace(&trace(size, model(10, 1_000, size)));
        }
        let first = estimator.estimate(false);
        assert!(first.coefficients.is_some());
        assert_eq!(estimator.estimate(false), first);

        estimator.add_partition_trace(&trace(32, model(10, 100_000, 32)));
        assert_ne!(estimator.estimate(false), first);
    }

    #[test]
    fn test_degenerate_fit_falls_back() {
        let mut estimator = LinearRegressionEstimator::default();
        // Constant duration per item: no fixed overhead to amortize
        for &size in [1usize, 2, 4, 8, 16].iter() {
            estimator.add_partition_trace(&trace(size, 100 * size as u64));
        }
        assert_eq!(estimator.state(), EstimatorState::Running);
        let estimate = estimator.estimate(false);
        assert!(estimate.coefficients.is_none());
        assert_eq!(estimate.value, DEFAULT_LEARNING_SAMPLE_SIZES[0]);
        assert_eq!(estimator.trace_count(), 5);
    }

    #[test]
    fn test_incomplete_traces_ignored() {
        let mut estimator = LinearRegressionEstimator::default();
        estimator.add_partition_trace(&PartitionedTaskTrace::new(None, 4, 10));
        assert_eq!(estimator.trace_count(), 0);
    }

    #[test]
    fn test_replacement_keeps_sorted() {
        let mut estimator = LinearRegressionEstimator::builder()
            .max_traces(4)
            .learning_sample_count(2)
            .build()
            .unwrap();
        for &size in [40usize, 10, 30, 20].iter() {
            estimator.add_partition_trace(&trace(size, 100));
        }
        let sizes = |e: &LinearRegressionEstimator| e.run_traces.iter().map(|t| t.0).collect::<Vec<_>>();
        assert_eq!(sizes(&estimator), vec![10, 20, 30, 40]);

        // Nearest is 20
        estimator.add_partition_trace(&trace(22, 100));
        assert_eq!(sizes(&estimator), vec![10, 22, 30, 40]);
        // Tie between 22 and 30 goes left
        estimator.add_partition_trace(&trace(26, 100));
        assert_eq!(sizes(&estimator), vec![10, 26, 30, 40]);
        // Beyond both ends
        estimator.add_partition_trace(&trace(1, 100));
        estimator.add_partition_trace(&trace(100, 100));
        assert_eq!(sizes(&estimator), vec![1, 26, 30, 100]);
    }

    #[test]
    fn test_fit_recovers_coefficients() {
        let samples: Vec<(usize, TraceTime)> = [1usize, 2, 4, 5, 10].iter()
            .map(|&n| (n, 50 + 1_000 / n as u64))
            .collect();
        let c = fit(&samples);
        assert!((c.a - 50.0).abs() < 1e-6);
        assert!((c.b - 1_000.0).abs() < 1e-6);
        assert!((c.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_builder_validation() {
        assert!(LinearRegressionEstimator::builder().min_parallelism_efficiency(1.0).build().is_err());
        assert!(LinearRegressionEstimator::builder().learning_sample_sizes(vec![]).build().is_err());
        assert!(LinearRegressionEstimator::builder().max_traces(2).build().is_err());
        assert!(LinearRegressionEstimator::builder().min_parallelism_efficiency(0.5).build().is_ok());
    }
}
