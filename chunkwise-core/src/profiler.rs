//! Per-partition timings, the timed partition and combine stages, and trace
//! reporting.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::estimator::{PartitionSizeEstimate, PartitionSizeEstimator};
use crate::partition::{validate_request, validate_step, PartitionGenerator};

/// Nanoseconds of monotonic wall-clock time.
pub type TraceTime = u64;

/// Estimator shared between the partition and the combine stages of a call.
pub type SharedEstimator = Mutex<Box<dyn PartitionSizeEstimator>>;

/// Nanoseconds elapsed since `since`.
pub fn elapsed_ns(since: Instant) -> TraceTime {
    since.elapsed().as_nanos() as TraceTime
}

/// Runs `f`, returning its value and how long it took.
pub fn timed<R, F: FnOnce() -> R>(f: F) -> (R, TraceTime) {
    let start = Instant::now();
    let r = f();
    (r, elapsed_ns(start))
}

/// Timings of one partition of a parallel call.
#[derive(Debug,Clone,PartialEq)]
pub struct PartitionedTaskTrace {
    /// Estimate the partition was requested with, if any.
    pub partition_size_estimate: Option<PartitionSizeEstimate>,
    /// Actual number of items in the partition.
    pub partition_size: usize,
    /// Time spent generating the partition.
    pub partition_duration: TraceTime,
    /// Set once the task finished.
    pub task_duration: Option<TraceTime>,
    /// Set once the combiner consumed the result.
    pub combine_duration: Option<TraceTime>
}

impl PartitionedTaskTrace {
    /// Trace of a freshly generated partition, not run yet.
    pub fn new(estimate: Option<PartitionSizeEstimate>, partition_size: usize, partition_duration: TraceTime) -> Self {
        PartitionedTaskTrace {
            partition_size_estimate: estimate,
            partition_size,
            partition_duration,
            task_duration: None,
            combine_duration: None
        }
    }

    /// Sum of the three stages, once all of them finished.
    pub fn total_duration(&self) -> Option<TraceTime> {
        match (self.task_duration, self.combine_duration) {
            (Some(task), Some(combine)) => Some(self.partition_duration + task + combine),
            _ => None
        }
    }

    /// Size the generator was asked for.
    pub fn requested_partition_size(&self) -> Option<usize> {
        self.partition_size_estimate.as_ref().map(|e| e.value)
    }
}

/// All partition traces of one parallel call, in consumption order.
#[derive(Debug,Clone,Default)]
pub struct TaskTrace {
    /// One trace per partition.
    pub partition_traces: Vec<PartitionedTaskTrace>
}

impl TaskTrace {
    /// Number of partitions the call was split into.
    pub fn partition_count(&self) -> usize {
        self.partition_traces.len()
    }

    /// Time spent generating partitions.
    pub fn total_partition_duration(&self) -> TraceTime {
        self.partition_traces.iter().map(|t| t.partition_duration).sum()
    }

    /// Profiled task time, summed over finished partitions.
    pub fn total_task_duration(&self) -> TraceTime {
        self.partition_traces.iter().filter_map(|t| t.task_duration).sum()
    }

    /// Time spent combining results.
    pub fn total_combine_duration(&self) -> TraceTime {
        self.partition_traces.iter().filter_map(|t| t.combine_duration).sum()
    }
}

/// How the sizes requested from a negotiating generator are chosen.
pub enum Sizing<'a> {
    /// Ask the estimator every step, starting with an optional hint.
    Estimated {
        /// Estimator of the parallel function.
        estimator: &'a SharedEstimator,
        /// Size of the first request, before asking the estimator.
        initial: Option<usize>
    },
    /// Always request the same size.
    Fixed(usize)
}

/// Drives a partition generator, timing every partition.
///
/// Fixed-sequence partitions are recorded with a size of 1 and no estimate.
pub struct TimedPartitions<'a, P> {
    generator: PartitionGenerator<P>,
    sizing: Sizing<'a>,
    first: bool,
    done: bool
}

impl <'a, P> TimedPartitions<'a, P> {
    /// Times the partitions of `generator`, requesting sizes per `sizing`.
    pub fn new(generator: PartitionGenerator<P>, sizing: Sizing<'a>) -> Self {
        TimedPartitions { generator, sizing, first: true, done: false }
    }

    fn next_request(&mut self) -> Result<(usize, Option<PartitionSizeEstimate>)> {
        let first = std::mem::replace(&mut self.first, false);
        match &self.sizing {
            Sizing::Fixed(size) => Ok((*size, None)),
            Sizing::Estimated { initial: Some(size), .. } if first => Ok((*size, None)),
            Sizing::Estimated { estimator, .. } => {
                let estimate = estimator.lock()?.estimate(false);
                Ok((estimate.value, Some(estimate)))
            }
        }
    }

    fn step(&mut self) -> Result<Option<(P, PartitionedTaskTrace)>> {
        let (requested, estimate) = if matches!(self.generator, PartitionGenerator::Negotiating(_)) {
            let (size, estimate) = self.next_request()?;
            (validate_request(size)?, estimate)
        } else {
            (0, None)
        };

        match &mut self.generator {
            PartitionGenerator::Fixed(it) => {
                let (next, duration) = timed(|| it.next());
                match next {
                    Some(p) => Ok(Some((p?, PartitionedTaskTrace::new(None, 1, duration)))),
                    None => Ok(None)
                }
            },
            PartitionGenerator::Negotiating(g) => {
                let (step, duration) = timed(|| g.advance(requested));
                match validate_step(step?)? {
                    Some((size, p)) => Ok(Some((p, PartitionedTaskTrace::new(estimate, size, duration)))),
                    None => Ok(None)
                }
            }
        }
    }
}

impl <'a, P> Iterator for TimedPartitions<'a, P> {
    type Item = Result<(P, PartitionedTaskTrace)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Feeds task results to a combiner, timing the combiner's work on every
/// result and recording finished traces.
///
/// Every trace is completed with its task and combine durations, forwarded
/// to the estimator and appended to the returned [`TaskTrace`]. The first
/// failed result ends the combiner's input; the error is returned once the
/// combiner returns, and its value is dropped.
pub fn timed_combine<R, I, C>(
    combine_with: C,
    estimator: Option<&SharedEstimator>,
    results: I
) -> Result<(R, TaskTrace)>
        where I: Iterator<Item = Result<(R, PartitionedTaskTrace, TraceTime)>>,
              C: FnOnce(&mut dyn Iterator<Item = R>) -> R {
    let mut stream = TimedCombine {
        results,
        estimator,
        pending: None,
        error: None,
        trace: TaskTrace::default()
    };
    let combined = combine_with(&mut stream);
    stream.finish_pending()?;

    match stream.error.take() {
        Some(e) => Err(e),
        None => Ok((combined, stream.trace))
    }
}

struct TimedCombine<'a, I> {
    results: I,
    estimator: Option<&'a SharedEstimator>,
    pending: Option<(PartitionedTaskTrace, Instant)>,
    error: Option<Error>,
    trace: TaskTrace
}

impl <'a, I> TimedCombine<'a, I> {
    fn finish_pending(&mut self) -> Result<()> {
        if let Some((mut trace, yielded_at)) = self.pending.take() {
            trace.combine_duration = Some(elapsed_ns(yielded_at));
            if let Some(estimator) = self.estimator {
                estimator.lock()?.add_partition_trace(&trace);
            }
            self.trace.partition_traces.push(trace);
        }
        Ok(())
    }
}

impl <'a, R, I> Iterator for TimedCombine<'a, I>
        where I: Iterator<Item = Result<(R, PartitionedTaskTrace, TraceTime)>> {
    type Item = R;

    fn next(&mut self) -> Option<R> {
        if let Err(e) = self.finish_pending() {
            self.error = Some(e);
        }
        if self.error.is_some() {
            return None;
        }

        match self.results.next() {
            Some(Ok((result, mut trace, task_duration))) => {
                trace.task_duration = Some(task_duration);
                self.pending = Some((trace, Instant::now()));
                Some(result)
            },
            Some(Err(e)) => {
                self.error = Some(e);
                None
            },
            None => None
        }
    }
}

fn pct(part: Duration, total: Duration) -> f64 {
    if total.as_nanos() == 0 {
        0.0
    } else {
        part.as_secs_f64() / total.as_secs_f64() * 100.0
    }
}

/// Writes a human-readable summary of a call's timings.
pub fn print_profile_trace<W: Write>(
    out: &mut W,
    function_name: &str,
    estimator: Option<&SharedEstimator>,
    task_trace: &TaskTrace
) -> Result<()> {
    writeln!(out, "{}()", function_name)?;

    let count = task_trace.partition_count();
    if count == 0 {
        writeln!(out, "\tno partition was executed.")?;
        return Ok(());
    }

    let partitioning = Duration::from_nanos(task_trace.total_partition_duration());
    let compute = Duration::from_nanos(task_trace.total_task_duration());
    let combining = Duration::from_nanos(task_trace.total_combine_duration());
    let total = partitioning + compute + combining;
    let overhead = partitioning + combining;

    let computes: Vec<Duration> = task_trace.partition_traces.iter()
        .map(|t| Duration::from_nanos(t.task_duration.unwrap_or(0)))
        .collect();
    let min_compute = computes.iter().min().copied().unwrap_or_default();
    let max_compute = computes.iter().max().copied().unwrap_or_default();

    writeln!(out, "\ttotal CPU execution time: {:?}.", total)?;
    writeln!(out, "\tcompute time: {:?} ({:.2}%)", compute, pct(compute, total))?;
    writeln!(out, "\t\tmin.: {:?}", min_compute)?;
    writeln!(out, "\t\tmax.: {:?}", max_compute)?;
    writeln!(out, "\t\tavg.: {:?}", compute / count as u32)?;

    writeln!(out, "\ttotal parallel overhead: {:?} ({:.2}%)", overhead, pct(overhead, total))?;
    writeln!(out, "\t\ttotal partitioning: {:?} ({:.2}%)", partitioning, pct(partitioning, total))?;
    writeln!(out, "\t\taverage partitioning: {:?}", partitioning / count as u32)?;
    writeln!(out, "\t\ttotal combining: {:?} ({:.2}%)", combining, pct(combining, total))?;

    let bottleneck = overhead.max(max_compute);
    let speedup = if bottleneck.as_nanos() == 0 { 1.0 } else { total.as_secs_f64() / bottleneck.as_secs_f64() };
    writeln!(out, "\tmaximum speedup (theoretical): {:.2}x", speedup)?;

    writeln!(out, "\ttotal partition count: {}", count)?;
    if let Some(estimator) = estimator {
        let mut estimator = estimator.lock()?;
        writeln!(out, "\t\testimator state: {}", estimator.state())?;
        writeln!(out, "\t\testimated partition size: {}", estimator.estimate(true).value)?;
    }
    Ok(())
}

/// CSV header of [`write_task_trace`].
pub const TRACE_CSV_HEADER: &str =
    "requested_partition_size,partition_size,partition_duration,function_duration,combine_duration";

fn opt<T: ToString>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

/// Writes one CSV row per partition. Durations are in nanoseconds; missing
/// values are left empty.
pub fn write_task_trace<W: Write>(out: &mut W, task_trace: &TaskTrace) -> Result<()> {
    writeln!(out, "{}", TRACE_CSV_HEADER)?;
    for t in task_trace.partition_traces.iter() {
        writeln!(out, "{},{},{},{},{}",
                 opt(t.requested_partition_size()),
                 t.partition_size,
                 t.partition_duration,
                 opt(t.task_duration),
                 opt(t.combine_duration))?;
    }
    Ok(())
}

/// Exports a call's trace as a CSV file, replacing any existing file.
pub fn export_task_trace<P: AsRef<Path>>(path: P, task_trace: &TaskTrace) -> Result<()> {
    let file = File::create(path)?;
    let mut bw = BufWriter::new(file);
    write_task_trace(&mut bw, task_trace)?;
    bw.flush()?;
    Ok(())
}

#[cfg(test)]
mod profiler_test {
    use super::*;
    use crate::estimator::{EstimatorState, LinearRegressionEstimator};

    fn shared() -> SharedEstimator {
        Mutex::new(Box::new(LinearRegressionEstimator::default()))
    }

    fn counter(len: usize) -> PartitionGenerator<usize> {
        let mut left = len;
        PartitionGenerator::from_fn(move |requested| {
            if left == 0 {
                return Ok(None);
            }
            let n = requested.min(left);
            left -= n;
            Ok(Some((n, n)))
        })
    }

    #[test]
    fn test_fixed_generators_use_unit_sizes() {
        let traces: Vec<PartitionedTaskTrace> = TimedPartitions::new(
                PartitionGenerator::fixed(vec![10, 20, 30]), Sizing::Fixed(7))
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(traces.len(), 3);
        assert!(traces.iter().all(|t| t.partition_size == 1 && t.partition_size_estimate.is_none()));
    }

    #[test]
    fn test_fixed_size() {
        let sizes: Vec<usize> = TimedPartitions::new(counter(10), Sizing::Fixed(3))
            .map(|r| r.unwrap().1.partition_size)
            .collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_initial_size_then_estimator() {
        let estimator = shared();
        let traces: Vec<PartitionedTaskTrace> = TimedPartitions::new(
                counter(200), Sizing::Estimated { estimator: &estimator, initial: Some(5) })
            .take(3)
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(traces[0].partition_size, 5);
        assert!(traces[0].requested_partition_size().is_none());
        // Learning schedule starts at 64, then 8
        assert_eq!(traces[1].requested_partition_size(), Some(64));
        assert_eq!(traces[2].requested_partition_size(), Some(8));
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut it = TimedPartitions::new(counter(10), Sizing::Fixed(0));
        assert!(matches!(it.next(), Some(Err(Error::NonPositivePartitionSize))));
        assert!(it.next().is_none());
    }

    #[test]
    fn test_timed_combine_records_traces() {
        let estimator = shared();
        let results = (1..=5u64).map(|i| Ok((i, PartitionedTaskTrace::new(None, i as usize, 10), 100 * i)));
        let (sum, trace) = timed_combine(|it| it.sum::<u64>(), Some(&estimator), results).unwrap();
        assert_eq!(sum, 15);
        assert_eq!(trace.partition_count(), 5);
        assert_eq!(trace.total_partition_duration(), 50);
        assert_eq!(trace.total_task_duration(), 1500);
        assert!(trace.partition_traces.iter().all(|t| t.total_duration().is_some()));
        assert_eq!(estimator.lock().unwrap().state(), EstimatorState::Running);
    }

    #[test]
    fn test_timed_combine_stops_on_error() {
        let results = vec![
            Ok((1u32, PartitionedTaskTrace::new(None, 1, 0), 1)),
            Err(Error::task("boom")),
            Ok((3u32, PartitionedTaskTrace::new(None, 1, 0), 1)),
        ];
        let mut seen = Vec::new();
        let out = timed_combine(|it| {
            seen.extend(it);
            0u32
        }, None, results.into_iter());
        assert!(matches!(out, Err(Error::Task(_))));
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn test_csv_export() {
        let mut first = PartitionedTaskTrace::new(Some(PartitionSizeEstimate::new(64)), 60, 5);
        first.task_duration = Some(1_000);
        first.combine_duration = Some(20);
        let mut second = PartitionedTaskTrace::new(None, 4, 7);
        second.task_duration = Some(300);
        second.combine_duration = Some(2);
        let trace = TaskTrace { partition_traces: vec![first, second] };

        let file = tempfile::NamedTempFile::new().unwrap();
        export_task_trace(file.path(), &trace).unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec![TRACE_CSV_HEADER, "64,60,5,1000,20", ",4,7,300,2"]);
    }

    #[test]
    fn test_profile_report() {
        let estimator = shared();
        let mut t = PartitionedTaskTrace::new(None, 10, 1_000);
        t.task_duration = Some(9_000);
        t.combine_duration = Some(0);
        let trace = TaskTrace { partition_traces: vec![t.clone(), t] };

        let mut out = Vec::new();
        print_profile_trace(&mut out, "sum", Some(&estimator), &trace).unwrap();
        let report = String::from_utf8(out).unwrap();
        assert!(report.starts_with("sum()\n"));
        assert!(report.contains("total partition count: 2"));
        assert!(report.contains("estimator state: learning"));
        assert!(report.contains("maximum speedup (theoretical): 2.22x"));
        // Dry-run estimate did not advance the learning schedule
        assert_eq!(estimator.lock().unwrap().estimate(false).value, 64);
    }
}
