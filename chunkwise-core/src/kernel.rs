//! Parallel functions: binding, partitioning, submission, combining and
//! reporting of one call.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::args::{ArgValue, CallArgs, FunctionSignature, NamedArguments};
use crate::backend::BackendEngine;
use crate::context;
use crate::error::{BoxError, Error, Result};
use crate::estimator::{default_estimator_factory, EstimatorFactory};
use crate::partition::api::{multiple_arguments, PartitionFunction, SplitFunction};
use crate::profiler::{
    export_task_trace, print_profile_trace, timed, timed_combine, SharedEstimator, Sizing, TaskTrace,
    TimedPartitions
};
use crate::task::{
    call_function, partition_task, run_function_in_worker, wrap_function, SessionHandle, SubmissionStream,
    WrappedFunction
};

/// Folds the streamed partial results of a call into one value.
pub type Combiner<R> = Arc<dyn Fn(&mut dyn Iterator<Item = R>) -> R + Send + Sync>;

/// A partition size given by the user.
#[derive(Clone)]
pub enum PartitionSize {
    /// Same size for every call.
    Constant(usize),
    /// Size computed from each call's bound arguments.
    PerCall(Arc<dyn Fn(&NamedArguments) -> usize + Send + Sync>)
}

impl PartitionSize {
    /// Computes the size from each call's bound arguments.
    pub fn per_call<F>(f: F) -> Self
            where F: Fn(&NamedArguments) -> usize + Send + Sync + 'static {
        PartitionSize::PerCall(Arc::new(f))
    }

    fn resolve(&self, args: &NamedArguments) -> usize {
        match self {
            PartitionSize::Constant(size) => *size,
            PartitionSize::PerCall(f) => f(args)
        }
    }
}

impl From<usize> for PartitionSize {
    fn from(size: usize) -> Self {
        PartitionSize::Constant(size)
    }
}

impl fmt::Debug for PartitionSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PartitionSize::Constant(size) => write!(f, "Constant({})", size),
            PartitionSize::PerCall(_) => write!(f, "PerCall(..)")
        }
    }
}

/// A function whose calls are split into partitions, run on the current
/// backend and combined.
///
/// The estimator, when partition sizes are negotiated, lives as long as the
/// function so every call refines the previous calls' model.
///
/// ```
/// use chunkwise::args::{CallArgs, FunctionSignature};
/// use chunkwise::kernel::ParallelFunction;
/// use chunkwise::partition::api::partition_function;
/// use chunkwise::partition::PartitionGenerator;
///
/// let by_item = partition_function(|values| {
///     let xs = values[0].downcast_ref::<Vec<u64>>().cloned().unwrap_or_default();
///     Ok(PartitionGenerator::fixed(xs.into_iter().map(|x| vec![chunkwise::args::ArgValue::new(vec![x])])))
/// });
///
/// let total = ParallelFunction::builder("total", FunctionSignature::positional(&["xs"]), |args| {
///         Ok(args.get_as::<Vec<u64>>("xs")?.iter().sum::<u64>())
///     })
///     .partition_on(&["xs"], by_item)
///     .combine_with(|results| results.sum())
///     .build()
///     .unwrap();
///
/// // No backend is set: the function runs as if it was not wrapped
/// assert_eq!(total.call(CallArgs::new().arg(vec![1u64, 2, 3])).unwrap(), 6);
/// ```
pub struct ParallelFunction<R> {
    name: String,
    signature: FunctionSignature,
    function: WrappedFunction<R>,
    split: SplitFunction,
    combine_with: Combiner<R>,
    fixed_partition_size: Option<PartitionSize>,
    initial_partition_size: Option<PartitionSize>,
    profile: bool,
    trace_export: Option<PathBuf>,
    estimator: Option<SharedEstimator>
}

impl <R: Send + 'static> ParallelFunction<R> {
    /// Starts building a parallel function named `name`, wrapping
    /// `function` whose parameters are declared by `signature`.
    pub fn builder<F>(name: &str, signature: FunctionSignature, function: F) -> ParallelFunctionBuilder<R>
            where F: Fn(&NamedArguments) -> std::result::Result<R, BoxError> + Send + Sync + 'static {
        ParallelFunctionBuilder {
            name: name.to_owned(),
            signature,
            function: wrap_function(function),
            split: None,
            partition_on: None,
            combine_with: None,
            fixed_partition_size: None,
            initial_partition_size: None,
            profile: false,
            trace_export: None,
            estimator_factory: None
        }
    }

    /// Name used in logs and reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameters of the wrapped function.
    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    /// The partition size estimator, absent with a fixed partition size.
    pub fn estimator(&self) -> Option<&SharedEstimator> {
        self.estimator.as_ref()
    }

    /// Calls the wrapped function directly, without partitioning.
    pub fn call_unwrapped(&self, call: CallArgs) -> Result<R> {
        let args = self.signature.assign(call)?;
        call_function(&self.function, &args)
    }

    /// Runs one call on the current backend.
    ///
    /// Without a backend, or when nested inside a worker of a backend that
    /// does not allow nested tasks, the function runs unwrapped.
    pub fn call(&self, call: CallArgs) -> Result<R> {
        let backend = context::current_backend();
        let allows_nested_tasks = backend.as_ref().map(|b| b.allows_nested_tasks()).unwrap_or(false);

        // Workers of non-nesting backends have no current backend, so this
        // check must come first
        if context::in_worker() && !allows_nested_tasks {
            debug!("backend does not support nested parallelism, running `{}` sequentially", self.name);
            return self.call_unwrapped(call);
        }

        let backend = match backend {
            Some(backend) => backend,
            None if context::has_backend_scope() => {
                debug!("parallelism disabled, running `{}(...)` sequentially", self.name);
                return self.call_unwrapped(call);
            },
            None => {
                warn!("no parallel backend engine set, running `{}(...)` sequentially", self.name);
                return self.call_unwrapped(call);
            }
        };

        let args = self.signature.assign(call)?;
        let (non_partitioned, generator) = (self.split)(&args)?;
        let partitions = TimedPartitions::new(generator, self.sizing(&args)?);

        let nested_backend = if allows_nested_tasks { Some(backend.clone()) } else { None };
        let (combined, task_trace) = self.run_partitions(non_partitioned, partitions, backend.as_ref(), nested_backend)?;

        self.report(&task_trace)?;
        info!("ran `{}(...)` with {} sub-task(s) using backend {}",
              self.name, task_trace.partition_count(), backend.name());
        Ok(combined)
    }

    fn sizing(&self, args: &NamedArguments) -> Result<Sizing> {
        if let Some(fixed) = self.fixed_partition_size.as_ref() {
            return Ok(Sizing::Fixed(fixed.resolve(args)));
        }
        let estimator = self.estimator.as_ref()
            .ok_or_else(|| Error::Config("no partition size estimator".into()))?;
        Ok(Sizing::Estimated {
            estimator,
            initial: self.initial_partition_size.as_ref().map(|s| s.resolve(args))
        })
    }

    fn run_partitions<'a>(
        &'a self,
        non_partitioned: NamedArguments,
        mut partitions: TimedPartitions<'a, NamedArguments>,
        backend: &dyn BackendEngine,
        nested_backend: Option<Arc<dyn BackendEngine>>
    ) -> Result<(R, TaskTrace)> {
        let estimator = self.estimator.as_ref();

        let mut head = Vec::with_capacity(2);
        while head.len() < 2 {
            match partitions.next() {
                Some(partition) => head.push(partition?),
                None => break
            }
        }

        // Too little work to pay for the parallel overhead
        if head.len() < 2 {
            debug!("{} partition(s), running `{}` in the current thread", head.len(), self.name);
            let function = &self.function;
            let results = head.into_iter().map(|(partition, trace)| {
                let (r, duration) = timed(|| run_function_in_worker(function, &non_partitioned, &partition, None));
                r.map(|r| (r, trace, duration))
            });
            return timed_combine(|it| (self.combine_with)(it), estimator, results);
        }

        let mut session = backend.session()?;
        let preloaded = session.preload_value(ArgValue::new(non_partitioned))?;
        let function = self.function.clone();
        let tasks = head.into_iter().map(Ok).chain(partitions).map(move |partition| {
            partition.map(|(args, trace)| {
                (partition_task(function.clone(), preloaded.clone(), args, nested_backend.clone()), trace)
            })
        });
        let stream = SubmissionStream::new(SessionHandle::Owned(session), tasks, None);
        timed_combine(|it| (self.combine_with)(it), estimator, stream)
    }

    fn report(&self, task_trace: &TaskTrace) -> Result<()> {
        if self.profile {
            let stderr = io::stderr();
            let mut out = stderr.lock();
            print_profile_trace(&mut out, &self.name, self.estimator.as_ref(), task_trace)?;
        }
        if let Some(path) = self.trace_export.as_ref() {
            export_task_trace(path, task_trace)?;
        }
        Ok(())
    }
}

/// Configures a [`ParallelFunction`].
pub struct ParallelFunctionBuilder<R> {
    name: String,
    signature: FunctionSignature,
    function: WrappedFunction<R>,
    split: Option<SplitFunction>,
    partition_on: Option<(Vec<String>, PartitionFunction)>,
    combine_with: Option<Combiner<R>>,
    fixed_partition_size: Option<PartitionSize>,
    initial_partition_size: Option<PartitionSize>,
    profile: bool,
    trace_export: Option<PathBuf>,
    estimator_factory: Option<EstimatorFactory>
}

impl <R: Send + 'static> ParallelFunctionBuilder<R> {
    /// Splits calls with a call-level split function.
    pub fn split(mut self, split: SplitFunction) -> Self {
        self.split = Some(split);
        self
    }

    /// Splits calls by partitioning the named arguments jointly.
    pub fn partition_on<S: AsRef<str>>(mut self, names: &[S], partition_with: PartitionFunction) -> Self {
        self.partition_on = Some((names.iter().map(|n| n.as_ref().to_owned()).collect(), partition_with));
        self
    }

    /// Folds the partial results, in partition order, into the call's result.
    pub fn combine_with<F>(mut self, combine_with: F) -> Self
            where F: Fn(&mut dyn Iterator<Item = R>) -> R + Send + Sync + 'static {
        self.combine_with = Some(Arc::new(combine_with));
        self
    }

    /// Requests partitions of this size instead of estimating one.
    pub fn fixed_partition_size<S: Into<PartitionSize>>(mut self, size: S) -> Self {
        self.fixed_partition_size = Some(size.into());
        self
    }

    /// Size requested for the first partition of every call.
    pub fn initial_partition_size<S: Into<PartitionSize>>(mut self, size: S) -> Self {
        self.initial_partition_size = Some(size.into());
        self
    }

    /// Prints a timing summary to stderr after every call.
    pub fn profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }

    /// Exports every call's partition traces as CSV to this path.
    pub fn trace_export<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.trace_export = Some(path.into());
        self
    }

    /// Replaces the default linear regression estimator.
    pub fn estimator_factory(mut self, factory: EstimatorFactory) -> Self {
        self.estimator_factory = Some(factory);
        self
    }

    /// Validates the options and builds the function.
    ///
    /// Exactly one of `split` and `partition_on` must be set, as well as
    /// `combine_with`.
    pub fn build(self) -> Result<ParallelFunction<R>> {
        self.signature.validate()?;

        let split = match (self.split, self.partition_on) {
            (Some(_), Some(_)) => return Err(Error::MutuallyExclusiveOptions { first: "split", second: "partition_on" }),
            (None, None) => return Err(Error::Config("either `split` or `partition_on` must be set".into())),
            (Some(split), None) => split,
            (None, Some((names, partition_with))) => {
                let undeclared: Vec<&str> = names.iter()
                    .filter(|n| !self.signature.parameters().iter().any(|p| &p.name == *n))
                    .map(|n| n.as_str())
                    .collect();
                if !undeclared.is_empty() && !self.signature.has_var_kwargs() {
                    return Err(Error::InvalidPartitionOn(format!(
                        "`{}` is not a parameter of `{}`", undeclared.join("`, `"), self.name)));
                }
                multiple_arguments(&names, partition_with)?
            }
        };

        let combine_with = self.combine_with
            .ok_or_else(|| Error::Config("`combine_with` must be set".into()))?;

        if self.fixed_partition_size.is_some() && self.initial_partition_size.is_some() {
            return Err(Error::MutuallyExclusiveOptions {
                first: "initial_partition_size",
                second: "fixed_partition_size"
            });
        }

        let estimator = if self.fixed_partition_size.is_none() {
            let factory = self.estimator_factory.unwrap_or_else(default_estimator_factory);
            Some(Mutex::new(factory()))
        } else {
            None
        };

        Ok(ParallelFunction {
            name: self.name,
            signature: self.signature,
            function: self.function,
            split,
            combine_with,
            fixed_partition_size: self.fixed_partition_size,
            initial_partition_size: self.initial_partition_size,
            profile: self.profile,
            trace_export: self.trace_export,
            estimator
        })
    }
}
