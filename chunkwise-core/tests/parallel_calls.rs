use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use chunkwise::backend::{BackendEngine, ClusterBackend, LocalWorkerPool, SequentialBackend};
use chunkwise::context::set_backend;
use chunkwise::partition::api::{partition_function, PartitionFunction};
use chunkwise::partition::PartitionGenerator;
use chunkwise::registry::{use_backend, BackendConfig};
use chunkwise::{ArgValue, CallArgs, Error, FunctionSignature, ParallelFunction};

fn by_chunk<T: Clone + Send + Sync + 'static>() -> PartitionFunction {
    partition_function(|values: Vec<ArgValue>| {
        let xs = values[0].downcast_arc::<Vec<T>>()
            .ok_or_else(|| Error::task("unexpected argument type"))?;
        let mut offset = 0;
        Ok(PartitionGenerator::from_fn(move |requested| {
            if offset >= xs.len() {
                return Ok(None);
            }
            let end = (offset + requested).min(xs.len());
            let chunk = xs[offset..end].to_vec();
            let size = end - offset;
            offset = end;
            Ok(Some((size, vec![ArgValue::new(chunk)])))
        }))
    })
}

fn sum_function() -> ParallelFunction<u64> {
    ParallelFunction::builder("sum", FunctionSignature::positional(&["xs"]), |args| {
            Ok(args.get_as::<Vec<u64>>("xs")?.iter().sum::<u64>())
        })
        .partition_on(&["xs"], by_chunk::<u64>())
        .combine_with(|partials| partials.sum())
        .build()
        .unwrap()
}

#[test]
fn test_sum_of_range_on_every_backend() {
    let _ = env_logger::builder().is_test(true).try_init();
    let sum = sum_function();
    let configs = vec![
        BackendConfig::SequentialInProcess,
        BackendConfig::LocalWorkerPool { max_workers: 4, is_process_based: false },
        BackendConfig::ClusterLocal { n_workers: 4, allows_nested_tasks: true, max_idle_clients: 2 },
    ];
    for config in configs.iter() {
        let _guard = use_backend(config).unwrap();
        for n in [0u64, 1, 2, 3, 100, 12_345].iter() {
            let xs: Vec<u64> = (0..*n).collect();
            let expected = if *n == 0 { 0 } else { n * (n - 1) / 2 };
            assert_eq!(sum.call(CallArgs::new().arg(xs)).unwrap(), expected, "{} on {}", n, config.name());
        }
    }
    // The estimator kept learning across calls and backends
    assert!(sum.estimator().is_some());
}

#[test]
fn test_none_backend_is_bit_identical() {
    let mean = ParallelFunction::builder("mean", FunctionSignature::positional(&["xs"]), |args| {
            let xs = args.get_as::<Vec<f64>>("xs")?;
            Ok(xs.iter().map(|x| x / 3.0).sum::<f64>())
        })
        .partition_on(&["xs"], by_chunk::<f64>())
        .combine_with(|partials| partials.sum())
        .fixed_partition_size(7)
        .build()
        .unwrap();

    let xs: Vec<f64> = (0..1000).map(|i| (i as f64).sqrt()).collect();
    let direct = mean.call_unwrapped(CallArgs::new().arg(xs.clone())).unwrap();

    let _guard = use_backend(&BackendConfig::None).unwrap();
    assert_eq!(mean.call(CallArgs::new().arg(xs)).unwrap().to_bits(), direct.to_bits());
}

#[test]
fn test_failing_partition_cancels_the_rest() {
    let counters: Arc<Vec<AtomicUsize>> = Arc::new((0..10).map(|_| AtomicUsize::new(0)).collect());
    let c = counters.clone();
    let f = ParallelFunction::builder("fifth_fails", FunctionSignature::positional(&["xs"]), move |args| {
            let xs = args.get_as::<Vec<usize>>("xs")?;
            for x in xs.iter() {
                if *x == 4 {
                    return Err(format!("item {} failed", x).into());
                }
                c[*x].fetch_add(1, Ordering::SeqCst);
            }
            Ok(xs.len())
        })
        .partition_on(&["xs"], by_chunk::<usize>())
        .combine_with(|partials| partials.sum())
        .fixed_partition_size(1)
        .build()
        .unwrap();

    let _guard = set_backend(Some(Arc::new(SequentialBackend::new())));
    let err = f.call(CallArgs::new().arg((0..10).collect::<Vec<usize>>())).unwrap_err();
    assert!(matches!(err, Error::Task(_)));
    for (i, counter) in counters.iter().enumerate() {
        let expected = if i < 4 { 1 } else { 0 };
        assert_eq!(counter.load(Ordering::SeqCst), expected, "partition {}", i);
    }
}

/// Blocks the partitions that reach it until opened.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cond: Condvar
}

impl Gate {
    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }

    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

/// Partition 4 fails; later partitions that get to run wait on the gate
/// before counting themselves.
fn fifth_fails_behind_gate(
    counters: Arc<Vec<AtomicUsize>>,
    started: Arc<AtomicUsize>,
    gate: Arc<Gate>
) -> ParallelFunction<usize> {
    ParallelFunction::builder("fifth_fails_behind_gate", FunctionSignature::positional(&["xs"]), move |args| {
            let xs = args.get_as::<Vec<usize>>("xs")?;
            for x in xs.iter() {
                if *x == 4 {
                    return Err(format!("item {} failed", x).into());
                }
                if *x > 4 {
                    started.fetch_add(1, Ordering::SeqCst);
                    gate.wait();
                }
                counters[*x].fetch_add(1, Ordering::SeqCst);
            }
            Ok(xs.len())
        })
        .partition_on(&["xs"], by_chunk::<usize>())
        .combine_with(|partials| partials.sum())
        .fixed_partition_size(1)
        .build()
        .unwrap()
}

fn check_failure_cancels_in_flight(backend: Arc<dyn BackendEngine>, workers: usize) {
    let counters: Arc<Vec<AtomicUsize>> = Arc::new((0..10).map(|_| AtomicUsize::new(0)).collect());
    let started = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Gate::default());
    let f = fifth_fails_behind_gate(counters.clone(), started.clone(), gate.clone());

    let guard = set_backend(Some(backend));
    // Returns while the later partitions are still held at the gate
    let err = f.call(CallArgs::new().arg((0..10).collect::<Vec<usize>>())).unwrap_err();
    assert!(matches!(err, Error::Task(_)), "{:?}", err);
    for (i, counter) in counters.iter().enumerate() {
        let expected = if i < 4 { 1 } else { 0 };
        assert_eq!(counter.load(Ordering::SeqCst), expected, "partition {}", i);
    }

    gate.open();
    let deadline = Instant::now() + Duration::from_secs(5);
    let finished = || counters[5..].iter().map(|c| c.load(Ordering::SeqCst)).sum::<usize>();
    while finished() < started.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    drop(guard);

    // Only partitions already holding a worker when the failure was seen
    // ran; the others were canceled before starting
    let ran = started.load(Ordering::SeqCst);
    assert!(ran <= workers, "{} partitions ran past the failure", ran);
    assert!(finished() <= ran);
    assert!(counters[5 + workers..].iter().all(|c| c.load(Ordering::SeqCst) == 0));
}

#[test]
fn test_failure_cancels_in_flight_partitions_on_worker_pool() {
    check_failure_cancels_in_flight(Arc::new(LocalWorkerPool::new(3, false).unwrap()), 3);
}

#[test]
fn test_failure_cancels_in_flight_partitions_on_cluster() {
    check_failure_cancels_in_flight(Arc::new(ClusterBackend::local(3, true, 1).unwrap()), 3);
}

fn nested_functions() -> ParallelFunction<Vec<bool>> {
    let inner = Arc::new(
        ParallelFunction::builder("inner", FunctionSignature::positional(&["xs"]), |_| {
                Ok(vec![thread::current().id()])
            })
            .partition_on(&["xs"], by_chunk::<u8>())
            .combine_with(|ids| ids.flatten().collect::<Vec<ThreadId>>())
            .fixed_partition_size(1)
            .build()
            .unwrap());

    ParallelFunction::builder("outer", FunctionSignature::positional(&["xs"]), move |_| {
            let parent = thread::current().id();
            let children = inner.call(CallArgs::new().arg(vec![1u8, 2, 3]))?;
            Ok(children.into_iter().map(|id| id == parent).collect::<Vec<bool>>())
        })
        .partition_on(&["xs"], by_chunk::<u8>())
        .combine_with(|flags| flags.flatten().collect::<Vec<bool>>())
        .fixed_partition_size(1)
        .build()
        .unwrap()
}

#[test]
fn test_nested_calls_stay_in_the_worker() {
    let outer = nested_functions();
    let backends: Vec<Arc<dyn BackendEngine>> = vec![
        Arc::new(SequentialBackend::new()),
        Arc::new(LocalWorkerPool::new(2, false).unwrap()),
    ];
    for backend in backends {
        let _guard = set_backend(Some(backend));
        // The inner call runs unwrapped: one result per outer partition
        let same_thread = outer.call(CallArgs::new().arg(vec![0u8; 4])).unwrap();
        assert_eq!(same_thread, vec![true; 4]);
    }
}

#[test]
fn test_nested_calls_spread_on_cluster() {
    let outer = nested_functions();
    let _guard = set_backend(Some(Arc::new(ClusterBackend::local(4, true, 2).unwrap())));
    let same_thread = outer.call(CallArgs::new().arg(vec![0u8; 4])).unwrap();
    assert_eq!(same_thread, vec![false; 12]);
}

#[test]
fn test_cluster_without_nesting() {
    let outer = nested_functions();
    let _guard = set_backend(Some(Arc::new(ClusterBackend::local(4, false, 2).unwrap())));
    let same_thread = outer.call(CallArgs::new().arg(vec![0u8; 4])).unwrap();
    assert_eq!(same_thread, vec![true; 4]);
}

fn busy(active: &AtomicUsize, peak: &AtomicUsize) {
    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
    peak.fetch_max(now, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(10));
    active.fetch_sub(1, Ordering::SeqCst);
}

#[test]
fn test_nested_calls_share_cluster_workers() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (a, p) = (active.clone(), peak.clone());
    let inner = Arc::new(
        ParallelFunction::builder("inner", FunctionSignature::positional(&["xs"]), move |args| {
                busy(&a, &p);
                Ok(args.get_as::<Vec<u8>>("xs")?.len())
            })
            .partition_on(&["xs"], by_chunk::<u8>())
            .combine_with(|counts| counts.sum())
            .fixed_partition_size(1)
            .build()
            .unwrap());

    let (a, p) = (active.clone(), peak.clone());
    let outer = ParallelFunction::builder("outer", FunctionSignature::positional(&["xs"]), move |_| {
            busy(&a, &p);
            Ok(inner.call(CallArgs::new().arg(vec![0u8; 4]))?)
        })
        .partition_on(&["xs"], by_chunk::<u8>())
        .combine_with(|counts| counts.sum())
        .fixed_partition_size(1)
        .build()
        .unwrap();

    let _guard = set_backend(Some(Arc::new(ClusterBackend::local(2, true, 2).unwrap())));
    assert_eq!(outer.call(CallArgs::new().arg(vec![0u8; 4])).unwrap(), 16);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "{} tasks ran at once on 2 workers", peak);
}
