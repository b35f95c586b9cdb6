use std::any::Any;
use std::ops::Range;
use std::sync::Arc;

use chunkwise::partition::api::{partition_function, PartitionFunction};
use chunkwise::partition::PartitionGenerator;
use chunkwise::{ArgValue, Error, Result};

type LenFn = Arc<dyn Fn(&ArgValue) -> Option<usize> + Send + Sync>;
type SliceFn = Arc<dyn Fn(&ArgValue, Range<usize>) -> Option<ArgValue> + Send + Sync>;

/// Measures and slices one kind of argument value.
#[derive(Clone)]
pub struct Chunker {
    len: LenFn,
    slice: SliceFn
}

impl Chunker {
    /// Chunker for `Vec<T>` arguments; slices are `Vec<T>` too.
    pub fn vec<T: Any + Clone + Send + Sync>() -> Self {
        Chunker {
            len: Arc::new(|v: &ArgValue| v.downcast_ref::<Vec<T>>().map(|xs| xs.len())),
            slice: Arc::new(|v: &ArgValue, range: Range<usize>| {
                v.downcast_ref::<Vec<T>>()
                    .and_then(|xs| xs.get(range))
                    .map(|part| ArgValue::new(part.to_vec()))
            })
        }
    }

    /// Chunker for any argument type, given how to measure and slice it.
    pub fn new<A, L, S, B>(len: L, slice: S) -> Self
            where A: Any,
                  B: Any + Send + Sync,
                  L: Fn(&A) -> usize + Send + Sync + 'static,
                  S: Fn(&A, Range<usize>) -> B + Send + Sync + 'static {
        Chunker {
            len: Arc::new(move |v: &ArgValue| v.downcast_ref::<A>().map(|a| len(a))),
            slice: Arc::new(move |v: &ArgValue, range| v.downcast_ref::<A>().map(|a| ArgValue::new(slice(a, range))))
        }
    }
}

/// Arguments bound to their chunkers, all cut at the same offsets.
struct Chunked {
    values: Vec<(ArgValue, Chunker)>,
    len: usize
}

impl Chunked {
    fn new(values: Vec<ArgValue>, chunkers: &[Chunker]) -> Result<Self> {
        if values.len() != chunkers.len() {
            return Err(Error::Config(format!(
                "{} chunker(s) given for {} argument(s)", chunkers.len(), values.len())));
        }
        let lens = values.iter()
            .zip(chunkers.iter())
            .enumerate()
            .map(|(idx, (v, c))| (c.len)(v)
                 .ok_or_else(|| Error::task(format!("argument {} has an unexpected type", idx))))
            .collect::<Result<Vec<usize>>>()?;
        let len = lens.into_iter().min().unwrap_or(0);
        Ok(Chunked { values: values.into_iter().zip(chunkers.iter().cloned()).collect(), len })
    }

    fn slice(&self, range: Range<usize>) -> Result<Vec<ArgValue>> {
        self.values.iter()
            .map(|(v, c)| (c.slice)(v, range.clone())
                 .ok_or_else(|| Error::task(format!("cannot slice {:?}", range))))
            .collect()
    }
}

fn vec_chunkers<T: Any + Clone + Send + Sync>(n: usize) -> Vec<Chunker> {
    (0..n).map(|_| Chunker::vec::<T>()).collect()
}

/// Cuts every argument, all `Vec<T>`, into chunks of the requested size.
///
/// Arguments are zipped: the shortest one sets the length, and the last
/// chunk holds the remainder.
pub fn by_chunk<T: Any + Clone + Send + Sync>() -> PartitionFunction {
    partition_function(|values: Vec<ArgValue>| {
        let chunkers = vec_chunkers::<T>(values.len());
        chunks(Chunked::new(values, &chunkers)?)
    })
}

/// Same as [`by_chunk`], with one chunker per argument.
pub fn by_chunk_with(chunkers: Vec<Chunker>) -> PartitionFunction {
    partition_function(move |values: Vec<ArgValue>| chunks(Chunked::new(values, &chunkers)?))
}

fn chunks(chunked: Chunked) -> Result<PartitionGenerator<Vec<ArgValue>>> {
    let mut offset = 0;
    Ok(PartitionGenerator::from_fn(move |requested| {
        if offset >= chunked.len {
            return Ok(None);
        }
        let end = (offset + requested).min(chunked.len);
        let parts = chunked.slice(offset..end)?;
        let size = end - offset;
        offset = end;
        Ok(Some((size, parts)))
    }))
}

/// One partition per position, every argument sliced to a single item.
///
/// The partition size is decided here, so requested sizes are ignored.
pub fn by_item<T: Any + Clone + Send + Sync>() -> PartitionFunction {
    partition_function(|values: Vec<ArgValue>| {
        let chunkers = vec_chunkers::<T>(values.len());
        let chunked = Chunked::new(values, &chunkers)?;
        let len = chunked.len;
        Ok(PartitionGenerator::fixed_results((0..len).map(move |i| chunked.slice(i..i + 1))))
    })
}

/// Chunks runs of consecutive items sharing a key, never splitting a run.
///
/// Keys are computed on the first argument; every argument is `Vec<T>`.
/// Whole runs are added until the requested size is reached, so a partition
/// may be larger than requested.
pub fn by_key_group<T, K, F>(key: F) -> PartitionFunction
        where T: Any + Clone + Send + Sync,
              K: PartialEq,
              F: Fn(&T) -> K + Send + Sync + 'static {
    let key = Arc::new(key);
    partition_function(move |values: Vec<ArgValue>| {
        let bounds = match values.first().and_then(|v| v.downcast_ref::<Vec<T>>()) {
            Some(xs) => run_ends(xs, key.as_ref()),
            None if values.is_empty() => Vec::new(),
            None => return Err(Error::task("first argument has an unexpected type"))
        };
        let chunkers = vec_chunkers::<T>(values.len());
        let chunked = Chunked::new(values, &chunkers)?;
        let len = chunked.len;
        let ends: Vec<usize> = bounds.into_iter().map(|e| e.min(len)).filter(|e| *e > 0).collect();

        let mut offset = 0;
        let mut next_run = 0;
        Ok(PartitionGenerator::from_fn(move |requested| {
            if offset >= len {
                return Ok(None);
            }
            let mut end = offset;
            while end - offset < requested && next_run < ends.len() {
                end = ends[next_run];
                next_run += 1;
            }
            let parts = chunked.slice(offset..end)?;
            let size = end - offset;
            offset = end;
            Ok(Some((size, parts)))
        }))
    })
}

/// Exclusive end index of every run of equal keys.
fn run_ends<T, K: PartialEq, F: Fn(&T) -> K + ?Sized>(xs: &[T], key: &F) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut current: Option<K> = None;
    for (i, x) in xs.iter().enumerate() {
        let k = key(x);
        if current.as_ref().map(|c| *c != k).unwrap_or(false) {
            ends.push(i);
        }
        current = Some(k);
    }
    if !xs.is_empty() {
        ends.push(xs.len());
    }
    ends
}
