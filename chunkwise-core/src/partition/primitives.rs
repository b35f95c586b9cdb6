use crate::error::{Error, Result};
use super::{validate_step, NegotiatingGenerator, PartitionGenerator};

/// Applies `f` to every partition, keeping the shape of `generator`.
///
/// ```rust
/// use chunkwise::partition::{map, with_partition_size, PartitionGenerator};
///
/// let doubled = map(|x: u32| Ok(x * 2), PartitionGenerator::fixed(vec![1, 2, 3]));
/// let out: Vec<u32> = with_partition_size(doubled, 1).collect::<Result<_, _>>().unwrap();
/// assert_eq!(out, vec![2, 4, 6]);
/// ```
pub fn map<P, Q, F>(mut f: F, generator: PartitionGenerator<P>) -> PartitionGenerator<Q>
        where P: 'static, Q: 'static, F: FnMut(P) -> Result<Q> + 'static {
    match generator {
        PartitionGenerator::Fixed(it) => {
            PartitionGenerator::Fixed(Box::new(it.map(move |p| p.and_then(|p| f(p)))))
        },
        PartitionGenerator::Negotiating(inner) => {
            PartitionGenerator::negotiating(MapGenerator { inner, f })
        }
    }
}

struct MapGenerator<P, F> {
    inner: Box<dyn NegotiatingGenerator<P>>,
    f: F
}

impl <P, Q, F: FnMut(P) -> Result<Q>> NegotiatingGenerator<Q> for MapGenerator<P, F> {
    fn advance(&mut self, requested: usize) -> Result<Option<(usize, Q)>> {
        match validate_step(self.inner.advance(requested)?)? {
            Some((size, p)) => Ok(Some((size, (self.f)(p)?))),
            None => Ok(None)
        }
    }
}

/// Wraps one already computed partition as a one-shot negotiating generator.
///
/// The requested size is ignored; `size` is reported as is.
pub fn unit<P: 'static>(size: usize, partition: P) -> PartitionGenerator<P> {
    let mut slot = Some(partition);
    PartitionGenerator::from_fn(move |_requested| {
        validate_step(slot.take().map(|p| (size, p)))
    })
}

/// Flattens the inner generators `f` builds from each outer partition.
///
/// The result is fixed-sequence only when the outer generator and the inner
/// ones are. A negotiating outer generator is asked for a size derived from
/// the average number of items its previous partitions expanded into, so the
/// outer and inner chunking converge together.
///
/// Peeks at the first outer partition to pick the result's shape, which is
/// why this returns a `Result`.
pub fn flatmap<P, Q, F>(mut f: F, generator: PartitionGenerator<P>) -> Result<PartitionGenerator<Q>>
        where P: 'static, Q: 'static, F: FnMut(P) -> Result<PartitionGenerator<Q>> + 'static {
    match generator {
        PartitionGenerator::Fixed(mut outer) => {
            let first = match outer.next() {
                Some(p) => f(p?)?,
                None => return Ok(PartitionGenerator::empty())
            };

            match first {
                PartitionGenerator::Fixed(first) => {
                    Ok(PartitionGenerator::Fixed(Box::new(FixedFlatMap {
                        outer, f, current: Some(first)
                    })))
                },
                PartitionGenerator::Negotiating(first) => {
                    Ok(PartitionGenerator::negotiating(FixedOuterFlatMap {
                        outer, f, current: Some(first)
                    }))
                }
            }
        },
        PartitionGenerator::Negotiating(outer) => {
            Ok(PartitionGenerator::negotiating(NegotiatingFlatMap {
                outer,
                f,
                current: None,
                parent_request: 1,
                total_nested_size: 0,
                n_nested: 0
            }))
        }
    }
}

const MIXED_INNER: &str = "flatmap inner generators must all have the same shape";

struct FixedFlatMap<P, Q, F> {
    outer: Box<dyn Iterator<Item = Result<P>>>,
    f: F,
    current: Option<Box<dyn Iterator<Item = Result<Q>>>>
}

impl <P, Q, F> FixedFlatMap<P, Q, F>
        where F: FnMut(P) -> Result<PartitionGenerator<Q>> {

    fn next_inner(&mut self) -> Result<bool> {
        match self.outer.next() {
            None => Ok(false),
            Some(p) => match (self.f)(p?)? {
                PartitionGenerator::Fixed(it) => {
                    self.current = Some(it);
                    Ok(true)
                },
                PartitionGenerator::Negotiating(_) => Err(Error::MixedGenerators(MIXED_INNER))
            }
        }
    }
}

impl <P: 'static, Q, F> Iterator for FixedFlatMap<P, Q, F>
        where F: FnMut(P) -> Result<PartitionGenerator<Q>> {
    type Item = Result<Q>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(it) = self.current.as_mut() {
                if let Some(q) = it.next() {
                    return Some(q);
                }
                self.current = None;
            }

            match self.next_inner() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    // Stop the outer stream once it failed
                    self.outer = Box::new(std::iter::empty());
                    return Some(Err(e))
                }
            }
        }
    }
}

struct FixedOuterFlatMap<P, Q, F> {
    outer: Box<dyn Iterator<Item = Result<P>>>,
    f: F,
    current: Option<Box<dyn NegotiatingGenerator<Q>>>
}

impl <P, Q, F> NegotiatingGenerator<Q> for FixedOuterFlatMap<P, Q, F>
        where F: FnMut(P) -> Result<PartitionGenerator<Q>> {

    fn advance(&mut self, requested: usize) -> Result<Option<(usize, Q)>> {
        loop {
            if let Some(inner) = self.current.as_mut() {
                if let Some(step) = validate_step(inner.advance(requested)?)? {
                    return Ok(Some(step));
                }
                self.current = None;
            }

            match self.outer.next() {
                None => return Ok(None),
                Some(p) => match (self.f)(p?)? {
                    PartitionGenerator::Negotiating(g) => self.current = Some(g),
                    PartitionGenerator::Fixed(_) => return Err(Error::MixedGenerators(MIXED_INNER))
                }
            }
        }
    }
}

struct NestedState<Q> {
    generator: PartitionGenerator<Q>,
    parent_size: usize,
    total_size: usize
}

struct NegotiatingFlatMap<P, Q, F> {
    outer: Box<dyn NegotiatingGenerator<P>>,
    f: F,
    current: Option<NestedState<Q>>,
    parent_request: usize,
    total_nested_size: usize,
    n_nested: usize
}

impl <P, Q, F> NegotiatingGenerator<Q> for NegotiatingFlatMap<P, Q, F>
        where F: FnMut(P) -> Result<PartitionGenerator<Q>> {

    fn advance(&mut self, requested: usize) -> Result<Option<(usize, Q)>> {
        loop {
            if let Some(nested) = self.current.as_mut() {
                let parent_size = nested.parent_size;
                let step = match &mut nested.generator {
                    // Fixed inner partitions count as one item of the parent each
                    PartitionGenerator::Fixed(it) => match it.next() {
                        Some(q) => Some((1, parent_size, q?)),
                        None => None
                    },
                    PartitionGenerator::Negotiating(g) => {
                        let nested_request = divide_request(requested, parent_size as f64);
                        validate_step(g.advance(nested_request)?)?
                            .map(|(n, q)| (n, parent_size * n, q))
                    }
                };

                if let Some((nested_size, size, q)) = step {
                    nested.total_size += nested_size;
                    return Ok(Some((size, q)));
                }

                if let Some(done) = self.current.take() {
                    self.total_nested_size += done.total_size;
                    self.n_nested += 1;
                }
                let avg_nested_size = self.total_nested_size as f64 / self.n_nested as f64;
                self.parent_request = divide_request(requested, avg_nested_size);
                trace!("flatmap requests {} items from the outer generator", self.parent_request);
            }

            match validate_step(self.outer.advance(self.parent_request)?)? {
                None => return Ok(None),
                Some((parent_size, p)) => {
                    self.current = Some(NestedState {
                        generator: (self.f)(p)?,
                        parent_size,
                        total_size: 0
                    });
                }
            }
        }
    }
}

/// `max(1, round(requested / by))`, with an empty divisor requesting 1.
fn divide_request(requested: usize, by: f64) -> usize {
    if by <= 0.0 {
        return 1;
    }
    ((requested as f64 / by).round() as usize).max(1)
}

/// Combines generators in lockstep.
///
/// The result is negotiating when any input is; the same requested size is
/// then forwarded to every negotiating input, which must all report the same
/// actual size. Fixed-sequence inputs are stepped without a request. Stops as
/// soon as any input is exhausted.
pub fn zip<P: 'static>(generators: Vec<PartitionGenerator<P>>) -> Result<PartitionGenerator<Vec<P>>> {
    if generators.is_empty() {
        return Err(Error::Config("zip requires at least one partition generator".into()));
    }

    if generators.iter().any(|g| g.is_negotiating()) {
        return Ok(PartitionGenerator::negotiating(ZipGenerator { children: generators }));
    }

    let mut children: Vec<_> = generators.into_iter()
        .filter_map(|g| match g {
            PartitionGenerator::Fixed(it) => Some(it),
            PartitionGenerator::Negotiating(_) => None
        })
        .collect();

    let mut done = false;
    Ok(PartitionGenerator::Fixed(Box::new(std::iter::from_fn(move || {
        if done {
            return None;
        }
        let mut values = Vec::with_capacity(children.len());
        for child in children.iter_mut() {
            match child.next() {
                Some(Ok(p)) => values.push(p),
                Some(Err(e)) => {
                    done = true;
                    return Some(Err(e));
                },
                None => {
                    done = true;
                    return None;
                }
            }
        }
        Some(Ok(values))
    }))))
}

struct ZipGenerator<P> {
    children: Vec<PartitionGenerator<P>>
}

impl <P> NegotiatingGenerator<Vec<P>> for ZipGenerator<P> {
    fn advance(&mut self, requested: usize) -> Result<Option<(usize, Vec<P>)>> {
        let mut size: Option<usize> = None;
        let mut values = Vec::with_capacity(self.children.len());

        for child in self.children.iter_mut() {
            match child {
                PartitionGenerator::Fixed(it) => match it.next() {
                    Some(p) => values.push(p?),
                    None => return Ok(None)
                },
                PartitionGenerator::Negotiating(g) => match validate_step(g.advance(requested)?)? {
                    Some((n, p)) => {
                        if let Some(expected) = size {
                            if expected != n {
                                return Err(Error::PartitionSizeMismatch { expected, actual: n });
                            }
                        }
                        size = Some(n);
                        values.push(p);
                    },
                    None => return Ok(None)
                }
            }
        }

        Ok(size.map(|n| (n, values)))
    }
}
