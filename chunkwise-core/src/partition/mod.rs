//! Partition generators.
//!
//! A partition generator produces the chunks a parallel call is split into.
//! Two shapes exist:
//!
//! * [`PartitionGenerator::Fixed`] yields partitions whose size is decided by
//!   the producer. The consumer only pulls.
//! * [`PartitionGenerator::Negotiating`] is driven by the consumer: every
//!   step hands it a requested size and gets back `(actual_size, partition)`.
//!   The actual size may differ from the request (a trailing remainder, or a
//!   group that cannot be split).
//!
//! The composition primitives in [`primitives`] accept both shapes and keep
//! the result negotiating whenever any input is.

/// map, flatmap, zip and unit
pub mod primitives;

/// Call-level split functions built from leaf partitioners
pub mod api;

/// Multi-level partitioning built on flatmap
pub mod nested;

/// Drives generators outside of a parallel call
pub mod utility;

use crate::error::{Error, Result};

pub use self::primitives::{flatmap, map, unit, zip};
pub use self::utility::{with_partition_size, with_partition_sizes};

/// Producer of size-negotiated partitions.
///
/// Implementations are explicit state objects (current offset, source
/// handle) driven one step at a time.
pub trait NegotiatingGenerator<P> {
    /// Produces the next partition, aiming for `requested` items.
    ///
    /// Returns `Ok(None)` once the source is exhausted.
    fn advance(&mut self, requested: usize) -> Result<Option<(usize, P)>>;
}

struct FnGenerator<F>(F);

impl <P, F: FnMut(usize) -> Result<Option<(usize, P)>>> NegotiatingGenerator<P> for FnGenerator<F> {
    fn advance(&mut self, requested: usize) -> Result<Option<(usize, P)>> {
        (self.0)(requested)
    }
}

/// Fixed-sequence partition stream.
pub type FixedPartitions<P> = Box<dyn Iterator<Item = Result<P>>>;

/// Either shape of partition producer.
pub enum PartitionGenerator<P> {
    /// Producer-sized partitions.
    Fixed(FixedPartitions<P>),

    /// Consumer-sized partitions.
    Negotiating(Box<dyn NegotiatingGenerator<P>>),
}

impl <P: 'static> PartitionGenerator<P> {

    /// Wraps an iterator of ready partitions.
    pub fn fixed<I>(partitions: I) -> Self
            where I: IntoIterator<Item = P>, I::IntoIter: 'static {
        PartitionGenerator::Fixed(Box::new(partitions.into_iter().map(Ok)))
    }

    /// Wraps an iterator whose partitions may fail to materialize.
    pub fn fixed_results<I>(partitions: I) -> Self
            where I: IntoIterator<Item = Result<P>>, I::IntoIter: 'static {
        PartitionGenerator::Fixed(Box::new(partitions.into_iter()))
    }

    /// Wraps a negotiating state object.
    pub fn negotiating<G: NegotiatingGenerator<P> + 'static>(generator: G) -> Self {
        PartitionGenerator::Negotiating(Box::new(generator))
    }

    /// Builds a negotiating generator from a step closure.
    pub fn from_fn<F>(step: F) -> Self
            where F: FnMut(usize) -> Result<Option<(usize, P)>> + 'static {
        PartitionGenerator::Negotiating(Box::new(FnGenerator(step)))
    }

    /// A generator producing nothing.
    pub fn empty() -> Self {
        PartitionGenerator::fixed(Vec::new())
    }

    /// Whether the consumer chooses the partition sizes.
    pub fn is_negotiating(&self) -> bool {
        match self {
            PartitionGenerator::Fixed(_) => false,
            PartitionGenerator::Negotiating(_) => true,
        }
    }
}

/// Checks that a negotiated step reported a usable size.
pub(crate) fn validate_step<P>(step: Option<(usize, P)>) -> Result<Option<(usize, P)>> {
    match step {
        Some((0, _)) => Err(Error::NonPositivePartitionSize),
        other => Ok(other),
    }
}

/// Checks a size about to be requested from a negotiating generator.
pub(crate) fn validate_request(requested: usize) -> Result<usize> {
    if requested == 0 {
        Err(Error::NonPositivePartitionSize)
    } else {
        Ok(requested)
    }
}
