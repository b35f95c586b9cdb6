use crate::error::Result;
use super::{validate_request, validate_step, PartitionGenerator};

/// Runs a generator with a constant requested size, yielding bare partitions.
///
/// Fixed-sequence generators ignore the size.
pub fn with_partition_size<P: 'static>(
    generator: PartitionGenerator<P>,
    size: usize
) -> Box<dyn Iterator<Item = Result<P>>> {
    with_partition_sizes(generator, move || size)
}

/// Runs a generator, asking `next_size` for the size of every step.
pub fn with_partition_sizes<P, F>(
    generator: PartitionGenerator<P>,
    mut next_size: F
) -> Box<dyn Iterator<Item = Result<P>>>
        where P: 'static, F: FnMut() -> usize + 'static {
    match generator {
        PartitionGenerator::Fixed(it) => it,
        PartitionGenerator::Negotiating(mut g) => {
            let mut done = false;
            Box::new(std::iter::from_fn(move || {
                if done {
                    return None;
                }
                let step = validate_request(next_size())
                    .and_then(|size| g.advance(size))
                    .and_then(validate_step);
                match step {
                    Ok(Some((_, p))) => Some(Ok(p)),
                    Ok(None) => {
                        done = true;
                        None
                    },
                    Err(e) => {
                        done = true;
                        Some(Err(e))
                    }
                }
            }))
        }
    }
}
