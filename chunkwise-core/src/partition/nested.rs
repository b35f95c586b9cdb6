use std::sync::Arc;

use crate::args::{ArgValue, NamedArguments};
use crate::error::{Error, Result};
use super::api::{check_names, lookup_all, reassign, split_function, PartitionFunction, SplitFunction};
use super::{flatmap, map, PartitionGenerator};

/// One level of a nested partitioning: the arguments it partitions and the
/// leaf partitioner applied to them.
#[derive(Clone)]
pub struct NestedLevel {
    names: Vec<String>,
    partition_with: PartitionFunction
}

impl NestedLevel {
    /// Partitions `names` jointly with `partition_with`.
    pub fn new<S: AsRef<str>>(names: &[S], partition_with: PartitionFunction) -> Result<Self> {
        Ok(NestedLevel { names: check_names(names)?, partition_with })
    }
}

/// Chains partitioners like nested loops.
///
/// The first level partitions its arguments; every partition it produces is
/// partitioned again by the next level, which may select the same arguments
/// (e.g. rows within groups). The innermost level yields the final
/// partitions.
pub fn nested(levels: Vec<NestedLevel>) -> Result<SplitFunction> {
    if levels.is_empty() {
        return Err(Error::InvalidPartitionOn("empty partition level collection".into()));
    }

    let mut all_names: Vec<String> = Vec::new();
    for level in levels.iter() {
        for name in level.names.iter() {
            if !all_names.contains(name) {
                all_names.push(name.clone());
            }
        }
    }

    let levels = Arc::new(levels);
    Ok(split_function(move |named: &NamedArguments| {
        let (partitioned, non_partitioned) = named.split(&all_names);
        let generator = build_level(levels.clone(), 0, partitioned)?;
        Ok((non_partitioned, generator))
    }))
}

fn build_level(
    levels: Arc<Vec<NestedLevel>>,
    depth: usize,
    args: NamedArguments
) -> Result<PartitionGenerator<NamedArguments>> {
    let level = &levels[depth];
    let values = lookup_all(&args, &level.names)?;
    let generator = (level.partition_with)(values)?;
    let names = level.names.clone();

    if depth + 1 < levels.len() {
        let levels = levels.clone();
        flatmap(move |values: Vec<ArgValue>| {
            build_level(levels.clone(), depth + 1, reassign(&args, &names, values)?)
        }, generator)
    } else {
        Ok(map(move |values| reassign(&args, &names, values), generator))
    }
}
