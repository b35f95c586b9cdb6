use std::collections::HashSet;
use std::sync::Arc;

use crate::args::{ArgValue, NamedArguments};
use crate::error::{Error, Result};
use super::{map, zip, PartitionGenerator};

/// Leaf partitioner: takes argument values and produces partitions of the
/// same arity, one partitioned value per input value.
pub type PartitionFunction = Arc<dyn Fn(Vec<ArgValue>) -> Result<PartitionGenerator<Vec<ArgValue>>> + Send + Sync>;

/// Non-partitioned arguments, and the generator of partitioned ones.
pub type SplitResult = (NamedArguments, PartitionGenerator<NamedArguments>);

/// Call-level partitioning function.
pub type SplitFunction = Arc<dyn Fn(&NamedArguments) -> Result<SplitResult> + Send + Sync>;

/// Lifts a closure into a [`PartitionFunction`].
pub fn partition_function<F>(f: F) -> PartitionFunction
        where F: Fn(Vec<ArgValue>) -> Result<PartitionGenerator<Vec<ArgValue>>> + Send + Sync + 'static {
    Arc::new(f)
}

/// Lifts a closure into a [`SplitFunction`].
pub fn split_function<F>(f: F) -> SplitFunction
        where F: Fn(&NamedArguments) -> Result<SplitResult> + Send + Sync + 'static {
    Arc::new(f)
}

pub(crate) fn check_names<S: AsRef<str>>(names: &[S]) -> Result<Vec<String>> {
    if names.is_empty() {
        return Err(Error::InvalidPartitionOn("empty partition-on value".into()));
    }
    let mut seen = HashSet::new();
    for name in names.iter() {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(Error::InvalidPartitionOn("empty argument name".into()));
        }
        if !seen.insert(name) {
            return Err(Error::InvalidPartitionOn(format!("`{}` listed twice", name)));
        }
    }
    Ok(names.iter().map(|n| n.as_ref().to_owned()).collect())
}

pub(crate) fn lookup_all(args: &NamedArguments, names: &[String]) -> Result<Vec<ArgValue>> {
    let missing: Vec<&str> = names.iter()
        .filter(|n| !args.contains(n))
        .map(|n| n.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(Error::InvalidPartitionOn(format!(
            "missing partition argument(s): {}", missing.join(", "))));
    }
    Ok(names.iter().filter_map(|n| args.get(n).cloned()).collect())
}

/// Replaces `names` in `args` with the values of one partition.
pub(crate) fn reassign(args: &NamedArguments, names: &[String], values: Vec<ArgValue>) -> Result<NamedArguments> {
    if values.len() != names.len() {
        return Err(Error::Config(format!(
            "partition function returned {} value(s) for {} argument(s)", values.len(), names.len())));
    }
    args.reassigned(names.iter().cloned().zip(values))
}

/// Applies one partitioner per argument and zips the results.
///
/// ```rust
/// use chunkwise::partition::api::{per_argument, partition_function};
/// use chunkwise::partition::PartitionGenerator;
///
/// let identity = partition_function(|values| Ok(PartitionGenerator::fixed(vec![values])));
/// let split = per_argument(vec![("xs", identity)]).unwrap();
/// ```
pub fn per_argument<S: AsRef<str>>(partitions: Vec<(S, PartitionFunction)>) -> Result<SplitFunction> {
    let names = check_names(&partitions.iter().map(|(n, _)| n.as_ref()).collect::<Vec<_>>())?;
    let functions: Vec<PartitionFunction> = partitions.into_iter().map(|(_, f)| f).collect();

    Ok(split_function(move |named: &NamedArguments| {
        let (partitioned, non_partitioned) = named.split(&names);
        let values = lookup_all(&partitioned, &names)?;

        let generators = functions.iter()
            .zip(values)
            .map(|(f, v)| f(vec![v]))
            .collect::<Result<Vec<_>>>()?;

        let names = names.clone();
        let generator = map(move |parts: Vec<Vec<ArgValue>>| {
            let firsts = parts.into_iter()
                .map(|p| p.into_iter().next()
                     .ok_or_else(|| Error::Config("partition function returned no value".into())))
                .collect::<Result<Vec<_>>>()?;
            reassign(&partitioned, &names, firsts)
        }, zip(generators)?);

        Ok((non_partitioned, generator))
    }))
}

/// Applies one partitioner jointly to several arguments.
pub fn multiple_arguments<S: AsRef<str>>(partition_on: &[S], partition_with: PartitionFunction) -> Result<SplitFunction> {
    let names = check_names(partition_on)?;

    Ok(split_function(move |named: &NamedArguments| {
        let (partitioned, non_partitioned) = named.split(&names);
        let values = lookup_all(&partitioned, &names)?;

        let names = names.clone();
        let generator = map(move |values| reassign(&partitioned, &names, values), partition_with(values)?);
        Ok((non_partitioned, generator))
    }))
}

/// Applies one partitioner to every argument, positional first, then
/// keyword, then variadic values.
pub fn all_arguments(partition_with: PartitionFunction) -> SplitFunction {
    split_function(move |named: &NamedArguments| {
        let arg_names: Vec<String> = named.positional().iter().map(|(n, _)| n.clone()).collect();
        let kwarg_names: Vec<String> = named.keyword().keys().cloned().collect();

        let values: Vec<ArgValue> = named.positional().iter().map(|(_, v)| v.clone())
            .chain(named.keyword().values().cloned())
            .chain(named.var_args().iter().cloned())
            .collect();
        let expected = values.len();

        let generator = map(move |mut values: Vec<ArgValue>| {
            if values.len() != expected {
                return Err(Error::Config(format!(
                    "partition function returned {} value(s) for {} argument(s)", values.len(), expected)));
            }
            let var_args = values.split_off(arg_names.len() + kwarg_names.len());
            let kwargs = values.split_off(arg_names.len());
            NamedArguments::from_parts(
                arg_names.iter().cloned().zip(values).collect(),
                kwarg_names.iter().cloned().zip(kwargs).collect(),
                var_args)
        }, partition_with(values)?);

        Ok((NamedArguments::new(), generator))
    })
}
