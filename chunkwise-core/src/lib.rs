//! chunkwise
//!
//! `chunkwise` runs data-parallel functions over a pluggable backend, tuning
//! the size of the partitions it submits as it goes.
//!
//! What is it?
//! ---
//!
//! A parallel function is a plain function over named arguments, plus a way
//! to split those arguments into partitions and a way to combine the partial
//! results. Each call is then:
//!
//! 1. bound against the function's declared parameters,
//! 2. split into partitions whose size is negotiated with an online
//!    estimator fit on the timings of previous partitions,
//! 3. submitted partition by partition to the current backend, with a
//!    bounded window of in-flight tasks,
//! 4. combined lazily, in submission order, as results come back.
//!
//! Backends are chosen per scope: see [`context`] and [`registry`].
//!
//! Example - Sum of a range
//! ---
//! ```rust
//! use chunkwise::args::{ArgValue, CallArgs, FunctionSignature};
//! use chunkwise::kernel::ParallelFunction;
//! use chunkwise::partition::api::partition_function;
//! use chunkwise::partition::PartitionGenerator;
//! use chunkwise::registry::use_backend_named;
//!
//! let by_chunk = partition_function(|values| {
//!     let xs = values[0].downcast_ref::<Vec<u64>>().cloned().unwrap_or_default();
//!     let mut offset = 0;
//!     Ok(PartitionGenerator::from_fn(move |requested| {
//!         if offset >= xs.len() {
//!             return Ok(None);
//!         }
//!         let end = (offset + requested).min(xs.len());
//!         let chunk = xs[offset..end].to_vec();
//!         let size = end - offset;
//!         offset = end;
//!         Ok(Some((size, vec![ArgValue::new(chunk)])))
//!     }))
//! });
//!
//! let sum = ParallelFunction::builder("sum", FunctionSignature::positional(&["xs"]), |args| {
//!         Ok(args.get_as::<Vec<u64>>("xs")?.iter().sum::<u64>())
//!     })
//!     .partition_on(&["xs"], by_chunk)
//!     .combine_with(|partials| partials.sum())
//!     .build()
//!     .unwrap();
//!
//! let _backend = use_backend_named("local-worker-pool").unwrap();
//! let xs: Vec<u64> = (0..10_000).collect();
//! assert_eq!(sum.call(CallArgs::new().arg(xs)).unwrap(), 49_995_000);
//! ```

#![warn(missing_docs)]

#[macro_use]
extern crate log;

/// Named argument binding
pub mod args;

/// Backend engines, sessions and profiled futures
pub mod backend;

pub mod context;

pub mod error;

/// Partition size estimation
pub mod estimator;

pub mod functions;

pub mod kernel;

pub mod partition;

pub mod profiler;

pub mod registry;

/// Wrapped functions and partition tasks
pub mod task;

pub use crate::args::{ArgValue, CallArgs, FunctionSignature, NamedArguments};
pub use crate::error::{BoxError, Error, Result};
pub use crate::kernel::{ParallelFunction, ParallelFunctionBuilder, PartitionSize};
pub use crate::registry::BackendConfig;
