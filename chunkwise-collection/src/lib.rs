//! chunkwise-collection
//! ---
//! Partitioners and combiners for `Vec` data, ready to plug into
//! `chunkwise` parallel functions.
//!
//! Example - Parallel squares
//! ---
//!
//! ```rust
//! use chunkwise::{CallArgs, FunctionSignature, ParallelFunction};
//! use chunkwise::registry::use_backend_named;
//! use chunkwise_collection::combine::concat;
//! use chunkwise_collection::partition::by_chunk;
//!
//! let squares = ParallelFunction::builder("squares", FunctionSignature::positional(&["xs"]), |args| {
//!         Ok(args.get_as::<Vec<i64>>("xs")?.iter().map(|x| x * x).collect::<Vec<i64>>())
//!     })
//!     .partition_on(&["xs"], by_chunk::<i64>())
//!     .combine_with(concat)
//!     .build()
//!     .unwrap();
//!
//! let _backend = use_backend_named("local-worker-pool").unwrap();
//! let out = squares.call(CallArgs::new().arg((0..1000i64).collect::<Vec<_>>())).unwrap();
//! assert_eq!(out, (0..1000i64).map(|x| x * x).collect::<Vec<_>>());
//! ```

#![warn(missing_docs)]

/// Leaf partitioners over `Vec` arguments
pub mod partition;

/// Combiners of partial results
pub mod combine;
