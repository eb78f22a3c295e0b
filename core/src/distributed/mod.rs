//! # Distributed Training
//!
//! Communication and data-parallel coordination.
//!
//! ## Data Parallelism (DP)
//! Every process holds a replica of the model and sees a different slice of
//! the data. After the backward pass, gradients are averaged across the
//! group with an **All-Reduce** so every replica applies the same update.
//!
//! This module provides two wrappers:
//!
//! * [`DataParallel`](ddp::DataParallel): intercepts each gradient as it is
//!   produced, replaces the native buffer with an empty placeholder, and
//!   all-reduces it on a [`CommStream`](stream::CommStream) that overlaps with
//!   the rest of backprop. Simple, but every full gradient stays alive until
//!   it is copied out.
//! * [`ChunkedDataParallel`](zero_ddp::ChunkedDataParallel): routes
//!   parameters and gradients through a
//!   [`ChunkManager`](crate::chunk::ChunkManager). Reduction and release are
//!   fused into the gradient callback, so peak memory is bounded by the
//!   chunks in flight rather than the full gradient set.
//!
//! ## Collectives
//!
//! * [`CollectiveBackend`](backend::CollectiveBackend): the interface for
//!   communication (all-reduce, reduce-scatter, all-gather, broadcast).
//! * [`CpuBackend`](cpu_backend::CpuBackend): ring algorithms over channels,
//!   one thread per rank. Good for tests and for understanding the data
//!   movement without a GPU cluster.

pub mod backend;
pub mod cpu_backend;
pub mod ddp;
pub mod stream;
pub mod zero_ddp;

pub use backend::{CollectiveBackend, ReduceOp};
pub use cpu_backend::CpuBackend;
pub use ddp::DataParallel;
pub use stream::CommStream;
pub use zero_ddp::ChunkedDataParallel;
