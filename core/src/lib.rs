//! # zero-rs
//!
//! `zero-rs` is a pure Rust implementation of chunked parameter and gradient
//! residency for data-parallel training, in the style of ZeRO: tensors are
//! packed into chunks that can be sharded across ranks, gathered only while
//! an op needs them, and reduced chunk by chunk as backprop produces their
//! gradients.
//!
//! Everything runs on CPU. Ranks are threads connected by channels, which is
//! enough to exercise the exact data movement of a real cluster.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: Tensor identities, the residency state machine, storage.
//! - [`chunk`]: Chunks and the [`ChunkManager`](chunk::ChunkManager).
//! - [`distributed`]: Collectives and both data-parallel wrappers.
//! - [`autograd`]: The op/gradient interception surface networks run against.
//! - [`nn`]: Module graph and reference layers.
//! - [`sharding`]: Tensor-parallel layouts and the layout validator.
//!
//! ## Example
//!
//! ```rust
//! use zero_rs::chunk::{ChunkConfig, ChunkManager};
//! use zero_rs::distributed::CpuBackend;
//! use zero_rs::tensor::TensorId;
//!
//! let mut manager = ChunkManager::<f32, _>::new(ChunkConfig::new(Some(1024), false), CpuBackend::single())?;
//! let a = TensorId::new();
//! let b = TensorId::new();
//! let chunk_a = manager.append_tensor(a, &[0.0; 512], "params")?;
//! let chunk_b = manager.append_tensor(b, &[0.0; 512], "params")?;
//! assert_eq!(chunk_a, chunk_b);
//! # Ok::<(), zero_rs::error::ZeroError>(())
//! ```

pub mod autograd;
pub mod chunk;
pub mod distributed;
pub mod error;
pub mod nn;
pub mod sharding;
pub mod tensor;

pub use chunk::{ChunkConfig, ChunkManager};
pub use distributed::{ChunkedDataParallel, CollectiveBackend, CpuBackend, DataParallel};
pub use error::{Result, ZeroError};
pub use tensor::{Storage, TensorElem, TensorId, TensorState};
