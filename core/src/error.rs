//! Error type shared by the chunk engine, the data-parallel wrappers and the
//! sharding validator.
//!
//! Every variant is a contract violation or a fatal communication failure.
//! None of them is retryable.

use crate::sharding::ComputePattern;
use crate::tensor::{TensorId, TensorState};
use thiserror::Error;
use zero_rs_kernels::KernelError;

#[derive(Error, Debug)]
pub enum ZeroError {
    /// The tensor identity is not managed by this chunk manager / graph.
    #[error("Unknown tensor: {0}")]
    UnknownTensor(TensorId),

    /// The tensor identity was appended twice.
    #[error("Tensor {0} is already registered in a chunk")]
    DuplicateRegistration(TensorId),

    /// A single tensor is larger than the configured chunk size.
    #[error("Capacity exceeded: tensor {tensor} has {numel} elements but chunks hold at most {capacity}")]
    CapacityExceeded {
        tensor: TensorId,
        numel: usize,
        capacity: usize,
    },

    #[error("Invalid state transition for tensor {tensor}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        tensor: TensorId,
        from: TensorState,
        to: TensorState,
    },

    /// A chunk was reduced while one of its members was not ready.
    #[error("Premature reduce: tensor {tensor} is {state:?}, every chunk member must be ReadyForReduce")]
    PrematureReduce { tensor: TensorId, state: TensorState },

    #[error("Invalid parameter spec: params in {module} have different compute pattern")]
    InconsistentComputePattern { module: String },

    #[error("Invalid parameter spec: compute pattern {pattern:?} (mode {mode:?}) in {module} is not allowed")]
    UnsupportedComputePattern {
        module: String,
        pattern: ComputePattern,
        mode: Option<String>,
    },

    #[error("Invalid parameter spec: params in {module} are incorrectly sharded")]
    IncompatibleSharding { module: String },

    #[error("Module {module} has no parameter named {name}")]
    MissingParameter { module: String, name: String },

    #[error("Size mismatch: expected {expected} elements, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    /// The chunk holding the tensor has no resident storage on this process.
    #[error("Chunk holding tensor {0} has no resident storage")]
    ChunkFree(TensorId),

    /// A peer disconnected or a collective could not complete. Fatal.
    #[error("Collective operation failed: {0}")]
    Collective(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

pub type Result<T> = std::result::Result<T, ZeroError>;
