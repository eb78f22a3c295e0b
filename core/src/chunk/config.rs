use crate::distributed::ReduceOp;
use crate::error::{Result, ZeroError};
use serde::{Deserialize, Serialize};

/// What a chunk keeps resident once its gradients have been reduced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfterReduce {
    /// The full reduced chunk stays resident and every member goes to `Hold`.
    /// Reduced gradients stay readable on every rank.
    #[default]
    Hold,
    /// Members go to `Free`. With distributed storage only this rank's shard
    /// of the reduced data is kept.
    Free,
}

/// Configuration for a [`ChunkManager`](super::ChunkManager).
///
/// # Example
///
/// ```rust
/// use zero_rs::chunk::ChunkConfig;
///
/// let config: ChunkConfig = serde_json::from_str(r#"{ "chunk_size": 2048 }"#).unwrap();
/// assert_eq!(config.chunk_size, Some(2048));
/// assert!(!config.distributed_storage);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Elements per chunk. `None` gives every tensor a chunk of its own size.
    #[serde(default)]
    pub chunk_size: Option<usize>,
    /// Shard each chunk across ranks; only one segment is resident at rest.
    #[serde(default)]
    pub distributed_storage: bool,
    #[serde(default)]
    pub reduce_op: ReduceOp,
    #[serde(default)]
    pub after_reduce: AfterReduce,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            distributed_storage: false,
            reduce_op: ReduceOp::Average,
            after_reduce: AfterReduce::Hold,
        }
    }
}

impl ChunkConfig {
    pub fn new(chunk_size: Option<usize>, distributed_storage: bool) -> Self {
        Self {
            chunk_size,
            distributed_storage,
            ..Self::default()
        }
    }

    pub fn with_reduce_op(mut self, op: ReduceOp) -> Self {
        self.reduce_op = op;
        self
    }

    pub fn with_after_reduce(mut self, policy: AfterReduce) -> Self {
        self.after_reduce = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == Some(0) {
            return Err(ZeroError::InvalidConfig(
                "chunk_size must be positive".into(),
            ));
        }
        Ok(())
    }
}
