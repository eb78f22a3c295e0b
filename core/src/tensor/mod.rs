//! Tensor identity, element types and the residency state machine.
//!
//! # What lives here?
//!
//! The chunk engine never owns a model's tensors. It refers to them by a
//! [`TensorId`] handed out when the parameter is created, and keeps their
//! bytes packed inside chunks. This module defines:
//!
//! - [`TensorElem`]: the numeric bound every element type satisfies.
//! - [`TensorId`]: a process-unique identity for a logical tensor.
//! - [`TensorState`]: the lifecycle a managed tensor's storage moves through.
//! - [`Storage`]: the allocator surface (`resize` / `free`) chunk payloads use.
//!
//! ```rust
//! use zero_rs::tensor::{TensorId, TensorState};
//!
//! let a = TensorId::new();
//! let b = TensorId::new();
//! assert_ne!(a, b);
//!
//! assert!(TensorState::Hold.can_transition_to(TensorState::Compute));
//! assert!(!TensorState::Free.can_transition_to(TensorState::Compute));
//! ```

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};

pub mod state;
pub mod storage;

pub use state::TensorState;
pub use storage::Storage;

/// Trait bound for elements that can be stored in a chunk.
///
/// # Requirements
/// - `Copy`: slots are filled and read with plain slice copies.
/// - `Num + NumAssign`: reductions add and divide in place.
/// - `FromPrimitive + ToPrimitive`: collectives move elements between ranks
///   as `f64` and convert on arrival, and averaging divides by the group size.
/// - `Send + Sync + 'static`: buffers cross into the communication thread.
pub trait TensorElem:
    Num
    + NumAssign
    + Copy
    + Clone
    + Debug
    + Send
    + Sync
    + FromPrimitive
    + ToPrimitive
    + PartialOrd
    + 'static
{
}

impl<T> TensorElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
        + 'static
{
}

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a logical tensor.
///
/// Identities are unique within a process and never reused. Everything that
/// refers to a parameter without owning it (chunks, hooks, side tables) keys
/// on this value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    /// Allocates a fresh identity.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Number of elements described by `shape`. A scalar (`[]`) has one.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}
