//! Lifecycle states of a managed tensor's storage.
//!
//! ```text
//!            acquire               begin-compute
//!   FREE ─────────────▶ HOLD ◀────────────────▶ COMPUTE
//!     ▲                 │  ▲      end-compute
//!     │     evict       │  │
//!     └─────────────────┘  │ reduce-complete (keep)
//!     ▲                    │
//!     │ reduce-complete    │        mark-grad-ready
//!     └──────────── READY_FOR_REDUCE ◀──────────── HOLD
//! ```
//!
//! `FREE` is the only state without a resident per-tensor view. Every other
//! state requires the owning chunk to be fully gathered on this process.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorState {
    /// No backing storage for the tensor's view on this process.
    Free,
    /// Storage resident, not in use by compute.
    Hold,
    /// Being read by a forward/backward operation.
    Compute,
    /// Gradient produced and staged in the slot, waiting for the chunk reduce.
    ReadyForReduce,
}

impl TensorState {
    /// Whether `self -> to` is a legal edge of the state machine.
    pub fn can_transition_to(self, to: TensorState) -> bool {
        use TensorState::*;
        matches!(
            (self, to),
            (Free, Hold)
                | (Hold, Free)
                | (Hold, Compute)
                | (Compute, Hold)
                | (Hold, ReadyForReduce)
                | (ReadyForReduce, Free)
                | (ReadyForReduce, Hold)
        )
    }

    /// Whether the state needs the full tensor bytes to be resident.
    pub fn is_resident(self) -> bool {
        !matches!(self, TensorState::Free)
    }

    /// A chunk may drop its gathered storage only if no member is busy.
    pub fn is_busy(self) -> bool {
        matches!(self, TensorState::Compute | TensorState::ReadyForReduce)
    }
}

#[cfg(test)]
mod tests {
    use super::TensorState::*;
    use super::*;

    const ALL: [TensorState; 4] = [Free, Hold, Compute, ReadyForReduce];

    #[test]
    fn test_legal_edges() {
        assert!(Free.can_transition_to(Hold));
        assert!(Hold.can_transition_to(Compute));
        assert!(Compute.can_transition_to(Hold));
        assert!(Hold.can_transition_to(ReadyForReduce));
        assert!(ReadyForReduce.can_transition_to(Free));
        assert!(ReadyForReduce.can_transition_to(Hold));
        assert!(Hold.can_transition_to(Free));
    }

    #[test]
    fn test_illegal_edges() {
        assert!(!Free.can_transition_to(Compute));
        assert!(!Free.can_transition_to(ReadyForReduce));
        assert!(!Compute.can_transition_to(ReadyForReduce));
        assert!(!Compute.can_transition_to(Free));
        assert!(!ReadyForReduce.can_transition_to(Compute));
    }

    #[test]
    fn test_no_self_loops() {
        for s in ALL {
            assert!(!s.can_transition_to(s), "{:?} -> {:?}", s, s);
        }
    }

    #[test]
    fn test_busy_states_are_resident() {
        for s in ALL {
            if s.is_busy() {
                assert!(s.is_resident());
            }
        }
    }
}
