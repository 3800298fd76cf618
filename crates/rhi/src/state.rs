//! Resource access states and the barrier policy.
//!
//! Every [`Resource`](crate::resource::Resource) carries exactly one current
//! [`AccessState`]. [`plan_barrier`] decides what a requested transition
//! costs:
//!
//! | current | target | outcome |
//! |---------|--------|---------|
//! | A | B (A != B) | one transition, state becomes B |
//! | UnorderedAccess | UnorderedAccess | one UAV-hazard barrier |
//! | A | A (A != UnorderedAccess) | nothing |

use std::sync::atomic::{AtomicU8, Ordering};

/// The access state a GPU resource is in between commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessState {
    Common = 0,
    ShaderRead = 1,
    UnorderedAccess = 2,
    RenderTarget = 3,
    DepthWrite = 4,
    CopySource = 5,
    CopyDest = 6,
    VertexOrConstantRead = 7,
    Present = 8,
    AccelerationStructure = 9,
}

impl AccessState {
    /// All states, in discriminant order.
    pub const ALL: [AccessState; 10] = [
        AccessState::Common,
        AccessState::ShaderRead,
        AccessState::UnorderedAccess,
        AccessState::RenderTarget,
        AccessState::DepthWrite,
        AccessState::CopySource,
        AccessState::CopyDest,
        AccessState::VertexOrConstantRead,
        AccessState::Present,
        AccessState::AccelerationStructure,
    ];

    /// Returns true if the GPU may write the resource in this state.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            AccessState::UnorderedAccess
                | AccessState::RenderTarget
                | AccessState::DepthWrite
                | AccessState::CopyDest
                | AccessState::AccelerationStructure
        )
    }

    /// Returns a human-readable name for logging.
    pub fn name(self) -> &'static str {
        match self {
            AccessState::Common => "Common",
            AccessState::ShaderRead => "ShaderRead",
            AccessState::UnorderedAccess => "UnorderedAccess",
            AccessState::RenderTarget => "RenderTarget",
            AccessState::DepthWrite => "DepthWrite",
            AccessState::CopySource => "CopySource",
            AccessState::CopyDest => "CopyDest",
            AccessState::VertexOrConstantRead => "VertexOrConstantRead",
            AccessState::Present => "Present",
            AccessState::AccelerationStructure => "AccelerationStructure",
        }
    }

    fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(AccessState::Common)
    }
}

/// What a barrier request turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// A state transition was recorded.
    Transition {
        before: AccessState,
        after: AccessState,
    },
    /// Back-to-back unordered access; an execution-ordering barrier was recorded.
    UavHazard,
    /// The resource is already in the requested read state; nothing was recorded.
    Elided,
}

impl BarrierOutcome {
    /// Returns true if a GPU barrier command is emitted.
    pub fn emits(self) -> bool {
        !matches!(self, BarrierOutcome::Elided)
    }
}

/// Decides which barrier, if any, moves a resource from `current` to `target`.
pub fn plan_barrier(current: AccessState, target: AccessState) -> BarrierOutcome {
    if current != target {
        BarrierOutcome::Transition {
            before: current,
            after: target,
        }
    } else if target == AccessState::UnorderedAccess {
        BarrierOutcome::UavHazard
    } else {
        BarrierOutcome::Elided
    }
}

/// Atomic storage for a resource's current state.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: AccessState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> AccessState {
        AccessState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: AccessState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_state_is_elided_except_uav() {
        for state in AccessState::ALL {
            let outcome = plan_barrier(state, state);
            if state == AccessState::UnorderedAccess {
                assert_eq!(outcome, BarrierOutcome::UavHazard);
            } else {
                assert_eq!(outcome, BarrierOutcome::Elided, "{}", state.name());
            }
        }
    }

    #[test]
    fn test_different_states_transition() {
        for before in AccessState::ALL {
            for after in AccessState::ALL.into_iter().filter(|s| *s != before) {
                assert_eq!(
                    plan_barrier(before, after),
                    BarrierOutcome::Transition { before, after }
                );
            }
        }
    }

    #[test]
    fn test_state_cell_roundtrip() {
        let cell = StateCell::new(AccessState::Common);
        assert_eq!(cell.get(), AccessState::Common);
        cell.set(AccessState::AccelerationStructure);
        assert_eq!(cell.get(), AccessState::AccelerationStructure);
    }

    #[test]
    fn test_write_states() {
        assert!(AccessState::CopyDest.is_write());
        assert!(AccessState::UnorderedAccess.is_write());
        assert!(!AccessState::ShaderRead.is_write());
        assert!(!AccessState::Present.is_write());
    }
}
