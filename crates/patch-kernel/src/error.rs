//! Error types for the patch kernel.
//!
//! Two families live here:
//! - Residency results (`UnassignedParticle`, `DirectoryCleared`): a particle is
//!   not resident anywhere known right now. Callers treat these as "retry later".
//! - Protocol violations (everything else): a logic error in the surrounding
//!   scheduler. These abort the step; nothing in the kernel retries them.

use thiserror::Error;

use crate::ids::{ComputeId, ParticleId, PatchId};
use crate::rendezvous::BoxKind;

/// Identity of a box for diagnostics: which patch owns it and what it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxLabel {
    pub patch: PatchId,
    pub kind: BoxKind,
}

impl std::fmt::Display for BoxLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "patch {} {}", self.patch, self.kind)
    }
}

/// Errors raised by the directory, the box rendezvous and the collectors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// The directory holds the unassigned sentinel for this particle.
    #[error("particle {0} is not assigned to any patch")]
    UnassignedParticle(ParticleId),

    /// The directory was cleared and nothing has been registered since.
    #[error("atom map is cleared; lookup of particle {0} refused until re-registration")]
    DirectoryCleared(ParticleId),

    /// The particle id does not fit the allocated table.
    #[error("particle {id} outside atom map capacity {capacity}")]
    ParticleOutOfRange { id: ParticleId, capacity: usize },

    /// The compute already holds a handle on this box.
    #[error("compute {task} already registered on {label}")]
    AlreadyRegistered { label: BoxLabel, task: ComputeId },

    /// `open` was called on a box that is not idle.
    #[error("{label} already open (cycle {cycle})")]
    AlreadyOpen { label: BoxLabel, cycle: u64 },

    /// Consumer or owner call on a box that is not open.
    #[error("{label} is not open")]
    NotOpen { label: BoxLabel },

    /// The handle was already spent this cycle.
    #[error("compute {task} used its handle on {label} twice in cycle {cycle}")]
    DoubleUse {
        label: BoxLabel,
        task: ComputeId,
        cycle: u64,
    },

    /// The handle does not belong to a live registration on this box.
    #[error("compute {task} holds no live registration on {label}")]
    UnknownHandle { label: BoxLabel, task: ComputeId },

    /// A deposit was attempted on a read-only box.
    #[error("{label} is read-only; deposit by compute {task} rejected")]
    WrongMode { label: BoxLabel, task: ComputeId },

    /// A deposit does not cover exactly the atoms published for this cycle.
    #[error("compute {task} deposited {got} values on {label}, expected {expected}")]
    DepositLength {
        label: BoxLabel,
        task: ComputeId,
        expected: usize,
        got: usize,
    },

    /// Owner tried to close a deposit box; those close on their last deposit.
    #[error("{label} closes on its last deposit, not by owner call")]
    ClosedByDeposits { label: BoxLabel },

    /// More deposits arrived than the box expected this cycle.
    #[error("{label} received more deposits than registered computes in cycle {cycle}")]
    CycleExhausted { label: BoxLabel, cycle: u64 },

    /// A contribution arrived for a sequence number that was already delivered.
    #[error("sequence {seq} of {collection} already delivered; contribution rejected")]
    SequenceAlreadyDelivered {
        collection: &'static str,
        seq: u64,
    },

    /// A contribution would open a frame at or below the forgotten horizon.
    #[error("sequence {seq} of {collection} is not past horizon {horizon}; contribution rejected")]
    SequenceExpired {
        collection: &'static str,
        seq: u64,
        horizon: u64,
    },

    /// Particle ids and values of one contribution differ in length.
    #[error("contribution to sequence {seq} has {ids} ids but {values} values")]
    ContributionMismatch { seq: u64, ids: usize, values: usize },

    /// Membership may only change while every box of the patch is closed.
    #[error("patch {patch} has {open} boxes open; membership change refused")]
    BoxesOpen { patch: PatchId, open: usize },
}

impl KernelError {
    /// True for logic errors in the surrounding scheduler.
    ///
    /// Residency failures return false: migration leaves short windows in which a
    /// particle is legitimately not resident anywhere.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(
            self,
            KernelError::UnassignedParticle(_) | KernelError::DirectoryCleared(_)
        )
    }
}

/// Result alias used throughout the kernel.
pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_residency_errors_are_recoverable() {
        assert!(!KernelError::UnassignedParticle(3).is_protocol_violation());
        assert!(!KernelError::DirectoryCleared(3).is_protocol_violation());
    }

    #[test]
    fn test_double_use_is_protocol_violation() {
        let err = KernelError::DoubleUse {
            label: BoxLabel {
                patch: PatchId(2),
                kind: BoxKind::Force,
            },
            task: ComputeId(7),
            cycle: 4,
        };
        assert!(err.is_protocol_violation());
        assert_eq!(
            err.to_string(),
            "compute 7 used its handle on patch 2 force box twice in cycle 4"
        );
    }
}
