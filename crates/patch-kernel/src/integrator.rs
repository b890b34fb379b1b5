//! Integrator trait: the collaborator told when a patch's forces are final.

use crate::ids::PatchId;
use crate::patch::Results;

/// Receives completion signals from patches.
///
/// Called synchronously from inside the last force deposit of a step, on
/// whatever thread made that deposit. Implementations should record or forward
/// the signal and return; they must not call back into the same patch's boxes.
pub trait Integrator: Send + Sync {
    /// Every registered compute has deposited; `results` holds the reduced forces.
    fn forces_ready(&self, patch: PatchId, cycle: u64, results: &Results);

    /// Optional: every box the patch opened this step has closed.
    ///
    /// Default implementation does nothing.
    fn boxes_closed(&self, _patch: PatchId) {}
}

/// Integrator that ignores every signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIntegrator;

impl Integrator for NullIntegrator {
    fn forces_ready(&self, _patch: PatchId, _cycle: u64, _results: &Results) {}
}
