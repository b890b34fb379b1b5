//! Identifier types shared by every kernel component.

use serde::{Deserialize, Serialize};

/// Permanent global identifier of a particle. Never reused while the particle is live.
pub type ParticleId = u32;

/// Identifier of a patch (one geometric subdomain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatchId(pub u32);

impl std::fmt::Display for PatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a compute (a force-evaluation task).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComputeId(pub u32);

impl std::fmt::Display for ComputeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Three-component vector used for positions, velocities and forces.
pub type Vector = [f64; 3];

/// Single-precision vector produced by low-precision collection.
pub type FloatVector = [f32; 3];
