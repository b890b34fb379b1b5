//! Force evaluation: the compute tasks that sit on the consumer side of the boxes.
//!
//! A [`ForceTask`] holds one position handle and one force handle per patch it
//! touches. Each step it retrieves every patch's positions, evaluates pair
//! forces with its [`ForceField`], and deposits one force list per patch. It
//! never sees a patch directly.

use std::sync::Arc;

use anyhow::{Context, Result};

use patch_kernel::{
    BoxHandle, CompAtom, ComputeId, ForceBox, ForceDeposit, ForceKind, Patch, PatchId,
    PositionBox, Vector,
};

use crate::decomposition::{Decomposition, TaskSpec};

/// Pairwise force law.
pub trait ForceField: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &str;

    /// Channel the forces are deposited into.
    fn channel(&self) -> ForceKind {
        ForceKind::Nonbonded
    }

    /// Force on particle i from particle j, given the displacement `x_i - x_j`.
    ///
    /// Must be antisymmetric: swapping i and j negates the result.
    fn pair_force(&self, displacement: Vector) -> Vector;
}

/// Repulsive soft spring: `k (r_c - r)` along the separation, zero past `r_c`.
#[derive(Debug, Clone, Copy)]
pub struct SoftSpring {
    pub k: f64,
    pub cutoff: f64,
}

impl ForceField for SoftSpring {
    fn name(&self) -> &str {
        "soft-spring"
    }

    fn pair_force(&self, d: Vector) -> Vector {
        let r2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
        if r2 == 0.0 || r2 >= self.cutoff * self.cutoff {
            return [0.0; 3];
        }
        let r = r2.sqrt();
        let scale = self.k * (self.cutoff - r) / r;
        [scale * d[0], scale * d[1], scale * d[2]]
    }
}

struct Endpoint {
    patch: PatchId,
    positions: PositionBox,
    forces: ForceBox,
    position_handle: BoxHandle,
    force_handle: BoxHandle,
}

/// What one task did in one step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskStats {
    pub pairs_evaluated: usize,
    pub pairs_interacting: usize,
}

/// One self or pair compute.
pub struct ForceTask {
    id: ComputeId,
    endpoints: Vec<Endpoint>,
}

impl std::fmt::Debug for ForceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForceTask")
            .field("id", &self.id)
            .field(
                "patches",
                &self.endpoints.iter().map(|e| e.patch).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ForceTask {
    /// Register with every patch the task touches.
    ///
    /// `patches` must contain every patch named in `spec`.
    pub fn register(spec: &TaskSpec, patches: &mut [Patch]) -> Result<Self> {
        let mut endpoints = Vec::with_capacity(spec.patches.len());
        for &patch_id in &spec.patches {
            let patch = patches
                .iter_mut()
                .find(|p| p.id() == patch_id)
                .with_context(|| format!("task {} names unknown patch {}", spec.id, patch_id))?;
            endpoints.push(Endpoint {
                patch: patch_id,
                position_handle: patch.register_position_pickup(spec.id)?,
                force_handle: patch.register_force_deposit(spec.id)?,
                positions: patch.position_box(),
                forces: patch.force_box(),
            });
        }
        Ok(Self {
            id: spec.id,
            endpoints,
        })
    }

    pub fn id(&self) -> ComputeId {
        self.id
    }

    /// Give every handle back to its patch.
    pub fn unregister(self, patches: &mut [Patch]) -> Result<()> {
        for endpoint in self.endpoints {
            let patch = patches
                .iter_mut()
                .find(|p| p.id() == endpoint.patch)
                .with_context(|| format!("unknown patch {}", endpoint.patch))?;
            patch.unregister_position_pickup(endpoint.position_handle)?;
            patch.unregister_force_deposit(endpoint.force_handle)?;
        }
        Ok(())
    }

    /// Retrieve, evaluate, deposit. One call per step.
    pub fn run(&self, field: &dyn ForceField, decomposition: &Decomposition) -> Result<TaskStats> {
        let mut positions: Vec<Arc<Vec<CompAtom>>> = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            positions.push(endpoint.positions.retrieve(&endpoint.position_handle)?);
        }

        let mut forces: Vec<Vec<Vector>> = positions
            .iter()
            .map(|atoms| vec![[0.0; 3]; atoms.len()])
            .collect();
        let mut stats = TaskStats::default();

        let mut interact = |a: usize, i: usize, b: usize, j: usize, forces: &mut Vec<Vec<Vector>>| {
            let d = decomposition.minimum_image(positions[a][i].position, positions[b][j].position);
            let f = field.pair_force(d);
            stats.pairs_evaluated += 1;
            if f != [0.0; 3] {
                stats.pairs_interacting += 1;
                for axis in 0..3 {
                    forces[a][i][axis] += f[axis];
                    forces[b][j][axis] -= f[axis];
                }
            }
        };

        match positions.len() {
            1 => {
                let n = positions[0].len();
                for i in 0..n {
                    for j in i + 1..n {
                        interact(0, i, 0, j, &mut forces);
                    }
                }
            }
            _ => {
                let (n0, n1) = (positions[0].len(), positions[1].len());
                for i in 0..n0 {
                    for j in 0..n1 {
                        interact(0, i, 1, j, &mut forces);
                    }
                }
            }
        }

        let channel = field.channel();
        for (endpoint, forces) in self.endpoints.iter().zip(forces) {
            endpoint.forces.deposit(
                &endpoint.force_handle,
                ForceDeposit {
                    kind: channel,
                    forces,
                },
            )?;
        }

        tracing::trace!(
            task = %self.id,
            field = field.name(),
            pairs = stats.pairs_evaluated,
            interacting = stats.pairs_interacting,
            "Force task finished"
        );
        Ok(stats)
    }
}
