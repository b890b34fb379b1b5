//! Spatial decomposition of the periodic cube into patches and compute tasks.
//!
//! Patches form a `grid³` lattice of equal cells. Each patch gets one self task
//! (interactions within the patch) and each unordered pair of adjacent patches
//! one pair task. Adjacency wraps around the periodic boundary.

use std::collections::BTreeSet;

use patch_kernel::{ComputeId, PatchId, Vector};

/// What one compute task works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: ComputeId,
    /// One patch for a self task, two for a pair task.
    pub patches: Vec<PatchId>,
}

impl TaskSpec {
    pub fn is_self(&self) -> bool {
        self.patches.len() == 1
    }
}

/// Cubic patch grid over `[-half_width, half_width)³`.
#[derive(Debug, Clone, Copy)]
pub struct Decomposition {
    grid: usize,
    half_width: f64,
}

impl Decomposition {
    pub fn new(grid: usize, half_width: f64) -> Self {
        Self {
            grid: grid.max(1),
            half_width,
        }
    }

    pub fn grid(&self) -> usize {
        self.grid
    }

    pub fn edge(&self) -> f64 {
        2.0 * self.half_width
    }

    pub fn num_patches(&self) -> usize {
        self.grid.pow(3)
    }

    pub fn patch_ids(&self) -> Vec<PatchId> {
        (0..self.num_patches() as u32).map(PatchId).collect()
    }

    /// Map a coordinate back into the primary cell.
    pub fn wrap(&self, position: Vector) -> Vector {
        let edge = self.edge();
        let h = self.half_width;
        position.map(|x| {
            let wrapped = x - edge * ((x + h) / edge).floor();
            // rounding can land exactly on the upper face
            if wrapped >= h {
                -h
            } else {
                wrapped
            }
        })
    }

    /// Minimum-image displacement `a - b`.
    pub fn minimum_image(&self, a: Vector, b: Vector) -> Vector {
        let edge = self.edge();
        let mut d = [0.0; 3];
        for axis in 0..3 {
            let raw = a[axis] - b[axis];
            d[axis] = raw - edge * (raw / edge).round();
        }
        d
    }

    /// Patch owning `position` (after wrapping).
    pub fn patch_of(&self, position: Vector) -> PatchId {
        let p = self.wrap(position);
        let cell = |x: f64| -> usize {
            let i = ((x + self.half_width) / self.edge() * self.grid as f64).floor() as usize;
            i.min(self.grid - 1)
        };
        self.patch_at(cell(p[0]), cell(p[1]), cell(p[2]))
    }

    fn patch_at(&self, x: usize, y: usize, z: usize) -> PatchId {
        PatchId((x + self.grid * (y + self.grid * z)) as u32)
    }

    fn coords(&self, patch: PatchId) -> (usize, usize, usize) {
        let i = patch.0 as usize;
        (i % self.grid, (i / self.grid) % self.grid, i / (self.grid * self.grid))
    }

    /// Distinct patches adjacent to `patch` (26-neighbourhood, periodic).
    pub fn neighbors(&self, patch: PatchId) -> BTreeSet<PatchId> {
        let (x, y, z) = self.coords(patch);
        let g = self.grid as isize;
        let shift = |c: usize, d: isize| ((c as isize + d).rem_euclid(g)) as usize;

        let mut out = BTreeSet::new();
        for dz in -1..=1 {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let q = self.patch_at(shift(x, dx), shift(y, dy), shift(z, dz));
                    if q != patch {
                        out.insert(q);
                    }
                }
            }
        }
        out
    }

    /// Self tasks first (compute id = patch id), then pair tasks.
    pub fn tasks(&self) -> Vec<TaskSpec> {
        let mut tasks: Vec<TaskSpec> = self
            .patch_ids()
            .into_iter()
            .map(|p| TaskSpec {
                id: ComputeId(p.0),
                patches: vec![p],
            })
            .collect();

        let mut pairs = BTreeSet::new();
        for p in self.patch_ids() {
            for q in self.neighbors(p) {
                pairs.insert((p.min(q), p.max(q)));
            }
        }

        let mut next = self.num_patches() as u32;
        for (a, b) in pairs {
            tasks.push(TaskSpec {
                id: ComputeId(next),
                patches: vec![a, b],
            });
            next += 1;
        }
        tasks
    }
}
