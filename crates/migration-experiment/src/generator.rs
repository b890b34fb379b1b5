//! Initial particle placement.
//!
//! Uniform positions in the periodic cube, small uniform velocities. The
//! velocities are shifted so the system starts with zero net momentum.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use patch_kernel::{ParticleId, Vector};

/// Configuration for particle generation.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Number of particles
    pub particles: usize,
    /// Half the edge of the cube
    pub half_width: f64,
    /// Largest initial velocity component
    pub max_velocity: f64,
    /// Random seed for reproducibility (None for random)
    pub seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            particles: 256,
            half_width: 4.0,
            max_velocity: 0.5,
            seed: None,
        }
    }
}

/// A particle's starting state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    pub id: ParticleId,
    pub position: Vector,
    pub velocity: Vector,
}

/// Seeded particle generator.
pub struct ParticleGenerator {
    config: GeneratorConfig,
}

impl ParticleGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn generate(&self) -> Vec<Particle> {
        let mut rng = match self.config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_os_rng(),
        };

        let h = self.config.half_width;
        let v = self.config.max_velocity;
        let mut particles: Vec<Particle> = (0..self.config.particles)
            .map(|i| Particle {
                id: i as ParticleId,
                position: [
                    rng.random_range(-h..h),
                    rng.random_range(-h..h),
                    rng.random_range(-h..h),
                ],
                velocity: if v > 0.0 {
                    [
                        rng.random_range(-v..v),
                        rng.random_range(-v..v),
                        rng.random_range(-v..v),
                    ]
                } else {
                    [0.0; 3]
                },
            })
            .collect();

        if !particles.is_empty() {
            let n = particles.len() as f64;
            let mut mean = [0.0; 3];
            for p in &particles {
                for (m, c) in mean.iter_mut().zip(p.velocity) {
                    *m += c / n;
                }
            }
            for p in &mut particles {
                for (c, m) in p.velocity.iter_mut().zip(mean) {
                    *c -= m;
                }
            }
        }

        tracing::debug!(
            particles = particles.len(),
            seed = ?self.config.seed,
            "Particles generated"
        );
        particles
    }
}
