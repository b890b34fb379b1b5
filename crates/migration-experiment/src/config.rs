//! Experiment configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use patch_kernel::{KernelConfig, Precision};

/// Parameters of one migration experiment run.
///
/// Loaded from JSON with [`ExperimentConfig::load`]; missing fields take their
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Patches per dimension (grid × grid × grid patches)
    pub grid: usize,
    /// Number of particles
    pub particles: usize,
    /// Steps to run
    pub steps: u64,
    /// Steps between migration phases
    pub migration_period: u64,
    /// Steps between collected frames (0 disables output)
    pub output_period: u64,
    /// Time step
    pub dt: f64,
    /// Half the edge of the periodic cube
    pub half_width: f64,
    /// Soft-spring stiffness
    pub spring_constant: f64,
    /// Interaction cutoff
    pub cutoff: f64,
    /// Largest initial velocity component
    pub max_velocity: f64,
    /// Publish averaged positions alongside current positions
    pub averaged_positions: bool,
    /// Precision of collected position frames
    pub precision: Precision,
    /// Random seed (None for random)
    pub seed: Option<u64>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            grid: 2,
            particles: 256,
            steps: 50,
            migration_period: 5,
            output_period: 10,
            dt: 0.005,
            half_width: 4.0,
            spring_constant: 50.0,
            cutoff: 1.0,
            max_velocity: 0.5,
            averaged_positions: false,
            precision: Precision::High,
            seed: None,
        }
    }
}

impl ExperimentConfig {
    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Reject configurations the step loop cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.grid == 0 {
            anyhow::bail!("grid must be at least 1");
        }
        if self.migration_period == 0 {
            anyhow::bail!("migration_period must be at least 1");
        }
        if self.half_width <= 0.0 {
            anyhow::bail!("half_width must be positive, got {}", self.half_width);
        }
        if self.cutoff > self.edge() / self.grid as f64 {
            tracing::warn!(
                cutoff = self.cutoff,
                cell = self.edge() / self.grid as f64,
                "Cutoff exceeds patch edge; interactions beyond adjacent patches are skipped"
            );
        }
        Ok(())
    }

    /// Edge of the periodic cube.
    pub fn edge(&self) -> f64 {
        2.0 * self.half_width
    }

    pub fn num_patches(&self) -> usize {
        self.grid * self.grid * self.grid
    }

    /// Kernel configuration for this run. Every patch is a home patch.
    pub fn kernel_config(&self) -> KernelConfig {
        KernelConfig {
            directory_capacity: self.particles,
            home_patches: self.num_patches(),
            averaged_positions: self.averaged_positions,
            ..KernelConfig::default()
        }
    }
}
