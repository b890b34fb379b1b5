//! Results collection and output for migration experiments.
//!
//! Captures metrics like:
//! - Migrations per migration phase
//! - Kinetic energy and net momentum per step
//! - Frames collected and contributions rejected

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use patch_kernel::MapCheck;

use crate::config::ExperimentConfig;

/// Metrics for a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step: u64,
    /// Particles that changed patch in this step's migration phase
    pub migrations: usize,
    /// Particles the directory did not know before the migration phase
    pub unassigned: usize,
    pub kinetic_energy: f64,
    /// Net momentum after integration; stays at its initial value when every
    /// deposit was reduced exactly once
    pub momentum: [f64; 3],
    pub max_force: f64,
    pub pairs_interacting: usize,
    pub duration_ms: u64,
}

/// Summary of one collected frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSummary {
    pub collection: String,
    pub seq: u64,
    pub atoms: usize,
}

/// Results from a single experiment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub run_id: Uuid,
    /// Experiment configuration
    pub config: ExperimentConfig,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub steps: Vec<StepMetrics>,
    pub frames: Vec<FrameSummary>,
    /// Contributions the collector refused
    pub rejected_contributions: Vec<String>,
    /// Directory state after the last step
    pub map_check: MapCheck,
}

impl ExperimentResult {
    pub fn total_migrations(&self) -> usize {
        self.steps.iter().map(|s| s.migrations).sum()
    }

    pub fn final_kinetic_energy(&self) -> f64 {
        self.steps.last().map(|s| s.kinetic_energy).unwrap_or(0.0)
    }

    /// Largest change of any momentum component across the run.
    pub fn momentum_drift(&self) -> f64 {
        let Some(first) = self.steps.first() else {
            return 0.0;
        };
        self.steps
            .iter()
            .flat_map(|s| (0..3).map(move |axis| (s.momentum[axis] - first.momentum[axis]).abs()))
            .fold(0.0, f64::max)
    }

    pub fn frames_of(&self, collection: &str) -> usize {
        self.frames
            .iter()
            .filter(|f| f.collection == collection)
            .count()
    }

    /// Save results to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load results from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let result = serde_json::from_str(&json)?;
        Ok(result)
    }
}

/// Format a duration in milliseconds for display.
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        let mins = ms / 60_000;
        let secs = (ms % 60_000) / 1000;
        format!("{}m{}s", mins, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(step: u64, migrations: usize, momentum: [f64; 3]) -> StepMetrics {
        StepMetrics {
            step,
            migrations,
            unassigned: 0,
            kinetic_energy: step as f64,
            momentum,
            max_force: 0.0,
            pairs_interacting: 0,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_summary_helpers() {
        let result = ExperimentResult {
            run_id: Uuid::new_v4(),
            config: ExperimentConfig::default(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            steps: vec![
                metrics(1, 3, [0.0; 3]),
                metrics(2, 0, [0.0, 0.25, 0.0]),
                metrics(3, 4, [0.0, -0.5, 0.0]),
            ],
            frames: Vec::new(),
            rejected_contributions: Vec::new(),
            map_check: MapCheck::default(),
        };
        assert_eq!(result.total_migrations(), 7);
        assert_eq!(result.final_kinetic_energy(), 3.0);
        assert!((result.momentum_drift() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(500), "500ms");
        assert_eq!(format_duration(1500), "1.5s");
        assert_eq!(format_duration(65_000), "1m5s");
    }
}
