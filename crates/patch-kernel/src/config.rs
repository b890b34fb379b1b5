//! Configuration types for the kernel.

use serde::Deserialize;

/// Top-level kernel configuration.
///
/// Sizes the particle directory and the collectors, and decides which boxes a
/// patch opens each step. Loaded from JSON at runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Slots in the atom map; particle ids must be below this
    pub directory_capacity: usize,

    /// Patches contributing to every collected frame
    pub home_patches: usize,

    /// Whether patches open the averaged-position box
    pub averaged_positions: bool,

    /// Delivered sequence numbers remembered exactly for late-contribution
    /// checks. Older ones collapse into a horizon: any new frame at or below
    /// the highest forgotten number is refused, which assumes sequence numbers
    /// grow. A late contribution inside the window is reported as already
    /// delivered, one behind it as expired.
    pub delivered_history: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            directory_capacity: 0,
            home_patches: 1,
            averaged_positions: false,
            delivered_history: 64,
        }
    }
}
