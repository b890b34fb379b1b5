//! Message types for acton-reactive actor communication.
//!
//! Frames travel as `Arc`s: an assembled position frame holds every particle in
//! the system and is fanned out to all observers.

use std::sync::Arc;

use acton_reactive::prelude::ActorHandle;

use crate::collect::{AssembledFrame, Lattice, Precision};
use crate::ids::{ParticleId, PatchId, Vector};

/// What a submission carries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameKind {
    Positions {
        lattice: Lattice,
        precision: Precision,
    },
    Velocities,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Positions { .. } => "positions",
            FrameKind::Velocities => "velocities",
        }
    }
}

/// Notification that the collector is ready - broadcast on start.
#[derive(Debug, Clone)]
pub struct CollectorReady {
    /// The collector's actor handle
    pub handle: ActorHandle,
}

/// One patch's contribution to a frame - sent to the Collector.
#[derive(Debug, Clone)]
pub struct SubmitFrame {
    /// Sequence number of the step being collected
    pub seq: u64,
    /// Patch that produced this slice
    pub patch: PatchId,
    /// Positions (with lattice and precision) or velocities
    pub kind: FrameKind,
    /// Particle ids of the slice
    pub ids: Vec<ParticleId>,
    /// One value per id
    pub values: Vec<Vector>,
}

/// A complete frame - broadcast by the Collector.
#[derive(Debug, Clone)]
pub struct FrameAssembled {
    /// "positions" or "velocities"
    pub collection: &'static str,
    /// The assembled frame
    pub frame: Arc<AssembledFrame>,
}

/// A contribution the Collector refused - broadcast so the driver can abort.
#[derive(Debug, Clone)]
pub struct CollectionRejected {
    pub seq: u64,
    pub patch: PatchId,
    /// Rendered kernel error
    pub reason: String,
}
