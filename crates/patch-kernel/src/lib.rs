//! Patch Kernel: particle ownership and compute synchronization for spatially
//! decomposed simulations.
//!
//! This crate implements the synchronization core underneath a particle
//! simulation split into patches: a directory from global particle id to its
//! owning patch, a per-buffer rendezvous between each patch and the computes
//! that read its positions and deposit its forces, and collectors that
//! reassemble whole-system frames from per-patch contributions.

pub mod actors;
pub mod atom_map;
pub mod collect;
pub mod config;
pub mod error;
pub mod ids;
pub mod integrator;
pub mod kernel;
pub mod messages;
pub mod patch;
pub mod registry;
pub mod rendezvous;

pub use atom_map::{AtomMap, LocalId, MapCheck};
pub use collect::{AssembledFrame, CollectionManager, Lattice, Precision, SequencedAggregator};
pub use config::KernelConfig;
pub use error::{BoxLabel, KernelError, Result};
pub use ids::{ComputeId, FloatVector, ParticleId, PatchId, Vector};
pub use integrator::{Integrator, NullIntegrator};
pub use kernel::{Kernel, KernelBuilder};
pub use patch::{
    CompAtom, ForceBox, ForceDeposit, ForceFrame, ForceKind, Patch, PositionBox, Results,
};
pub use registry::ComputeList;
pub use rendezvous::{BoxHandle, BoxKind, BoxMode, BoxPhase, Completion, ConsumerBox, OwnerBox};
