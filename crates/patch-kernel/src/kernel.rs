//! Kernel assembly: one execution context's directory, patches and collectors.
//!
//! ## Usage
//!
//! ```ignore
//! use patch_kernel::{KernelBuilder, KernelConfig, PatchId};
//! use acton_reactive::prelude::*;
//!
//! let mut runtime = ActonApp::launch_async().await;
//!
//! let mut kernel = KernelBuilder::new(config)
//!     .integrator(Arc::new(MyIntegrator))
//!     .build(&[PatchId(0), PatchId(1)]);
//!
//! // Collector broadcasts FrameAssembled once every home patch has submitted
//! let collector = kernel.spawn_collector(&mut runtime).await;
//! ```
//!
//! Everything is built here and handed to the parts that need it; nothing in
//! the kernel reaches for a global.

use std::sync::Arc;

use acton_reactive::prelude::*;

use crate::actors::Collector;
use crate::atom_map::AtomMap;
use crate::collect::CollectionManager;
use crate::config::KernelConfig;
use crate::ids::PatchId;
use crate::integrator::{Integrator, NullIntegrator};
use crate::patch::Patch;

/// Builder for a [`Kernel`].
pub struct KernelBuilder {
    config: KernelConfig,
    integrator: Arc<dyn Integrator>,
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            integrator: Arc::new(NullIntegrator),
        }
    }

    /// Integrator told when each patch's forces are final.
    pub fn integrator(mut self, integrator: Arc<dyn Integrator>) -> Self {
        self.integrator = integrator;
        self
    }

    /// Build the kernel with one empty patch per id.
    ///
    /// When the configured `home_patches` is zero, every built patch counts as a
    /// contributor to collected frames.
    pub fn build(self, patch_ids: &[PatchId]) -> Kernel {
        let atom_map = Arc::new(AtomMap::with_capacity(self.config.directory_capacity));
        let home_patches = match self.config.home_patches {
            0 => patch_ids.len(),
            n => n,
        };
        let collection = Arc::new(CollectionManager::new(
            home_patches,
            self.config.delivered_history,
        ));

        let patches = patch_ids
            .iter()
            .map(|&id| {
                Patch::new(
                    id,
                    atom_map.clone(),
                    self.integrator.clone(),
                    self.config.averaged_positions,
                )
            })
            .collect();

        tracing::info!(
            patches = patch_ids.len(),
            home_patches,
            capacity = self.config.directory_capacity,
            "Kernel built"
        );

        Kernel {
            config: self.config,
            atom_map,
            patches,
            collection,
        }
    }
}

/// Directory, patches and collectors of one execution context.
#[derive(Debug)]
pub struct Kernel {
    pub config: KernelConfig,
    pub atom_map: Arc<AtomMap>,
    pub patches: Vec<Patch>,
    pub collection: Arc<CollectionManager>,
}

impl Kernel {
    /// Spawn a [`Collector`] actor fronting this kernel's collection manager.
    pub async fn spawn_collector(&self, runtime: &mut ActorRuntime) -> ActorHandle {
        Collector::spawn(runtime, self.collection.clone()).await
    }

    pub fn patch(&self, id: PatchId) -> Option<&Patch> {
        self.patches.iter().find(|p| p.id() == id)
    }

    pub fn patch_mut(&mut self, id: PatchId) -> Option<&mut Patch> {
        self.patches.iter_mut().find(|p| p.id() == id)
    }
}
