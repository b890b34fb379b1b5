//! Experiment runner for migration experiments.
//!
//! Orchestrates the experiment lifecycle:
//! 1. Generate particles and build the kernel (directory, patches, collector)
//! 2. Register one force task per self/pair interaction
//! 3. Run the step loop: migration phase, positions ready, concurrent force
//!    tasks, wait for every patch's boxes to close, integrate, submit frames
//! 4. Collect metrics and results

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use acton_reactive::prelude::*;
use patch_kernel::messages::{CollectionRejected, FrameAssembled, FrameKind, SubmitFrame};
use patch_kernel::{
    CompAtom, Integrator, Kernel, KernelBuilder, Lattice, PatchId, Results, Vector,
};

use crate::config::ExperimentConfig;
use crate::decomposition::Decomposition;
use crate::forces::{ForceField, ForceTask, SoftSpring};
use crate::generator::{GeneratorConfig, ParticleGenerator};
use crate::results::{ExperimentResult, FrameSummary, StepMetrics};

/// How long a step may wait for its patches' completion signals.
const SIGNAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the run waits for outstanding frames after the last step.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Completion signals forwarded from patches to the step loop.
#[derive(Debug, Clone)]
pub enum StepSignal {
    ForcesReady { patch: PatchId, cycle: u64 },
    BoxesClosed { patch: PatchId },
}

/// Integrator that forwards every signal to the step loop.
///
/// Runs on whichever thread made the completing deposit, so it only sends.
#[derive(Debug, Clone)]
pub struct ChannelIntegrator {
    tx: mpsc::UnboundedSender<StepSignal>,
}

impl ChannelIntegrator {
    pub fn new(tx: mpsc::UnboundedSender<StepSignal>) -> Self {
        Self { tx }
    }
}

impl Integrator for ChannelIntegrator {
    fn forces_ready(&self, patch: PatchId, cycle: u64, _results: &Results) {
        let _ = self.tx.send(StepSignal::ForcesReady { patch, cycle });
    }

    fn boxes_closed(&self, patch: PatchId) {
        let _ = self.tx.send(StepSignal::BoxesClosed { patch });
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct MembershipChange {
    migrations: usize,
    unassigned: usize,
}

/// Runs one migration experiment.
pub struct ExperimentRunner {
    config: ExperimentConfig,
    field: Arc<dyn ForceField>,
}

impl ExperimentRunner {
    /// Create a runner using a soft-spring force field from the config.
    pub fn new(config: ExperimentConfig) -> Self {
        let field = Arc::new(SoftSpring {
            k: config.spring_constant,
            cutoff: config.cutoff,
        });
        Self { config, field }
    }

    /// Replace the force field.
    pub fn with_force_field(mut self, field: Arc<dyn ForceField>) -> Self {
        self.field = field;
        self
    }

    pub async fn run(&self) -> Result<ExperimentResult> {
        self.config.validate()?;
        let config = &self.config;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let decomposition = Decomposition::new(config.grid, config.half_width);

        let particles = ParticleGenerator::new(GeneratorConfig {
            particles: config.particles,
            half_width: config.half_width,
            max_velocity: config.max_velocity,
            seed: config.seed,
        })
        .generate();
        let mut velocities: Vec<Vector> = particles.iter().map(|p| p.velocity).collect();
        let initial_atoms: Vec<CompAtom> = particles
            .iter()
            .map(|p| CompAtom {
                id: p.id,
                position: p.position,
            })
            .collect();

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let mut kernel = KernelBuilder::new(config.kernel_config())
            .integrator(Arc::new(ChannelIntegrator::new(signal_tx)))
            .build(&decomposition.patch_ids());

        let mut runtime = ActonApp::launch_async().await;
        let (frame_tx, mut frame_rx) = mpsc::channel::<FrameAssembled>(1000);
        spawn_frame_observer(&mut runtime, frame_tx).await;
        let (rejected_tx, mut rejected_rx) = mpsc::channel::<CollectionRejected>(1000);
        spawn_rejection_observer(&mut runtime, rejected_tx).await;
        let collector = kernel.spawn_collector(&mut runtime).await;

        let tasks: Vec<Arc<ForceTask>> = decomposition
            .tasks()
            .iter()
            .map(|spec| ForceTask::register(spec, &mut kernel.patches).map(Arc::new))
            .collect::<Result<_>>()?;

        info!(
            %run_id,
            patches = kernel.patches.len(),
            tasks = tasks.len(),
            particles = config.particles,
            steps = config.steps,
            field = self.field.name(),
            "Starting step loop"
        );

        let lattice = Lattice::cube(config.edge());
        let mut pending_atoms = Some(initial_atoms);
        let mut steps = Vec::with_capacity(config.steps as usize);
        let mut output_steps = 0usize;
        let mut frames = Vec::new();
        let mut rejected_contributions = Vec::new();

        for step in 1..=config.steps {
            let step_started = Instant::now();

            // Migration phase
            let change = if let Some(atoms) = pending_atoms.take() {
                Some(assign(&mut kernel, &decomposition, atoms)?)
            } else if (step - 1) % config.migration_period == 0 {
                let atoms: Vec<CompAtom> = kernel
                    .patches
                    .iter()
                    .flat_map(|p| p.atoms().iter().copied())
                    .collect();
                Some(assign(&mut kernel, &decomposition, atoms)?)
            } else {
                None
            };
            let migration_tag = u32::from(change.is_some());

            for patch in &mut kernel.patches {
                patch.positions_ready(migration_tag)?;
            }

            // Force phase
            let handles: Vec<_> = tasks
                .iter()
                .map(|task| {
                    let task = task.clone();
                    let field = self.field.clone();
                    tokio::task::spawn_blocking(move || task.run(field.as_ref(), &decomposition))
                })
                .collect();
            let mut pairs_interacting = 0;
            for outcome in join_all(handles).await {
                let stats = outcome.context("force task panicked")??;
                pairs_interacting += stats.pairs_interacting;
            }

            wait_for_boxes(&mut signal_rx, kernel.patches.len(), step).await?;

            // Integration
            let mut max_force = 0.0f64;
            for patch in &mut kernel.patches {
                let forces = patch.results().total();
                let previous: Vec<CompAtom> = patch.atoms().to_vec();
                let atoms = patch.atoms_mut()?;
                for (atom, f) in atoms.iter_mut().zip(&forces) {
                    let v = &mut velocities[atom.id as usize];
                    let mut moved = atom.position;
                    for axis in 0..3 {
                        v[axis] += f[axis] * config.dt;
                        moved[axis] += v[axis] * config.dt;
                    }
                    atom.position = decomposition.wrap(moved);
                    max_force = max_force.max(norm(*f));
                }
                if config.averaged_positions {
                    let averaged = previous
                        .iter()
                        .zip(patch.atoms())
                        .map(|(old, new)| {
                            let d = decomposition.minimum_image(new.position, old.position);
                            CompAtom {
                                id: new.id,
                                position: decomposition.wrap([
                                    old.position[0] + 0.5 * d[0],
                                    old.position[1] + 0.5 * d[1],
                                    old.position[2] + 0.5 * d[2],
                                ]),
                            }
                        })
                        .collect();
                    patch.set_avg_atoms(averaged)?;
                }
            }

            // Output
            if config.output_period > 0 && step % config.output_period == 0 {
                output_steps += 1;
                for patch in &kernel.patches {
                    let ids: Vec<u32> = patch.atoms().iter().map(|a| a.id).collect();
                    let positions = patch.atoms().iter().map(|a| a.position).collect();
                    let patch_velocities = ids.iter().map(|&id| velocities[id as usize]).collect();
                    collector
                        .send(SubmitFrame {
                            seq: step,
                            patch: patch.id(),
                            kind: FrameKind::Positions {
                                lattice,
                                precision: config.precision,
                            },
                            ids: ids.clone(),
                            values: positions,
                        })
                        .await;
                    collector
                        .send(SubmitFrame {
                            seq: step,
                            patch: patch.id(),
                            kind: FrameKind::Velocities,
                            ids,
                            values: patch_velocities,
                        })
                        .await;
                }
            }

            // keep the observer channels moving so the collector never blocks
            drain_frames(&mut frame_rx, &mut frames);
            drain_rejections(&mut rejected_rx, &mut rejected_contributions);

            let change = change.unwrap_or_default();
            let metrics = StepMetrics {
                step,
                migrations: change.migrations,
                unassigned: change.unassigned,
                kinetic_energy: kinetic_energy(&velocities),
                momentum: momentum(&velocities),
                max_force,
                pairs_interacting,
                duration_ms: step_started.elapsed().as_millis() as u64,
            };
            debug!(
                step,
                migrations = metrics.migrations,
                kinetic = format!("{:.4}", metrics.kinetic_energy),
                max_force = format!("{:.3}", metrics.max_force),
                "Step complete"
            );
            steps.push(metrics);
        }

        // Collect frames still in flight
        let expected_frames = output_steps * 2;
        while frames.len() < expected_frames {
            match tokio::time::timeout(FRAME_TIMEOUT, frame_rx.recv()).await {
                Ok(Some(assembled)) => frames.push(summarize(&assembled)),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        received = frames.len(),
                        expected = expected_frames,
                        "Timed out waiting for frames"
                    );
                    break;
                }
            }
        }
        drain_rejections(&mut rejected_rx, &mut rejected_contributions);

        for task in tasks {
            if let Ok(task) = Arc::try_unwrap(task) {
                task.unregister(&mut kernel.patches)?;
            }
        }
        let map_check = kernel.atom_map.check_map();

        let _ = runtime.shutdown_all().await;

        let result = ExperimentResult {
            run_id,
            config: config.clone(),
            started_at,
            ended_at: Utc::now(),
            steps,
            frames,
            rejected_contributions,
            map_check,
        };
        info!(
            %run_id,
            migrations = result.total_migrations(),
            frames = result.frames.len(),
            rejected = result.rejected_contributions.len(),
            kinetic = format!("{:.4}", result.final_kinetic_energy()),
            "Run complete"
        );
        Ok(result)
    }
}

/// Redistribute `atoms` over the patches by position and update the directory.
fn assign(
    kernel: &mut Kernel,
    decomposition: &Decomposition,
    atoms: Vec<CompAtom>,
) -> Result<MembershipChange> {
    let mut change = MembershipChange::default();
    let mut lists: Vec<Vec<CompAtom>> = vec![Vec::new(); kernel.patches.len()];

    for atom in atoms {
        let target = decomposition.patch_of(atom.position);
        match kernel.atom_map.lookup(atom.id) {
            Ok(local) if local.patch == target => {}
            Ok(_) => change.migrations += 1,
            Err(e) if !e.is_protocol_violation() => change.unassigned += 1,
            Err(e) => return Err(e.into()),
        }
        let list = lists
            .get_mut(target.0 as usize)
            .with_context(|| format!("no patch {} for particle {}", target, atom.id))?;
        list.push(atom);
    }

    for (patch, list) in kernel.patches.iter_mut().zip(lists) {
        patch.replace_atoms(list)?;
    }

    debug!(
        migrations = change.migrations,
        unassigned = change.unassigned,
        "Migration phase complete"
    );
    Ok(change)
}

/// Block until every patch has reported its boxes closed for this step.
async fn wait_for_boxes(
    signals: &mut mpsc::UnboundedReceiver<StepSignal>,
    patches: usize,
    step: u64,
) -> Result<()> {
    let mut closed = 0;
    while closed < patches {
        match tokio::time::timeout(SIGNAL_TIMEOUT, signals.recv()).await {
            Ok(Some(StepSignal::BoxesClosed { .. })) => closed += 1,
            Ok(Some(StepSignal::ForcesReady { patch, cycle })) => {
                tracing::trace!(%patch, cycle, "Forces ready");
            }
            Ok(None) => anyhow::bail!("integrator channel closed during step {step}"),
            Err(_) => anyhow::bail!(
                "step {step}: only {closed} of {patches} patches closed their boxes"
            ),
        }
    }
    Ok(())
}

fn summarize(assembled: &FrameAssembled) -> FrameSummary {
    FrameSummary {
        collection: assembled.collection.to_string(),
        seq: assembled.frame.seq,
        atoms: assembled.frame.len(),
    }
}

/// Take every frame already forwarded by the observer without waiting.
fn drain_frames(rx: &mut mpsc::Receiver<FrameAssembled>, frames: &mut Vec<FrameSummary>) {
    while let Ok(assembled) = rx.try_recv() {
        frames.push(summarize(&assembled));
    }
}

fn drain_rejections(rx: &mut mpsc::Receiver<CollectionRejected>, rejected: &mut Vec<String>) {
    while let Ok(msg) = rx.try_recv() {
        rejected.push(format!("seq {} patch {}: {}", msg.seq, msg.patch, msg.reason));
    }
}

fn norm(v: Vector) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

fn kinetic_energy(velocities: &[Vector]) -> f64 {
    velocities.iter().map(|v| 0.5 * norm(*v).powi(2)).sum()
}

fn momentum(velocities: &[Vector]) -> [f64; 3] {
    let mut p = [0.0; 3];
    for v in velocities {
        for axis in 0..3 {
            p[axis] += v[axis];
        }
    }
    p
}

/// Spawn an observer actor that forwards FrameAssembled broadcasts.
async fn spawn_frame_observer(runtime: &mut ActorRuntime, tx: mpsc::Sender<FrameAssembled>) {
    #[derive(Default, Clone, Debug)]
    struct State {
        tx: Option<mpsc::Sender<FrameAssembled>>,
    }

    let mut actor = runtime.new_actor_with_name::<State>("FrameObserver".to_string());
    actor.model.tx = Some(tx);

    actor.handle().subscribe::<FrameAssembled>().await;

    actor.act_on::<FrameAssembled>(|actor, context| {
        let msg = context.message().clone();
        let tx = actor.model.tx.clone();
        Reply::pending(async move {
            if let Some(tx) = tx {
                let _ = tx.send(msg).await;
            }
        })
    });

    actor.start().await;
}

/// Spawn an observer actor that forwards CollectionRejected broadcasts.
async fn spawn_rejection_observer(
    runtime: &mut ActorRuntime,
    tx: mpsc::Sender<CollectionRejected>,
) {
    #[derive(Default, Clone, Debug)]
    struct State {
        tx: Option<mpsc::Sender<CollectionRejected>>,
    }

    let mut actor = runtime.new_actor_with_name::<State>("RejectionObserver".to_string());
    actor.model.tx = Some(tx);

    actor.handle().subscribe::<CollectionRejected>().await;

    actor.act_on::<CollectionRejected>(|actor, context| {
        let msg = context.message().clone();
        let tx = actor.model.tx.clone();
        Reply::pending(async move {
            if let Some(tx) = tx {
                let _ = tx.send(msg).await;
            }
        })
    });

    actor.start().await;
}
