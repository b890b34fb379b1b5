//! Patch: owner of the particle buffers for one geometric region.
//!
//! A patch owns three boxes:
//! - position box (read): the current positions, published by `positions_ready`
//! - avg position box (read): averaged positions, opened only when configured
//! - force box (accumulate): one deposit per registered compute per step
//!
//! The force box's completion callback reduces every deposit into the patch's
//! [`Results`], tells the [`Integrator`] the forces are final and closes the
//! position boxes: once every compute has deposited, nobody still needs to read.
//! Each box close counts down `boxes_open`; at zero the integrator hears
//! `boxes_closed`.
//!
//! Computes never touch the buffers directly. They hold [`BoxHandle`]s and go
//! through the consumer views obtained from [`Patch::position_box`] and
//! friends. Opening, closing and registration stay with the patch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::atom_map::AtomMap;
use crate::error::{BoxLabel, KernelError, Result};
use crate::ids::{ComputeId, ParticleId, PatchId, Vector};
use crate::integrator::Integrator;
use crate::registry::ComputeList;
use crate::rendezvous::{BoxHandle, BoxKind, BoxMode, BoxPhase, Completion, ConsumerBox, OwnerBox};

/// Position record published to computes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompAtom {
    pub id: ParticleId,
    pub position: Vector,
}

/// Force accumulation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForceKind {
    Normal,
    Nonbonded,
    Slow,
}

impl ForceKind {
    pub const ALL: [ForceKind; 3] = [ForceKind::Normal, ForceKind::Nonbonded, ForceKind::Slow];

    fn index(self) -> usize {
        match self {
            ForceKind::Normal => 0,
            ForceKind::Nonbonded => 1,
            ForceKind::Slow => 2,
        }
    }
}

/// One compute's contribution to a patch for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct ForceDeposit {
    pub kind: ForceKind,
    /// One vector per patch atom, in the patch's local order.
    pub forces: Vec<Vector>,
}

/// Payload of the force box: what computes need to size their deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceFrame {
    pub patch: PatchId,
    pub step: u64,
    pub num_atoms: usize,
}

/// Reduced forces of one step, per channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Results {
    pub step: u64,
    f: [Vec<Vector>; 3],
}

impl Results {
    fn reset(&mut self, step: u64, num_atoms: usize) {
        self.step = step;
        for channel in &mut self.f {
            channel.clear();
            channel.resize(num_atoms, [0.0; 3]);
        }
    }

    pub fn forces(&self, kind: ForceKind) -> &[Vector] {
        &self.f[kind.index()]
    }

    /// Sum over all channels, per atom.
    pub fn total(&self) -> Vec<Vector> {
        let n = self.f[0].len();
        (0..n)
            .map(|i| {
                let mut sum = [0.0; 3];
                for channel in &self.f {
                    for (s, c) in sum.iter_mut().zip(channel[i]) {
                        *s += c;
                    }
                }
                sum
            })
            .collect()
    }
}

/// Compute-side view of a read box carrying positions.
pub type PositionBox = ConsumerBox<Vec<CompAtom>>;

/// Compute-side view of the accumulate box collecting forces.
pub type ForceBox = ConsumerBox<ForceFrame, ForceDeposit>;

type OwnedPositionBox = OwnerBox<Vec<CompAtom>>;
type OwnedForceBox = OwnerBox<ForceFrame, ForceDeposit>;

/// The patch's view of how many of its boxes are still open this step.
struct BoxCounter {
    patch: PatchId,
    open: AtomicUsize,
    integrator: Arc<dyn Integrator>,
}

impl BoxCounter {
    fn box_closed(&self, kind: BoxKind) {
        let Ok(previous) = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        else {
            warn!(patch = %self.patch, kind = %kind, "Box closed outside a patch step");
            return;
        };
        trace!(patch = %self.patch, kind = %kind, open = previous - 1, "Patch box closed");
        if previous == 1 {
            self.integrator.boxes_closed(self.patch);
        }
    }
}

/// Owner of one region's particles and of the three boxes computes use to reach them.
pub struct Patch {
    id: PatchId,
    atoms: Arc<Vec<CompAtom>>,
    avg_atoms: Arc<Vec<CompAtom>>,
    num_fixed_atoms: usize,
    has_new_atoms: bool,
    membership_changed: bool,
    step: u64,
    averaged_positions: bool,
    position_box: Arc<OwnedPositionBox>,
    avg_position_box: Arc<OwnedPositionBox>,
    force_box: Arc<OwnedForceBox>,
    position_computes: ComputeList,
    avg_position_computes: ComputeList,
    force_computes: ComputeList,
    results: Arc<Mutex<Results>>,
    boxes: Arc<BoxCounter>,
    atom_map: Arc<AtomMap>,
}

impl std::fmt::Debug for Patch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Patch")
            .field("id", &self.id)
            .field("num_atoms", &self.atoms.len())
            .field("step", &self.step)
            .field("boxes_open", &self.boxes_open())
            .field("position_computes", &self.position_computes.len())
            .field("force_computes", &self.force_computes.len())
            .finish()
    }
}

impl Patch {
    /// Create an empty patch. Particles arrive through [`replace_atoms`](Self::replace_atoms).
    pub fn new(
        id: PatchId,
        atom_map: Arc<AtomMap>,
        integrator: Arc<dyn Integrator>,
        averaged_positions: bool,
    ) -> Self {
        let boxes = Arc::new(BoxCounter {
            patch: id,
            open: AtomicUsize::new(0),
            integrator,
        });
        let results = Arc::new(Mutex::new(Results::default()));

        let position_box = Arc::new(Self::read_box(id, BoxKind::Position, &boxes));
        let avg_position_box = Arc::new(Self::read_box(id, BoxKind::AvgPosition, &boxes));

        let force_box = {
            let boxes = boxes.clone();
            let results = results.clone();
            let position_box = position_box.clone();
            let avg_position_box = avg_position_box.clone();
            let label = BoxLabel {
                patch: id,
                kind: BoxKind::Force,
            };
            let force_box = OwnedForceBox::new(label, BoxMode::Accumulate, move |completion| {
                reduce_forces(&boxes, &results, completion);
                // forces final: no compute still needs this step's positions
                for read_box in [&position_box, &avg_position_box] {
                    let _ = read_box.close();
                }
                boxes.box_closed(BoxKind::Force);
            })
            .with_deposit_check(move |task, frame: &ForceFrame, deposit: &ForceDeposit| {
                if deposit.forces.len() == frame.num_atoms {
                    Ok(())
                } else {
                    Err(KernelError::DepositLength {
                        label,
                        task,
                        expected: frame.num_atoms,
                        got: deposit.forces.len(),
                    })
                }
            });
            Arc::new(force_box)
        };

        Self {
            id,
            atoms: Arc::new(Vec::new()),
            avg_atoms: Arc::new(Vec::new()),
            num_fixed_atoms: 0,
            has_new_atoms: false,
            membership_changed: false,
            step: 0,
            averaged_positions,
            position_box,
            avg_position_box,
            force_box,
            position_computes: ComputeList::new(),
            avg_position_computes: ComputeList::new(),
            force_computes: ComputeList::new(),
            results,
            boxes,
            atom_map,
        }
    }

    fn read_box(id: PatchId, kind: BoxKind, boxes: &Arc<BoxCounter>) -> OwnedPositionBox {
        let boxes = boxes.clone();
        OwnedPositionBox::new(BoxLabel { patch: id, kind }, BoxMode::Read, move |_| {
            boxes.box_closed(kind)
        })
    }

    // ------------------------------------------------------------------
    // Compute registration
    // ------------------------------------------------------------------

    pub fn register_position_pickup(&mut self, task: ComputeId) -> Result<BoxHandle> {
        let handle = self.position_box.register(task)?;
        self.position_computes.insert(task);
        Ok(handle)
    }

    pub fn unregister_position_pickup(&mut self, handle: BoxHandle) -> Result<()> {
        let task = handle.task();
        self.position_box.unregister(handle)?;
        self.position_computes.remove(task);
        Ok(())
    }

    pub fn register_avg_position_pickup(&mut self, task: ComputeId) -> Result<BoxHandle> {
        let handle = self.avg_position_box.register(task)?;
        self.avg_position_computes.insert(task);
        Ok(handle)
    }

    pub fn unregister_avg_position_pickup(&mut self, handle: BoxHandle) -> Result<()> {
        let task = handle.task();
        self.avg_position_box.unregister(handle)?;
        self.avg_position_computes.remove(task);
        Ok(())
    }

    pub fn register_force_deposit(&mut self, task: ComputeId) -> Result<BoxHandle> {
        let handle = self.force_box.register(task)?;
        self.force_computes.insert(task);
        Ok(handle)
    }

    pub fn unregister_force_deposit(&mut self, handle: BoxHandle) -> Result<()> {
        let task = handle.task();
        self.force_box.unregister(handle)?;
        self.force_computes.remove(task);
        Ok(())
    }

    pub fn position_box(&self) -> PositionBox {
        ConsumerBox::new(self.position_box.clone())
    }

    pub fn avg_position_box(&self) -> PositionBox {
        ConsumerBox::new(self.avg_position_box.clone())
    }

    pub fn force_box(&self) -> ForceBox {
        ConsumerBox::new(self.force_box.clone())
    }

    // ------------------------------------------------------------------
    // Step protocol
    // ------------------------------------------------------------------

    /// Publish this step's positions and open the force box.
    ///
    /// A non-zero `migration` tag marks that membership changed since the last
    /// step. The atom map must already reflect the current membership.
    ///
    /// Nothing changes unless every box this step needs is idle. If an open
    /// still fails, the boxes already opened are closed again and the counter
    /// is reset, so the patch can retry.
    pub fn positions_ready(&mut self, migration: u32) -> Result<()> {
        let count = if self.averaged_positions { 3 } else { 2 };
        let needed = [
            (self.position_box.label(), self.position_box.phase(), true),
            (
                self.avg_position_box.label(),
                self.avg_position_box.phase(),
                self.averaged_positions,
            ),
            (self.force_box.label(), self.force_box.phase(), true),
        ];
        if let Some(&(label, _, _)) = needed
            .iter()
            .find(|(_, phase, used)| *used && *phase != BoxPhase::Idle)
        {
            error!(patch = %self.id, box_label = %label, "positions_ready while a box is busy");
            return Err(KernelError::AlreadyOpen {
                label,
                cycle: self.cycle_of(label.kind),
            });
        }
        if let Err(open) = self
            .boxes
            .open
            .compare_exchange(0, count, Ordering::AcqRel, Ordering::Acquire)
        {
            error!(patch = %self.id, open, "positions_ready while boxes still open");
            return Err(KernelError::AlreadyOpen {
                label: self.position_box.label(),
                cycle: self.position_box.cycle(),
            });
        }

        self.has_new_atoms = migration != 0 || self.membership_changed;
        self.membership_changed = false;
        self.step += 1;
        self.results.lock().reset(self.step, self.atoms.len());

        trace!(
            patch = %self.id,
            step = self.step,
            atoms = self.atoms.len(),
            new_atoms = self.has_new_atoms,
            "Positions ready"
        );

        self.open_boxes().inspect_err(|e| {
            error!(patch = %self.id, error = %e, "Opening boxes failed; rolling back");
            for read_box in [&self.position_box, &self.avg_position_box] {
                let _ = read_box.close();
            }
            self.boxes.open.store(0, Ordering::Release);
        })
    }

    fn open_boxes(&self) -> Result<()> {
        self.position_box.open(self.atoms.clone())?;
        if self.averaged_positions {
            self.avg_position_box.open(self.avg_atoms.clone())?;
        }
        self.force_box.open(Arc::new(ForceFrame {
            patch: self.id,
            step: self.step,
            num_atoms: self.atoms.len(),
        }))?;
        Ok(())
    }

    fn cycle_of(&self, kind: BoxKind) -> u64 {
        match kind {
            BoxKind::Position => self.position_box.cycle(),
            BoxKind::AvgPosition => self.avg_position_box.cycle(),
            BoxKind::Force => self.force_box.cycle(),
        }
    }

    /// Replace the patch's membership and update the atom map.
    ///
    /// Outgoing particles are unregistered first (stale entries owned by another
    /// patch are left alone), then the new list is registered in local order.
    pub fn replace_atoms(&mut self, atoms: Vec<CompAtom>) -> Result<()> {
        self.ensure_closed()?;

        let outgoing: Vec<ParticleId> = self.atoms.iter().map(|a| a.id).collect();
        let incoming: Vec<ParticleId> = atoms.iter().map(|a| a.id).collect();
        self.atom_map.unregister(self.id, &outgoing)?;
        self.atom_map.register(self.id, &incoming)?;

        debug!(
            patch = %self.id,
            outgoing = outgoing.len(),
            incoming = incoming.len(),
            "Patch membership replaced"
        );

        self.avg_atoms = Arc::new(atoms.clone());
        self.atoms = Arc::new(atoms);
        self.membership_changed = true;
        Ok(())
    }

    /// Mutable access to positions between steps (membership unchanged).
    ///
    /// Computes still holding last step's payload keep their copy.
    pub fn atoms_mut(&mut self) -> Result<&mut Vec<CompAtom>> {
        self.ensure_closed()?;
        Ok(Arc::make_mut(&mut self.atoms))
    }

    /// Set the averaged positions published through the avg position box.
    pub fn set_avg_atoms(&mut self, avg: Vec<CompAtom>) -> Result<()> {
        self.ensure_closed()?;
        self.avg_atoms = Arc::new(avg);
        Ok(())
    }

    fn ensure_closed(&self) -> Result<()> {
        match self.boxes_open() {
            0 => Ok(()),
            open => Err(KernelError::BoxesOpen {
                patch: self.id,
                open,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn id(&self) -> PatchId {
        self.id
    }

    pub fn atoms(&self) -> &[CompAtom] {
        &self.atoms
    }

    pub fn num_atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn num_fixed_atoms(&self) -> usize {
        self.num_fixed_atoms
    }

    pub fn set_num_fixed_atoms(&mut self, n: usize) {
        self.num_fixed_atoms = n;
    }

    /// Whether membership changed since the step before the current one.
    pub fn has_new_atoms(&self) -> bool {
        self.has_new_atoms || self.membership_changed
    }

    /// Number of computes that read this patch's positions.
    pub fn num_computes(&self) -> usize {
        self.position_computes.len()
    }

    pub fn force_computes(&self) -> &ComputeList {
        &self.force_computes
    }

    pub fn avg_position_computes(&self) -> &ComputeList {
        &self.avg_position_computes
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn boxes_open(&self) -> usize {
        self.boxes.open.load(Ordering::Acquire)
    }

    /// Copy of the most recently reduced forces.
    pub fn results(&self) -> Results {
        self.results.lock().clone()
    }
}

/// Completion callback body of the force box.
fn reduce_forces(
    boxes: &BoxCounter,
    results: &Mutex<Results>,
    completion: Completion<ForceDeposit>,
) {
    let mut results = results.lock();
    for (task, deposit) in completion.deposits {
        // lengths were checked when each deposit was made
        let channel = &mut results.f[deposit.kind.index()];
        trace!(patch = %boxes.patch, task = %task, kind = ?deposit.kind, "Reducing deposit");
        for (acc, force) in channel.iter_mut().zip(&deposit.forces) {
            for (a, f) in acc.iter_mut().zip(force) {
                *a += f;
            }
        }
    }
    trace!(patch = %boxes.patch, cycle = completion.cycle, "Forces reduced");
    boxes
        .integrator
        .forces_ready(boxes.patch, completion.cycle, &results);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::NullIntegrator;

    #[derive(Default)]
    struct Recorder {
        forces: Mutex<Vec<(PatchId, u64, Vec<Vector>)>>,
        closed: Mutex<Vec<PatchId>>,
    }

    impl Integrator for Recorder {
        fn forces_ready(&self, patch: PatchId, cycle: u64, results: &Results) {
            self.forces.lock().push((patch, cycle, results.total()));
        }

        fn boxes_closed(&self, patch: PatchId) {
            self.closed.lock().push(patch);
        }
    }

    fn atoms(ids: &[ParticleId]) -> Vec<CompAtom> {
        ids.iter()
            .map(|&id| CompAtom {
                id,
                position: [id as f64, 0.0, 0.0],
            })
            .collect()
    }

    fn deposit(kind: ForceKind, value: f64, n: usize) -> ForceDeposit {
        ForceDeposit {
            kind,
            forces: vec![[value, 0.0, 0.0]; n],
        }
    }

    #[test]
    fn test_replace_atoms_updates_map() {
        let map = Arc::new(AtomMap::with_capacity(10));
        let mut patch = Patch::new(PatchId(1), map.clone(), Arc::new(NullIntegrator), false);
        patch.replace_atoms(atoms(&[3, 7])).unwrap();
        assert_eq!(map.lookup(7).unwrap().index, 1);

        patch.replace_atoms(atoms(&[7])).unwrap();
        assert!(map.lookup(3).is_err());
        assert_eq!(map.lookup(7).unwrap().index, 0);
        assert!(patch.has_new_atoms());
    }

    #[test]
    fn test_three_computes_sum_in_any_order() {
        let map = Arc::new(AtomMap::with_capacity(10));
        let recorder = Arc::new(Recorder::default());
        let mut patch = Patch::new(PatchId(0), map, recorder.clone(), false);
        patch.replace_atoms(atoms(&[0, 1])).unwrap();

        let a = patch.register_force_deposit(ComputeId(10)).unwrap();
        let b = patch.register_force_deposit(ComputeId(11)).unwrap();
        let c = patch.register_force_deposit(ComputeId(12)).unwrap();
        patch.positions_ready(0).unwrap();

        let force_box = patch.force_box();
        force_box.deposit(&b, deposit(ForceKind::Normal, 2.0, 2)).unwrap();
        force_box.deposit(&c, deposit(ForceKind::Nonbonded, 4.0, 2)).unwrap();
        assert!(recorder.forces.lock().is_empty());
        force_box.deposit(&a, deposit(ForceKind::Normal, 1.0, 2)).unwrap();

        let forces = recorder.forces.lock();
        assert_eq!(forces.len(), 1);
        assert_eq!(forces[0].2, vec![[7.0, 0.0, 0.0]; 2]);
        assert_eq!(patch.results().forces(ForceKind::Normal), &[[3.0, 0.0, 0.0]; 2]);
        assert_eq!(*recorder.closed.lock(), vec![PatchId(0)]);
        assert_eq!(patch.boxes_open(), 0);
    }

    #[test]
    fn test_positions_visible_until_forces_final() {
        let map = Arc::new(AtomMap::with_capacity(10));
        let mut patch = Patch::new(PatchId(0), map, Arc::new(NullIntegrator), true);
        patch.replace_atoms(atoms(&[4, 5, 6])).unwrap();

        let pos = patch.register_position_pickup(ComputeId(1)).unwrap();
        let avg = patch.register_avg_position_pickup(ComputeId(1)).unwrap();
        let force = patch.register_force_deposit(ComputeId(1)).unwrap();
        assert_eq!(patch.num_computes(), 1);

        patch.positions_ready(1).unwrap();
        assert!(patch.has_new_atoms());
        assert_eq!(patch.boxes_open(), 3);
        let seen = patch.position_box().retrieve(&pos).unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(patch.avg_position_box().retrieve(&avg).unwrap().len(), 3);

        assert!(matches!(
            patch.replace_atoms(atoms(&[1])),
            Err(KernelError::BoxesOpen { open: 3, .. })
        ));

        patch
            .force_box()
            .deposit(&force, deposit(ForceKind::Slow, 1.0, 3))
            .unwrap();
        assert_eq!(patch.boxes_open(), 0);
        assert!(patch.position_box().retrieve(&pos).is_err());
    }

    #[test]
    fn test_positions_ready_twice_fails() {
        let map = Arc::new(AtomMap::with_capacity(4));
        let mut patch = Patch::new(PatchId(2), map, Arc::new(NullIntegrator), false);
        patch.replace_atoms(atoms(&[0])).unwrap();
        let _force = patch.register_force_deposit(ComputeId(1)).unwrap();

        patch.positions_ready(0).unwrap();
        assert!(matches!(
            patch.positions_ready(0),
            Err(KernelError::AlreadyOpen { .. })
        ));
    }

    #[test]
    fn test_patch_without_computes_closes_at_once() {
        let map = Arc::new(AtomMap::with_capacity(4));
        let recorder = Arc::new(Recorder::default());
        let mut patch = Patch::new(PatchId(3), map, recorder.clone(), false);
        patch.replace_atoms(atoms(&[0, 1])).unwrap();

        patch.positions_ready(0).unwrap();
        assert_eq!(patch.boxes_open(), 0);
        assert_eq!(recorder.forces.lock().len(), 1);
        assert_eq!(*recorder.closed.lock(), vec![PatchId(3)]);
    }

    #[test]
    fn test_unregister_force_deposit_shrinks_expected() {
        let map = Arc::new(AtomMap::with_capacity(4));
        let mut patch = Patch::new(PatchId(0), map, Arc::new(NullIntegrator), false);
        patch.replace_atoms(atoms(&[0])).unwrap();
        let a = patch.register_force_deposit(ComputeId(1)).unwrap();
        let b = patch.register_force_deposit(ComputeId(2)).unwrap();
        patch.unregister_force_deposit(b).unwrap();
        assert_eq!(patch.force_computes().len(), 1);

        patch.positions_ready(0).unwrap();
        patch
            .force_box()
            .deposit(&a, deposit(ForceKind::Normal, 1.0, 1))
            .unwrap();
        assert_eq!(patch.boxes_open(), 0);
    }

    #[test]
    fn test_busy_box_leaves_patch_usable() {
        let map = Arc::new(AtomMap::with_capacity(4));
        let recorder = Arc::new(Recorder::default());
        let mut patch = Patch::new(PatchId(0), map, recorder.clone(), false);
        patch.replace_atoms(atoms(&[0, 1])).unwrap();
        let _force = patch.register_force_deposit(ComputeId(1)).unwrap();

        // opened outside the step protocol
        patch.position_box.open(Arc::new(Vec::new())).unwrap();
        assert!(matches!(
            patch.positions_ready(0),
            Err(KernelError::AlreadyOpen {
                label: BoxLabel {
                    kind: BoxKind::Position,
                    ..
                },
                cycle: 1,
            })
        ));
        assert_eq!(patch.boxes_open(), 0);
        patch.replace_atoms(atoms(&[1])).unwrap();

        patch.position_box.close().unwrap();
        assert_eq!(patch.boxes_open(), 0);
        assert!(recorder.closed.lock().is_empty());

        patch.positions_ready(0).unwrap();
        assert_eq!(patch.boxes_open(), 2);
    }

    #[test]
    fn test_short_deposit_rejected_before_counting() {
        let map = Arc::new(AtomMap::with_capacity(4));
        let mut patch = Patch::new(PatchId(0), map, Arc::new(NullIntegrator), false);
        patch.replace_atoms(atoms(&[0, 1, 2])).unwrap();
        let a = patch.register_force_deposit(ComputeId(1)).unwrap();
        patch.positions_ready(0).unwrap();

        let err = patch
            .force_box()
            .deposit(&a, deposit(ForceKind::Normal, 1.0, 2))
            .unwrap_err();
        assert_eq!(
            err,
            KernelError::DepositLength {
                label: BoxLabel {
                    patch: PatchId(0),
                    kind: BoxKind::Force,
                },
                task: ComputeId(1),
                expected: 3,
                got: 2,
            }
        );
        assert_eq!(patch.boxes_open(), 2);

        patch
            .force_box()
            .deposit(&a, deposit(ForceKind::Normal, 1.0, 3))
            .unwrap();
        assert_eq!(patch.boxes_open(), 0);
    }

    #[test]
    fn test_atoms_mut_between_steps() {
        let map = Arc::new(AtomMap::with_capacity(4));
        let mut patch = Patch::new(PatchId(0), map, Arc::new(NullIntegrator), false);
        patch.replace_atoms(atoms(&[2])).unwrap();
        patch.atoms_mut().unwrap()[0].position = [9.0, 9.0, 9.0];
        assert_eq!(patch.atoms()[0].position, [9.0, 9.0, 9.0]);
    }
}
