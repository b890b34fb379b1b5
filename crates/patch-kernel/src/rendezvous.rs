//! OwnerBox / BoxHandle: the producer/consumer rendezvous between a patch and its computes.
//!
//! A patch owns one [`OwnerBox`] per buffer kind. Each compute that needs the
//! buffer registers once and receives a [`BoxHandle`], the only value accepted
//! by `retrieve`, `deposit` and `unregister`. Computes reach the box through a
//! [`ConsumerBox`], which offers `retrieve` and `deposit` and nothing the owner
//! alone may call.
//!
//! ```text
//!   Idle ──open(payload)──▶ Open ──last deposit / owner close──▶ Closed ──▶ Idle, callback
//!                            │
//!                            ├─ retrieve (any number, read or accumulate box)
//!                            └─ deposit  (exactly once per handle, accumulate box only)
//! ```
//!
//! Read boxes never count down; the owner closes them. Accumulate boxes count
//! down one per deposit with an atomic decrement-and-test, and the depositor that
//! takes the count to zero runs the owner's completion callback before its
//! `deposit` call returns. Completion is therefore ordered after every deposit of
//! the cycle, and nobody has to poll for it.
//!
//! Registration changes are only valid while the box is idle. That is a
//! scheduler contract: a compute that will not deposit this cycle has to be
//! unregistered before `open`, otherwise the cycle never completes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::error::{BoxLabel, KernelError, Result};
use crate::ids::ComputeId;
use crate::registry::ComputeList;

static NEXT_BOX_ID: AtomicU64 = AtomicU64::new(1);

const IDLE: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

/// Which patch buffer a box carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoxKind {
    Position,
    AvgPosition,
    Force,
}

impl std::fmt::Display for BoxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoxKind::Position => write!(f, "position box"),
            BoxKind::AvgPosition => write!(f, "avg position box"),
            BoxKind::Force => write!(f, "force box"),
        }
    }
}

/// How consumers interact with a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxMode {
    /// Consumers only retrieve; the owner closes the cycle.
    Read,
    /// Every registered consumer deposits exactly once; the last deposit closes the cycle.
    Accumulate,
}

/// Observable lifecycle state of a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxPhase {
    Idle,
    Open,
    Closed,
}

/// Capability to use one box: one deposit (or any number of retrievals) per cycle.
///
/// Deliberately not `Clone`. Giving it back through [`OwnerBox::unregister`]
/// consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct BoxHandle {
    box_id: u64,
    task: ComputeId,
    token: u64,
}

impl BoxHandle {
    pub fn task(&self) -> ComputeId {
        self.task
    }
}

/// What the owner receives when a cycle closes.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion<D> {
    pub label: BoxLabel,
    pub cycle: u64,
    /// Deposited values in registration order (empty for read boxes).
    pub deposits: Vec<(ComputeId, D)>,
    /// Number of retrievals observed during the cycle.
    pub retrievals: usize,
}

type CompletionFn<D> = Box<dyn Fn(Completion<D>) + Send + Sync>;

type DepositCheck<P, D> = Box<dyn Fn(ComputeId, &P, &D) -> Result<()> + Send + Sync>;

struct Slot<D> {
    token: u64,
    last_cycle: AtomicU64,
    value: Mutex<Option<D>>,
}

struct Registrations<P, D> {
    computes: ComputeList,
    slots: HashMap<ComputeId, Slot<D>>,
    payload: Option<Arc<P>>,
    next_token: u64,
}

/// Owner side of the rendezvous.
///
/// `P` is the payload the owner publishes on `open`; `D` is what consumers
/// deposit on an accumulate box (use `()` for read boxes).
pub struct OwnerBox<P, D = ()> {
    id: u64,
    label: BoxLabel,
    mode: BoxMode,
    phase: AtomicU8,
    cycle: AtomicU64,
    remaining: AtomicUsize,
    retrievals: AtomicUsize,
    inner: RwLock<Registrations<P, D>>,
    on_complete: CompletionFn<D>,
    deposit_check: Option<DepositCheck<P, D>>,
}

impl<P, D> std::fmt::Debug for OwnerBox<P, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerBox")
            .field("label", &self.label)
            .field("mode", &self.mode)
            .field("phase", &self.phase())
            .field("cycle", &self.cycle())
            .field("remaining", &self.remaining())
            .field("expected", &self.expected())
            .finish()
    }
}

impl<P, D> OwnerBox<P, D> {
    /// Create an idle box. `on_complete` runs once per cycle when the box closes.
    pub fn new<F>(label: BoxLabel, mode: BoxMode, on_complete: F) -> Self
    where
        F: Fn(Completion<D>) + Send + Sync + 'static,
    {
        Self {
            id: NEXT_BOX_ID.fetch_add(1, Ordering::Relaxed),
            label,
            mode,
            phase: AtomicU8::new(IDLE),
            cycle: AtomicU64::new(0),
            remaining: AtomicUsize::new(0),
            retrievals: AtomicUsize::new(0),
            inner: RwLock::new(Registrations {
                computes: ComputeList::new(),
                slots: HashMap::new(),
                payload: None,
                next_token: 1,
            }),
            on_complete: Box::new(on_complete),
            deposit_check: None,
        }
    }

    /// Validate each deposit against the cycle's payload before it is counted.
    ///
    /// A rejected deposit leaves the handle unspent and the countdown untouched.
    pub fn with_deposit_check<F>(mut self, check: F) -> Self
    where
        F: Fn(ComputeId, &P, &D) -> Result<()> + Send + Sync + 'static,
    {
        self.deposit_check = Some(Box::new(check));
        self
    }

    pub fn label(&self) -> BoxLabel {
        self.label
    }

    pub fn mode(&self) -> BoxMode {
        self.mode
    }

    pub fn phase(&self) -> BoxPhase {
        match self.phase.load(Ordering::Acquire) {
            IDLE => BoxPhase::Idle,
            OPEN => BoxPhase::Open,
            _ => BoxPhase::Closed,
        }
    }

    /// Number of the current (or most recent) cycle; 0 before the first `open`.
    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    /// Number of registered computes.
    pub fn expected(&self) -> usize {
        self.inner.read().computes.len()
    }

    /// Deposits still outstanding in the current cycle.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Registered compute ids in registration order.
    pub fn computes(&self) -> Vec<ComputeId> {
        self.inner.read().computes.iter().collect()
    }

    /// Register a compute and hand back its capability.
    pub fn register(&self, task: ComputeId) -> Result<BoxHandle> {
        let mut regs = self.inner.write();
        if !regs.computes.insert(task) {
            warn!(label = %self.label, task = %task, "Compute registered twice");
            return Err(KernelError::AlreadyRegistered {
                label: self.label,
                task,
            });
        }
        if self.phase.load(Ordering::Acquire) != IDLE {
            warn!(
                label = %self.label,
                task = %task,
                "Compute registered while box is not idle; expected count out of step"
            );
        }

        let token = regs.next_token;
        regs.next_token += 1;
        regs.slots.insert(
            task,
            Slot {
                token,
                last_cycle: AtomicU64::new(0),
                value: Mutex::new(None),
            },
        );

        debug!(
            label = %self.label,
            task = %task,
            expected = regs.computes.len(),
            "Compute registered"
        );
        Ok(BoxHandle {
            box_id: self.id,
            task,
            token,
        })
    }

    /// Release a handle and drop the compute from the box's list.
    pub fn unregister(&self, handle: BoxHandle) -> Result<()> {
        let mut regs = self.inner.write();
        self.slot(&regs, &handle)?;
        regs.slots.remove(&handle.task);
        regs.computes.remove(handle.task);

        debug!(
            label = %self.label,
            task = %handle.task,
            expected = regs.computes.len(),
            "Compute unregistered"
        );
        Ok(())
    }

    /// Publish `payload` and start a new cycle. Returns the cycle number.
    ///
    /// An accumulate box with no registered computes completes immediately.
    pub fn open(&self, payload: Arc<P>) -> Result<u64> {
        let (cycle, expected) = {
            let mut regs = self.inner.write();
            if self.phase.load(Ordering::Acquire) != IDLE {
                return Err(KernelError::AlreadyOpen {
                    label: self.label,
                    cycle: self.cycle(),
                });
            }
            let expected = regs.computes.len();
            regs.payload = Some(payload);
            let cycle = self.cycle.fetch_add(1, Ordering::AcqRel) + 1;
            self.remaining.store(expected, Ordering::Release);
            self.retrievals.store(0, Ordering::Release);
            self.phase.store(OPEN, Ordering::Release);
            (cycle, expected)
        };

        trace!(label = %self.label, cycle, expected, "Box opened");

        if self.mode == BoxMode::Accumulate && expected == 0 {
            self.phase.store(CLOSED, Ordering::Release);
            self.finish(cycle, Vec::new());
        }
        Ok(cycle)
    }

    /// Read the published payload. Never counts toward completion.
    pub fn retrieve(&self, handle: &BoxHandle) -> Result<Arc<P>> {
        let regs = self.inner.read();
        self.slot(&regs, handle)?;
        if self.phase.load(Ordering::Acquire) != OPEN {
            return Err(KernelError::NotOpen { label: self.label });
        }
        let payload = regs
            .payload
            .clone()
            .ok_or(KernelError::NotOpen { label: self.label })?;
        self.retrievals.fetch_add(1, Ordering::Relaxed);
        Ok(payload)
    }

    /// Deposit this compute's value for the current cycle.
    ///
    /// The call that brings the outstanding count to zero runs the completion
    /// callback before returning.
    pub fn deposit(&self, handle: &BoxHandle, value: D) -> Result<()> {
        let regs = self.inner.read();
        let slot = self.slot(&regs, handle)?;
        if self.mode == BoxMode::Read {
            return Err(KernelError::WrongMode {
                label: self.label,
                task: handle.task,
            });
        }

        let cycle = self.cycle();
        if cycle != 0 && slot.last_cycle.load(Ordering::Acquire) == cycle {
            return Err(self.double_use(handle.task, cycle));
        }
        if self.phase.load(Ordering::Acquire) != OPEN {
            return Err(KernelError::NotOpen { label: self.label });
        }
        if let (Some(check), Some(payload)) = (&self.deposit_check, regs.payload.as_deref()) {
            check(handle.task, payload, &value).inspect_err(|e| {
                error!(
                    label = %self.label,
                    task = %handle.task,
                    cycle,
                    error = %e,
                    "Deposit rejected"
                );
            })?;
        }
        if slot.last_cycle.swap(cycle, Ordering::AcqRel) == cycle {
            return Err(self.double_use(handle.task, cycle));
        }

        *slot.value.lock() = Some(value);

        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| {
                error!(label = %self.label, task = %handle.task, cycle, "Deposit past zero");
                KernelError::CycleExhausted {
                    label: self.label,
                    cycle,
                }
            })?;

        trace!(
            label = %self.label,
            task = %handle.task,
            cycle,
            remaining = previous - 1,
            "Deposit received"
        );
        if previous != 1 {
            return Ok(());
        }

        self.phase.store(CLOSED, Ordering::Release);
        let deposits: Vec<(ComputeId, D)> = regs
            .computes
            .iter()
            .filter_map(|id| {
                regs.slots
                    .get(&id)
                    .and_then(|slot| slot.value.lock().take())
                    .map(|value| (id, value))
            })
            .collect();
        drop(regs);

        self.finish(cycle, deposits);
        Ok(())
    }

    /// Owner close of a read box.
    ///
    /// Consumers may have retrieved fewer times than there are registrations;
    /// read boxes never require full consumption.
    pub fn close(&self) -> Result<()> {
        if self.mode == BoxMode::Accumulate {
            return Err(KernelError::ClosedByDeposits { label: self.label });
        }
        self.phase
            .compare_exchange(OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| KernelError::NotOpen { label: self.label })?;

        let cycle = self.cycle();
        let expected = self.expected();
        let retrievals = self.retrievals.load(Ordering::Acquire);
        if retrievals < expected {
            debug!(
                label = %self.label,
                cycle,
                retrievals,
                expected,
                "Read box closed with partial pickup"
            );
        }
        self.finish(cycle, Vec::new());
        Ok(())
    }

    fn finish(&self, cycle: u64, deposits: Vec<(ComputeId, D)>) {
        let retrievals = self.retrievals.load(Ordering::Acquire);
        trace!(
            label = %self.label,
            cycle,
            deposits = deposits.len(),
            retrievals,
            "Box closed"
        );
        // idle before the callback: the owner may reopen as soon as it hears
        self.phase.store(IDLE, Ordering::Release);
        (self.on_complete)(Completion {
            label: self.label,
            cycle,
            deposits,
            retrievals,
        });
    }

    fn slot<'a>(
        &self,
        regs: &'a Registrations<P, D>,
        handle: &BoxHandle,
    ) -> Result<&'a Slot<D>> {
        let unknown = KernelError::UnknownHandle {
            label: self.label,
            task: handle.task,
        };
        if handle.box_id != self.id {
            return Err(unknown);
        }
        regs.slots
            .get(&handle.task)
            .filter(|slot| slot.token == handle.token)
            .ok_or(unknown)
    }

    fn double_use(&self, task: ComputeId, cycle: u64) -> KernelError {
        error!(label = %self.label, task = %task, cycle, "Handle used twice in one cycle");
        KernelError::DoubleUse {
            label: self.label,
            task,
            cycle,
        }
    }
}

/// Consumer side of a box: retrieve and deposit through a handle.
///
/// Cloning is cheap; every clone refers to the same owner box.
pub struct ConsumerBox<P, D = ()> {
    owner: Arc<OwnerBox<P, D>>,
}

impl<P, D> Clone for ConsumerBox<P, D> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner.clone(),
        }
    }
}

impl<P, D> std::fmt::Debug for ConsumerBox<P, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConsumerBox").field(&self.owner).finish()
    }
}

impl<P, D> ConsumerBox<P, D> {
    pub fn new(owner: Arc<OwnerBox<P, D>>) -> Self {
        Self { owner }
    }

    pub fn retrieve(&self, handle: &BoxHandle) -> Result<Arc<P>> {
        self.owner.retrieve(handle)
    }

    pub fn deposit(&self, handle: &BoxHandle, value: D) -> Result<()> {
        self.owner.deposit(handle, value)
    }

    pub fn label(&self) -> BoxLabel {
        self.owner.label()
    }

    pub fn phase(&self) -> BoxPhase {
        self.owner.phase()
    }

    pub fn cycle(&self) -> u64 {
        self.owner.cycle()
    }

    pub fn remaining(&self) -> usize {
        self.owner.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PatchId;

    fn label(kind: BoxKind) -> BoxLabel {
        BoxLabel {
            patch: PatchId(0),
            kind,
        }
    }

    /// Accumulate box whose completions land in the returned vector.
    fn force_box() -> (OwnerBox<(), f64>, Arc<Mutex<Vec<Completion<f64>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let owner = OwnerBox::new(label(BoxKind::Force), BoxMode::Accumulate, move |c| {
            sink.lock().push(c)
        });
        (owner, seen)
    }

    #[test]
    fn test_completion_fires_on_last_deposit_only() {
        let (owner, seen) = force_box();
        let a = owner.register(ComputeId(1)).unwrap();
        let b = owner.register(ComputeId(2)).unwrap();
        let c = owner.register(ComputeId(3)).unwrap();

        owner.open(Arc::new(())).unwrap();
        owner.deposit(&b, 2.0).unwrap();
        assert!(seen.lock().is_empty());
        owner.deposit(&c, 3.0).unwrap();
        assert!(seen.lock().is_empty());
        assert_eq!(owner.remaining(), 1);
        owner.deposit(&a, 1.0).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let total: f64 = seen[0].deposits.iter().map(|(_, v)| v).sum();
        assert_eq!(total, 6.0);
        // registration order, not deposit order
        let order: Vec<u32> = seen[0].deposits.iter().map(|(id, _)| id.0).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(owner.phase(), BoxPhase::Idle);
    }

    #[test]
    fn test_double_deposit_rejected_without_retrigger() {
        let (owner, seen) = force_box();
        let a = owner.register(ComputeId(1)).unwrap();
        let b = owner.register(ComputeId(2)).unwrap();

        owner.open(Arc::new(())).unwrap();
        owner.deposit(&a, 1.0).unwrap();
        let err = owner.deposit(&a, 1.0).unwrap_err();
        assert!(matches!(err, KernelError::DoubleUse { cycle: 1, .. }));

        owner.deposit(&b, 1.0).unwrap();
        // after completion the spent handle is still a double use, not a new cycle
        let err = owner.deposit(&b, 1.0).unwrap_err();
        assert!(matches!(err, KernelError::DoubleUse { .. }));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_handles_renew_each_cycle() {
        let (owner, seen) = force_box();
        let a = owner.register(ComputeId(1)).unwrap();

        for step in 0..3 {
            owner.open(Arc::new(())).unwrap();
            owner.deposit(&a, step as f64).unwrap();
        }
        let seen = seen.lock();
        let cycles: Vec<u64> = seen.iter().map(|c| c.cycle).collect();
        assert_eq!(cycles, vec![1, 2, 3]);
    }

    #[test]
    fn test_open_twice_fails() {
        let (owner, _) = force_box();
        owner.register(ComputeId(1)).unwrap();
        owner.open(Arc::new(())).unwrap();
        assert!(matches!(
            owner.open(Arc::new(())),
            Err(KernelError::AlreadyOpen { cycle: 1, .. })
        ));
    }

    #[test]
    fn test_zero_consumers_complete_on_open() {
        let (owner, seen) = force_box();
        owner.open(Arc::new(())).unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert!(seen.lock()[0].deposits.is_empty());
        assert_eq!(owner.phase(), BoxPhase::Idle);
    }

    #[test]
    fn test_register_twice_fails() {
        let (owner, _) = force_box();
        owner.register(ComputeId(5)).unwrap();
        assert!(matches!(
            owner.register(ComputeId(5)),
            Err(KernelError::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn test_register_unregister_keeps_expected() {
        let (owner, _) = force_box();
        owner.register(ComputeId(1)).unwrap();
        let before = owner.expected();

        let handle = owner.register(ComputeId(2)).unwrap();
        owner.unregister(handle).unwrap();
        assert_eq!(owner.expected(), before);
    }

    #[test]
    fn test_handle_from_another_box_is_unknown() {
        let (owner, _) = force_box();
        let _own = owner.register(ComputeId(2)).unwrap();
        // same compute id, but the handle was issued by another box
        let (other, _) = force_box();
        let foreign = other.register(ComputeId(2)).unwrap();

        owner.open(Arc::new(())).unwrap();
        assert!(matches!(
            owner.deposit(&foreign, 1.0),
            Err(KernelError::UnknownHandle { .. })
        ));
    }

    #[test]
    fn test_read_box_allows_repeated_retrieval() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let sink = closed.clone();
        let owner: OwnerBox<Vec<u32>> =
            OwnerBox::new(label(BoxKind::Position), BoxMode::Read, move |c| {
                sink.lock().push(c.retrievals)
            });
        let a = owner.register(ComputeId(1)).unwrap();
        let b = owner.register(ComputeId(2)).unwrap();

        owner.open(Arc::new(vec![7, 8, 9])).unwrap();
        for _ in 0..5 {
            assert_eq!(*owner.retrieve(&a).unwrap(), vec![7, 8, 9]);
        }
        assert_eq!(*owner.retrieve(&b).unwrap(), vec![7, 8, 9]);
        assert_eq!(owner.phase(), BoxPhase::Open);
        assert!(closed.lock().is_empty());

        owner.close().unwrap();
        assert_eq!(*closed.lock(), vec![6]);
        assert!(matches!(
            owner.retrieve(&a),
            Err(KernelError::NotOpen { .. })
        ));
    }

    #[test]
    fn test_read_box_rejects_deposit() {
        let owner: OwnerBox<u32, u32> = OwnerBox::new(label(BoxKind::Position), BoxMode::Read, |_| {});
        let a = owner.register(ComputeId(1)).unwrap();
        owner.open(Arc::new(1)).unwrap();
        assert!(matches!(
            owner.deposit(&a, 3),
            Err(KernelError::WrongMode { .. })
        ));
    }

    #[test]
    fn test_accumulate_box_rejects_owner_close() {
        let (owner, _) = force_box();
        owner.register(ComputeId(1)).unwrap();
        owner.open(Arc::new(())).unwrap();
        assert!(matches!(
            owner.close(),
            Err(KernelError::ClosedByDeposits { .. })
        ));
    }

    #[test]
    fn test_deposit_check_rejects_without_spending_handle() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let owner: OwnerBox<usize, Vec<f64>> =
            OwnerBox::new(label(BoxKind::Force), BoxMode::Accumulate, move |c| {
                sink.lock().push(c.deposits.len())
            })
            .with_deposit_check(|task, expected: &usize, value: &Vec<f64>| {
                if value.len() == *expected {
                    Ok(())
                } else {
                    Err(KernelError::DepositLength {
                        label: label(BoxKind::Force),
                        task,
                        expected: *expected,
                        got: value.len(),
                    })
                }
            });
        let a = owner.register(ComputeId(1)).unwrap();

        owner.open(Arc::new(2)).unwrap();
        assert!(owner.deposit(&a, vec![1.0]).is_err());
        assert_eq!(owner.remaining(), 1);
        owner.deposit(&a, vec![1.0, 2.0]).unwrap();
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn test_consumer_view_shares_the_owner_cycle() {
        let (owner, seen) = force_box();
        let a = owner.register(ComputeId(1)).unwrap();
        let owner = Arc::new(owner);
        let view = ConsumerBox::new(owner.clone());

        owner.open(Arc::new(())).unwrap();
        assert_eq!(view.phase(), BoxPhase::Open);
        view.retrieve(&a).unwrap();
        view.deposit(&a, 4.0).unwrap();
        assert_eq!(seen.lock()[0].deposits, vec![(ComputeId(1), 4.0)]);
        assert_eq!(view.cycle(), 1);
    }

    #[test]
    fn test_deposit_before_open_fails() {
        let (owner, _) = force_box();
        let a = owner.register(ComputeId(1)).unwrap();
        assert!(matches!(
            owner.deposit(&a, 1.0),
            Err(KernelError::NotOpen { .. })
        ));
    }
}
