//! Sequenced collection: assemble whole-system frames from per-patch contributions.
//!
//! Every home patch submits its slice of a frame (positions, velocities) tagged
//! with the step's sequence number. A [`SequencedAggregator`] keeps one pending
//! entry per live sequence number and hands the assembled frame back to the
//! caller whose submission brought the contributor count to zero. Exactly one
//! caller sees each frame.
//!
//! Pending entries live in a `DashMap` keyed by sequence number; a submission
//! holds that entry's shard lock for the whole append-decrement-remove, so
//! concurrent contributors to the same frame are serialized while different
//! frames proceed independently.
//!
//! Sequence numbers are expected to grow. The aggregator remembers the last
//! `history` delivered numbers exactly and, beyond that window, only the
//! highest number it has forgotten. A contribution that would open a new frame
//! at or below that horizon is refused, so the pending map cannot collect frames
//! that will never complete.

use std::collections::VecDeque;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::error::{KernelError, Result};
use crate::ids::{FloatVector, ParticleId, Vector};
use crate::patch::CompAtom;

/// Which representations an assembled frame carries.
///
/// Mixing tags within one sequence number is a caller error; the frame keeps the
/// tag of its first contribution and stores every later slice accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Single precision only.
    Low,
    /// Double precision only.
    High,
    Both,
}

impl Precision {
    fn wants_high(self) -> bool {
        matches!(self, Precision::High | Precision::Both)
    }

    fn wants_low(self) -> bool {
        matches!(self, Precision::Low | Precision::Both)
    }
}

/// Periodic cell snapshot carried with position frames.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Lattice {
    pub a: Vector,
    pub b: Vector,
    pub c: Vector,
    pub origin: Vector,
}

impl Lattice {
    /// Orthorhombic cell centred on the origin.
    pub fn cube(edge: f64) -> Self {
        Self {
            a: [edge, 0.0, 0.0],
            b: [0.0, edge, 0.0],
            c: [0.0, 0.0, edge],
            origin: [0.0; 3],
        }
    }
}

/// A complete frame: every contributor's ids and values, in submission order.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledFrame {
    pub seq: u64,
    pub precision: Precision,
    pub ids: Vec<ParticleId>,
    /// Double-precision values (`High`/`Both`).
    pub data: Vec<Vector>,
    /// Single-precision values (`Low`/`Both`).
    pub fdata: Vec<FloatVector>,
    pub lattice: Option<Lattice>,
}

impl AssembledFrame {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Default)]
struct DeliveryLog {
    recent: VecDeque<u64>,
    /// Highest sequence number that has dropped out of `recent`.
    horizon: Option<u64>,
}

#[derive(Debug)]
struct PendingFrame {
    frame: AssembledFrame,
    remaining: usize,
}

impl PendingFrame {
    fn new(seq: u64, precision: Precision, expected: usize, lattice: Option<Lattice>) -> Self {
        Self {
            frame: AssembledFrame {
                seq,
                precision,
                ids: Vec::new(),
                data: Vec::new(),
                fdata: Vec::new(),
                lattice,
            },
            remaining: expected,
        }
    }

    /// Append one contribution; true when it was the last one expected.
    fn append(&mut self, ids: &[ParticleId], values: &[Vector]) -> bool {
        let precision = self.frame.precision;
        self.frame.ids.extend_from_slice(ids);
        if precision.wants_high() {
            self.frame.data.extend_from_slice(values);
        }
        if precision.wants_low() {
            self.frame
                .fdata
                .extend(values.iter().map(|v| [v[0] as f32, v[1] as f32, v[2] as f32]));
        }
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }
}

/// Collects one contribution per expected contributor for each sequence number.
#[derive(Debug)]
pub struct SequencedAggregator {
    name: &'static str,
    expected: usize,
    pending: DashMap<u64, PendingFrame>,
    delivered: Mutex<DeliveryLog>,
    history: usize,
}

impl SequencedAggregator {
    /// `expected` contributors per frame; the last `history` delivered sequence
    /// numbers are remembered exactly, older ones only through the horizon.
    pub fn new(name: &'static str, expected: usize, history: usize) -> Self {
        Self {
            name,
            expected,
            pending: DashMap::new(),
            delivered: Mutex::new(DeliveryLog {
                recent: VecDeque::with_capacity(history + 1),
                horizon: None,
            }),
            history,
        }
    }

    /// Highest delivered sequence number no longer held in the exact window.
    pub fn horizon(&self) -> Option<u64> {
        self.delivered.lock().horizon
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Number of sequence numbers with contributions still outstanding.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Add one contributor's slice to frame `seq`.
    ///
    /// Returns the assembled frame iff this call was the last contribution.
    pub fn submit(
        &self,
        seq: u64,
        ids: &[ParticleId],
        values: &[Vector],
        precision: Precision,
    ) -> Result<Option<AssembledFrame>> {
        self.submit_with_lattice(seq, ids, values, precision, None)
    }

    pub fn submit_with_lattice(
        &self,
        seq: u64,
        ids: &[ParticleId],
        values: &[Vector],
        precision: Precision,
        lattice: Option<Lattice>,
    ) -> Result<Option<AssembledFrame>> {
        if ids.len() != values.len() {
            return Err(KernelError::ContributionMismatch {
                seq,
                ids: ids.len(),
                values: values.len(),
            });
        }

        match self.pending.entry(seq) {
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut();
                if pending.frame.precision != precision {
                    debug!(
                        collection = self.name,
                        seq,
                        first = ?pending.frame.precision,
                        got = ?precision,
                        "Mixed precision tags within one frame"
                    );
                }
                let done = pending.append(ids, values);
                trace!(
                    collection = self.name,
                    seq,
                    count = ids.len(),
                    remaining = pending.remaining,
                    "Contribution appended"
                );
                if !done {
                    return Ok(None);
                }
                // mark before releasing the shard lock so a late contributor
                // cannot slip in and open a fresh entry
                self.mark_delivered(seq);
                let pending = entry.remove();
                self.log_delivery(&pending.frame);
                Ok(Some(pending.frame))
            }
            Entry::Vacant(entry) => {
                self.check_late(seq)?;
                let mut pending = PendingFrame::new(seq, precision, self.expected, lattice);
                if pending.append(ids, values) {
                    self.mark_delivered(seq);
                    // release the shard before len() walks every shard
                    drop(entry);
                    self.log_delivery(&pending.frame);
                    return Ok(Some(pending.frame));
                }
                trace!(
                    collection = self.name,
                    seq,
                    count = ids.len(),
                    remaining = pending.remaining,
                    "Frame started"
                );
                entry.insert(pending);
                Ok(None)
            }
        }
    }

    /// Refuse a contribution that would open a frame already delivered or
    /// past the horizon.
    fn check_late(&self, seq: u64) -> Result<()> {
        let delivered = self.delivered.lock();
        if delivered.recent.contains(&seq) {
            error!(
                collection = self.name,
                seq,
                "Contribution for a frame that was already delivered"
            );
            return Err(KernelError::SequenceAlreadyDelivered {
                collection: self.name,
                seq,
            });
        }
        match delivered.horizon {
            Some(horizon) if seq <= horizon => {
                error!(
                    collection = self.name,
                    seq,
                    horizon,
                    "Contribution behind the delivery horizon"
                );
                Err(KernelError::SequenceExpired {
                    collection: self.name,
                    seq,
                    horizon,
                })
            }
            _ => Ok(()),
        }
    }

    fn mark_delivered(&self, seq: u64) {
        let mut delivered = self.delivered.lock();
        delivered.recent.push_back(seq);
        while delivered.recent.len() > self.history {
            if let Some(old) = delivered.recent.pop_front() {
                let horizon = delivered.horizon.map_or(old, |h| h.max(old));
                delivered.horizon = Some(horizon);
            }
        }
    }

    fn log_delivery(&self, frame: &AssembledFrame) {
        debug!(
            collection = self.name,
            seq = frame.seq,
            atoms = frame.len(),
            pending = self.pending.len(),
            "Frame assembled"
        );
    }
}

/// Position and velocity collection for one execution context.
#[derive(Debug)]
pub struct CollectionManager {
    positions: SequencedAggregator,
    velocities: SequencedAggregator,
}

impl CollectionManager {
    /// `home_patches` is the number of patches expected to contribute per frame.
    pub fn new(home_patches: usize, history: usize) -> Self {
        Self {
            positions: SequencedAggregator::new("positions", home_patches, history),
            velocities: SequencedAggregator::new("velocities", home_patches, history),
        }
    }

    /// Submit one patch's positions for frame `seq`.
    pub fn submit_positions(
        &self,
        seq: u64,
        atoms: &[CompAtom],
        lattice: Lattice,
        precision: Precision,
    ) -> Result<Option<AssembledFrame>> {
        let ids: Vec<ParticleId> = atoms.iter().map(|a| a.id).collect();
        let positions: Vec<Vector> = atoms.iter().map(|a| a.position).collect();
        self.positions
            .submit_with_lattice(seq, &ids, &positions, precision, Some(lattice))
    }

    /// Submit one patch's velocities for frame `seq`. Always double precision.
    pub fn submit_velocities(
        &self,
        seq: u64,
        ids: &[ParticleId],
        velocities: &[Vector],
    ) -> Result<Option<AssembledFrame>> {
        self.velocities.submit(seq, ids, velocities, Precision::High)
    }

    pub fn positions(&self) -> &SequencedAggregator {
        &self.positions
    }

    pub fn velocities(&self) -> &SequencedAggregator {
        &self.velocities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(patch: u32, n: u32) -> (Vec<ParticleId>, Vec<Vector>) {
        let ids: Vec<ParticleId> = (patch * n..(patch + 1) * n).collect();
        let values = ids.iter().map(|&id| [id as f64, 0.5, -1.0]).collect();
        (ids, values)
    }

    #[test]
    fn test_four_patches_assemble_forty_positions() {
        let collector = SequencedAggregator::new("positions", 4, 16);
        let order = [2, 0, 3, 1];

        for (i, patch) in order.iter().enumerate() {
            let (ids, values) = slice(*patch, 10);
            let out = collector.submit(7, &ids, &values, Precision::High).unwrap();
            if i < 3 {
                assert!(out.is_none());
            } else {
                let frame = out.unwrap();
                assert_eq!(frame.len(), 40);
                assert_eq!(frame.data.len(), 40);
                // submission order, not id order
                assert_eq!(frame.ids[0], 20);
                assert_eq!(frame.ids[10], 0);
                assert_eq!(frame.ids[39], 19);
            }
        }

        assert_eq!(collector.pending_count(), 0);
        let (ids, values) = slice(0, 10);
        assert_eq!(
            collector.submit(7, &ids, &values, Precision::High),
            Err(KernelError::SequenceAlreadyDelivered {
                collection: "positions",
                seq: 7
            })
        );
    }

    #[test]
    fn test_interleaved_sequences() {
        let collector = SequencedAggregator::new("positions", 2, 16);
        let (ids, values) = slice(0, 3);

        assert!(collector.submit(5, &ids, &values, Precision::High).unwrap().is_none());
        assert!(collector.submit(6, &ids, &values, Precision::High).unwrap().is_none());
        assert_eq!(collector.pending_count(), 2);

        let six = collector.submit(6, &ids, &values, Precision::High).unwrap();
        assert_eq!(six.unwrap().seq, 6);
        let five = collector.submit(5, &ids, &values, Precision::High).unwrap();
        assert_eq!(five.unwrap().seq, 5);
        assert_eq!(collector.pending_count(), 0);
    }

    #[test]
    fn test_empty_contribution_still_counts() {
        let collector = SequencedAggregator::new("positions", 2, 4);
        assert!(collector.submit(1, &[], &[], Precision::High).unwrap().is_none());
        let frame = collector
            .submit(1, &[3], &[[1.0, 2.0, 3.0]], Precision::High)
            .unwrap()
            .unwrap();
        assert_eq!(frame.ids, vec![3]);
    }

    #[test]
    fn test_precision_low_fills_single_only() {
        let collector = SequencedAggregator::new("positions", 1, 4);
        let frame = collector
            .submit(0, &[1], &[[1.5, 2.5, 3.5]], Precision::Low)
            .unwrap()
            .unwrap();
        assert!(frame.data.is_empty());
        assert_eq!(frame.fdata, vec![[1.5f32, 2.5, 3.5]]);
    }

    #[test]
    fn test_precision_both_fills_both() {
        let collector = SequencedAggregator::new("positions", 1, 4);
        let frame = collector
            .submit(0, &[1, 2], &[[1.0; 3], [2.0; 3]], Precision::Both)
            .unwrap()
            .unwrap();
        assert_eq!(frame.data.len(), 2);
        assert_eq!(frame.fdata.len(), 2);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let collector = SequencedAggregator::new("positions", 2, 4);
        assert!(matches!(
            collector.submit(0, &[1, 2], &[[0.0; 3]], Precision::High),
            Err(KernelError::ContributionMismatch { ids: 2, values: 1, .. })
        ));
        assert_eq!(collector.pending_count(), 0);
    }

    #[test]
    fn test_contribution_behind_horizon_rejected() {
        let collector = SequencedAggregator::new("positions", 2, 2);
        for seq in 0..3 {
            collector.submit(seq, &[0], &[[0.0; 3]], Precision::High).unwrap();
            collector.submit(seq, &[1], &[[0.0; 3]], Precision::High).unwrap();
        }
        // seq 0 fell out of the window; seq 2 is still remembered
        assert_eq!(collector.horizon(), Some(0));
        assert_eq!(
            collector.submit(0, &[0], &[[0.0; 3]], Precision::High),
            Err(KernelError::SequenceExpired {
                collection: "positions",
                seq: 0,
                horizon: 0
            })
        );
        assert!(matches!(
            collector.submit(2, &[0], &[[0.0; 3]], Precision::High),
            Err(KernelError::SequenceAlreadyDelivered { seq: 2, .. })
        ));
        assert_eq!(collector.pending_count(), 0);

        // frames ahead of the horizon still assemble
        assert!(collector.submit(3, &[0], &[[0.0; 3]], Precision::High).unwrap().is_none());
        assert_eq!(collector.pending_count(), 1);
    }

    #[test]
    fn test_zero_history_keeps_only_horizon() {
        let collector = SequencedAggregator::new("velocities", 1, 0);
        collector.submit(4, &[0], &[[0.0; 3]], Precision::High).unwrap();
        assert_eq!(collector.horizon(), Some(4));
        assert!(matches!(
            collector.submit(4, &[0], &[[0.0; 3]], Precision::High),
            Err(KernelError::SequenceExpired { seq: 4, .. })
        ));
    }

    #[test]
    fn test_concurrent_contributors_deliver_once() {
        let collector = SequencedAggregator::new("positions", 8, 64);
        let delivered = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for patch in 0..8u32 {
                let collector = &collector;
                let delivered = &delivered;
                scope.spawn(move || {
                    for seq in 0..20u64 {
                        let (ids, values) = slice(patch, 5);
                        if let Some(frame) =
                            collector.submit(seq, &ids, &values, Precision::High).unwrap()
                        {
                            delivered.lock().push(frame);
                        }
                    }
                });
            }
        });

        let delivered = delivered.into_inner();
        assert_eq!(delivered.len(), 20);
        assert!(delivered.iter().all(|frame| frame.len() == 40));
        assert_eq!(collector.pending_count(), 0);
    }

    #[test]
    fn test_collection_manager_keeps_lattice() {
        let manager = CollectionManager::new(1, 8);
        let atoms = [CompAtom {
            id: 4,
            position: [1.0, 1.0, 1.0],
        }];
        let frame = manager
            .submit_positions(3, &atoms, Lattice::cube(10.0), Precision::High)
            .unwrap()
            .unwrap();
        assert_eq!(frame.lattice, Some(Lattice::cube(10.0)));

        let velocities = manager
            .submit_velocities(3, &[4], &[[0.1, 0.0, 0.0]])
            .unwrap()
            .unwrap();
        assert_eq!(velocities.precision, Precision::High);
        assert!(velocities.lattice.is_none());
    }
}
