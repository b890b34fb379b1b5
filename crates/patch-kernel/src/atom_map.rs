//! AtomMap: global particle id → (patch, local index) directory.
//!
//! One table per execution context, handed by reference to every patch that
//! registers particles and to every component that looks them up. Each entry is
//! a single atomic word so patches registering disjoint particles never contend.
//!
//! The table does not defend against two patches claiming the same particle:
//! the spatial decomposition guarantees exclusivity. What it does defend against
//! is a stale `unregister` arriving after the particle already moved and was
//! registered elsewhere; that call leaves the newer entry alone.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{KernelError, Result};
use crate::ids::{ParticleId, PatchId};

const UNASSIGNED: u64 = u64::MAX;

/// Where a particle currently lives: its patch and its slot in that patch's lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId {
    pub patch: PatchId,
    pub index: u32,
}

impl LocalId {
    fn pack(self) -> u64 {
        (u64::from(self.patch.0) << 32) | u64::from(self.index)
    }

    fn unpack(raw: u64) -> Option<Self> {
        if raw == UNASSIGNED {
            return None;
        }
        Some(Self {
            patch: PatchId((raw >> 32) as u32),
            index: raw as u32,
        })
    }
}

/// Snapshot produced by [`AtomMap::check_map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MapCheck {
    pub capacity: usize,
    pub assigned: usize,
    pub unassigned: usize,
    pub cleared: bool,
}

/// Directory from global particle id to its current [`LocalId`].
#[derive(Debug, Default)]
pub struct AtomMap {
    table: Vec<AtomicU64>,
    cleared: AtomicBool,
}

impl AtomMap {
    /// Create an empty map. Call [`allocate`](Self::allocate) before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a map already sized for `capacity` particle ids.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut map = Self::new();
        map.allocate(capacity);
        map
    }

    /// (Re)size the table; every entry starts unassigned.
    ///
    /// Takes `&mut self`: nothing may look up or register while the table is
    /// being replaced.
    pub fn allocate(&mut self, capacity: usize) {
        self.table = (0..capacity).map(|_| AtomicU64::new(UNASSIGNED)).collect();
        self.cleared.store(false, Ordering::Release);
        debug!(capacity, "AtomMap allocated");
    }

    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    /// Assign `ids[i]` to `(patch, i)` for every i, overwriting prior entries.
    ///
    /// Returns the number of entries written. Ids are range-checked up front so a
    /// rejected call writes nothing.
    pub fn register(&self, patch: PatchId, ids: &[ParticleId]) -> Result<usize> {
        self.check_range(ids)?;
        debug_assert!(patch.0 != u32::MAX, "patch id u32::MAX is reserved");

        for (index, &id) in ids.iter().enumerate() {
            let slot = LocalId {
                patch,
                index: index as u32,
            };
            self.table[id as usize].store(slot.pack(), Ordering::Release);
        }
        self.cleared.store(false, Ordering::Release);

        trace!(patch = %patch, count = ids.len(), "Registered particle ids");
        Ok(ids.len())
    }

    /// Reset each particle to unassigned, but only where it still maps to `patch`.
    ///
    /// Returns how many entries were actually reset.
    pub fn unregister(&self, patch: PatchId, ids: &[ParticleId]) -> Result<usize> {
        self.check_range(ids)?;

        let mut reset = 0;
        for &id in ids {
            let entry = &self.table[id as usize];
            let mut current = entry.load(Ordering::Acquire);
            loop {
                match LocalId::unpack(current) {
                    Some(slot) if slot.patch == patch => {}
                    _ => break,
                }
                match entry.compare_exchange_weak(
                    current,
                    UNASSIGNED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        reset += 1;
                        break;
                    }
                    Err(actual) => current = actual,
                }
            }
        }

        trace!(
            patch = %patch,
            requested = ids.len(),
            reset,
            "Unregistered particle ids"
        );
        Ok(reset)
    }

    /// Current location of a particle.
    ///
    /// `UnassignedParticle` means "not resident anywhere right now", which is
    /// normal for a particle in flight between patches.
    pub fn lookup(&self, id: ParticleId) -> Result<LocalId> {
        let entry = self
            .table
            .get(id as usize)
            .ok_or(KernelError::ParticleOutOfRange {
                id,
                capacity: self.table.len(),
            })?;
        if self.cleared.load(Ordering::Acquire) {
            return Err(KernelError::DirectoryCleared(id));
        }
        LocalId::unpack(entry.load(Ordering::Acquire)).ok_or(KernelError::UnassignedParticle(id))
    }

    /// Reset every entry and enter the cleared state.
    ///
    /// Only for whole-system rebuilds, after every patch has unregistered.
    /// Lookups fail with `DirectoryCleared` until the next `register`.
    pub fn clear(&self) {
        self.cleared.store(true, Ordering::Release);
        for entry in &self.table {
            entry.store(UNASSIGNED, Ordering::Release);
        }
        debug!(capacity = self.table.len(), "AtomMap cleared");
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::Acquire)
    }

    /// Count assigned and unassigned entries.
    pub fn check_map(&self) -> MapCheck {
        let assigned = self
            .table
            .iter()
            .filter(|entry| entry.load(Ordering::Acquire) != UNASSIGNED)
            .count();
        let check = MapCheck {
            capacity: self.table.len(),
            assigned,
            unassigned: self.table.len() - assigned,
            cleared: self.is_cleared(),
        };
        debug!(
            capacity = check.capacity,
            assigned = check.assigned,
            unassigned = check.unassigned,
            cleared = check.cleared,
            "AtomMap check"
        );
        check
    }

    fn check_range(&self, ids: &[ParticleId]) -> Result<()> {
        let capacity = self.table.len();
        match ids.iter().find(|&&id| id as usize >= capacity) {
            Some(&id) => Err(KernelError::ParticleOutOfRange { id, capacity }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_then_lookup() {
        let map = AtomMap::with_capacity(16);
        let written = map.register(PatchId(3), &[9, 4, 11]).unwrap();
        assert_eq!(written, 3);

        assert_eq!(
            map.lookup(4).unwrap(),
            LocalId {
                patch: PatchId(3),
                index: 1
            }
        );
        assert_eq!(map.lookup(11).unwrap().index, 2);
    }

    #[test]
    fn test_unregister_returns_unassigned() {
        let map = AtomMap::with_capacity(8);
        map.register(PatchId(1), &[5]).unwrap();
        map.unregister(PatchId(1), &[5]).unwrap();

        assert_eq!(map.lookup(5), Err(KernelError::UnassignedParticle(5)));
    }

    #[test]
    fn test_unregister_after_release_elsewhere() {
        let map = AtomMap::with_capacity(8);
        map.register(PatchId(1), &[2]).unwrap();
        map.unregister(PatchId(1), &[2]).unwrap();
        map.register(PatchId(4), &[2]).unwrap();
        map.unregister(PatchId(4), &[2]).unwrap();

        assert_eq!(map.lookup(2), Err(KernelError::UnassignedParticle(2)));
    }

    #[test]
    fn test_stale_unregister_keeps_new_owner() {
        let map = AtomMap::with_capacity(8);
        map.register(PatchId(1), &[6]).unwrap();
        // particle migrated: the new owner registers before the old one releases
        map.register(PatchId(2), &[0, 6]).unwrap();

        let reset = map.unregister(PatchId(1), &[6]).unwrap();
        assert_eq!(reset, 0);
        assert_eq!(
            map.lookup(6).unwrap(),
            LocalId {
                patch: PatchId(2),
                index: 1
            }
        );
    }

    #[test]
    fn test_out_of_range_writes_nothing() {
        let map = AtomMap::with_capacity(4);
        let err = map.register(PatchId(0), &[1, 9]).unwrap_err();
        assert_eq!(err, KernelError::ParticleOutOfRange { id: 9, capacity: 4 });
        assert_eq!(map.lookup(1), Err(KernelError::UnassignedParticle(1)));
    }

    #[test]
    fn test_clear_blocks_lookup_until_register() {
        let map = AtomMap::with_capacity(4);
        map.register(PatchId(0), &[0, 1]).unwrap();
        map.clear();

        assert_eq!(map.lookup(0), Err(KernelError::DirectoryCleared(0)));
        assert_eq!(map.check_map().assigned, 0);

        map.register(PatchId(2), &[1]).unwrap();
        assert!(!map.is_cleared());
        assert_eq!(map.lookup(1).unwrap().patch, PatchId(2));
        assert_eq!(map.lookup(0), Err(KernelError::UnassignedParticle(0)));
    }

    #[test]
    fn test_check_map_counts() {
        let map = AtomMap::with_capacity(10);
        map.register(PatchId(0), &[0, 1, 2]).unwrap();
        map.register(PatchId(1), &[7]).unwrap();

        let check = map.check_map();
        assert_eq!(check.capacity, 10);
        assert_eq!(check.assigned, 4);
        assert_eq!(check.unassigned, 6);
        assert!(!check.cleared);
    }

    #[test]
    fn test_concurrent_disjoint_registration() {
        let map = AtomMap::with_capacity(4000);
        std::thread::scope(|scope| {
            for p in 0..4u32 {
                let map = &map;
                scope.spawn(move || {
                    let ids: Vec<ParticleId> = (p * 1000..(p + 1) * 1000).collect();
                    map.register(PatchId(p), &ids).unwrap();
                });
            }
        });

        assert_eq!(map.check_map().assigned, 4000);
        assert_eq!(
            map.lookup(2500).unwrap(),
            LocalId {
                patch: PatchId(2),
                index: 500
            }
        );
    }
}
