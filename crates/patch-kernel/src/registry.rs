//! ComputeList: the ordered set of computes registered against one box.

use indexmap::IndexSet;

use crate::ids::ComputeId;

/// Unique compute ids in registration order.
///
/// Order carries no meaning beyond giving deterministic iteration (and hence
/// deterministic reduction order for deposited forces).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputeList {
    ids: IndexSet<ComputeId>,
}

impl ComputeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a compute. Returns false if it was already present.
    pub fn insert(&mut self, id: ComputeId) -> bool {
        self.ids.insert(id)
    }

    /// Remove a compute, keeping the order of the rest. Returns false if absent.
    pub fn remove(&mut self, id: ComputeId) -> bool {
        self.ids.shift_remove(&id)
    }

    pub fn contains(&self, id: ComputeId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ComputeId> + '_ {
        self.ids.iter().copied()
    }
}
