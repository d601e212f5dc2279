//! Termination barrier over the dependents a coordinator spawned.

use std::collections::HashSet;

use dqr_common::ActorId;

#[derive(Debug, Default)]
/// Set of dependents that must acknowledge termination before finalize.
///
/// A dependent whose spawn was requested but not yet confirmed counts as
/// pending, so the barrier cannot open between the spawn request and the
/// spawned actor's identity becoming known.
pub struct ShutdownBarrier {
    dependents: HashSet<ActorId>,
    pending_spawns: usize,
    acknowledged: u64,
}

impl ShutdownBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `id`. Returns `false` when it was already tracked.
    pub fn add(&mut self, id: ActorId) -> bool {
        self.dependents.insert(id)
    }

    /// Record termination of `id`. Unknown or repeated acks are ignored.
    pub fn ack(&mut self, id: ActorId) -> bool {
        let removed = self.dependents.remove(&id);
        if removed {
            self.acknowledged += 1;
        }
        removed
    }

    pub fn expect_spawn(&mut self) {
        self.pending_spawns += 1;
    }

    /// A requested spawn produced `id`; track it as a dependent.
    pub fn spawned(&mut self, id: ActorId) -> bool {
        self.pending_spawns = self.pending_spawns.saturating_sub(1);
        self.add(id)
    }

    pub fn spawn_failed(&mut self) {
        self.pending_spawns = self.pending_spawns.saturating_sub(1);
    }

    pub fn contains(&self, id: ActorId) -> bool {
        self.dependents.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty() && self.pending_spawns == 0
    }

    /// Dependents still to acknowledge, pending spawns included.
    pub fn len(&self) -> usize {
        self.dependents.len() + self.pending_spawns
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }
}
