//! Client-side log of mutations awaiting server confirmation.

use rowsync_core::{Mutation, MutationKind};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Pending mutations in submission order.
///
/// # Invariants
///
/// - Ids are assigned from 1, strictly increasing, never reused
/// - Entries stay in submission order
/// - An entry leaves the log only when the server confirmed or rejected it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingLog {
    entries: VecDeque<Mutation>,
    next_id: u64,
    last_acked_id: u64,
}

impl Default for PendingLog {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingLog {
    /// Creates a new empty log.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            last_acked_id: 0,
        }
    }

    /// Appends a mutation, returning its id.
    pub fn append(&mut self, kind: MutationKind) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(Mutation::new(id, kind));
        id
    }

    /// Pending mutations, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &Mutation> {
        self.entries.iter()
    }

    /// The oldest `limit` pending mutations.
    pub fn pending_batch(&self, limit: usize) -> Vec<Mutation> {
        self.entries.iter().take(limit).cloned().collect()
    }

    /// Number of pending mutations.
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `id` is still pending.
    pub fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|m| m.id == id)
    }

    /// Removes every mutation with an id at or below `id`, returning them.
    pub fn acknowledge_up_to(&mut self, id: u64) -> Vec<Mutation> {
        let mut acked = Vec::new();
        while let Some(front) = self.entries.front() {
            if front.id > id {
                break;
            }
            if let Some(m) = self.entries.pop_front() {
                acked.push(m);
            }
        }
        self.last_acked_id = self.last_acked_id.max(id);
        acked
    }

    /// Highest acknowledged id.
    pub fn last_acked_id(&self) -> u64 {
        self.last_acked_id
    }

    /// Id the next appended mutation will get.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Drops everything, keeping the id sequence.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Moves the sequence past `id` so later appends cannot collide with
    /// ids the server has already processed. Returns whether it moved.
    pub fn skip_past(&mut self, id: u64) -> bool {
        if id < self.next_id {
            return false;
        }
        self.next_id = id + 1;
        true
    }
}
