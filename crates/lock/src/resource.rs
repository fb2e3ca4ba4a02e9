// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::types::{DlmMode, HandleId, LockName};

/// One byte-range lock held by a local owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RangeLock {
    pub owner: u64,
    pub start: u64,
    /// Exclusive end
    pub end: u64,
    pub exclusive: bool,
    /// Overlapping requests from the same owner folded into this record
    pub count: u32,
}

impl RangeLock {
    pub(crate) fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    pub(crate) fn conflicts(&self, owner: u64, start: u64, end: u64, exclusive: bool) -> bool {
        self.owner != owner && self.overlaps(start, end) && (exclusive || self.exclusive)
    }

    /// What is left of this record outside `[start, end)`.
    fn outside(&self, start: u64, end: u64) -> SmallVec<[RangeLock; 2]> {
        let mut rest = SmallVec::new();
        if self.start < start {
            rest.push(RangeLock { end: start, ..*self });
        }
        if end < self.end {
            rest.push(RangeLock { start: end, ..*self });
        }
        rest
    }
}

/// A blocked range request waiting for a local conflict to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingRange {
    pub owner: u64,
    pub start: u64,
    pub end: u64,
    pub exclusive: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ResourceState {
    /// Sorted by start offset
    pub locks: Vec<RangeLock>,
    /// Handle backing the range locks with a DLM lock
    pub handle: Option<HandleId>,
    /// Handle of the paired update lock
    pub update: Option<HandleId>,
    /// A DLM conversion for this resource is in progress
    pub converting: bool,
    /// Last update generation seen in the update lock's value block
    pub generation: u64,
    /// Removed from the lock space; lookups must start over
    pub retired: bool,
}

impl ResourceState {
    pub(crate) fn conflict(&self, owner: u64, start: u64, end: u64, exclusive: bool) -> Option<&RangeLock> {
        self.locks.iter().find(|lock| lock.conflicts(owner, start, end, exclusive))
    }

    /// DLM mode that covers every record plus a new request of the given kind.
    pub(crate) fn needed_mode(&self, exclusive: bool) -> DlmMode {
        if exclusive || self.locks.iter().any(|lock| lock.exclusive) {
            DlmMode::Ex
        } else {
            DlmMode::Pr
        }
    }

    /// Record a granted range, folding it into the owner's overlapping records of the
    /// same kind. The owner's records of the other kind lose the covered bytes, so an
    /// owner never holds one byte both shared and exclusive.
    pub(crate) fn insert(&mut self, owner: u64, start: u64, end: u64, exclusive: bool) {
        let mut merged = RangeLock {
            owner,
            start,
            end,
            exclusive,
            count: 1,
        };
        let mut kept: Vec<RangeLock> = Vec::with_capacity(self.locks.len() + 2);
        for lock in self.locks.drain(..) {
            if lock.owner != owner || !lock.overlaps(start, end) {
                kept.push(lock);
            } else if lock.exclusive != exclusive {
                kept.extend(lock.outside(start, end));
            } else {
                merged.start = merged.start.min(lock.start);
                merged.end = merged.end.max(lock.end);
                merged.count += lock.count;
            }
        }
        kept.sort_by_key(|lock| (lock.start, lock.owner));
        self.locks = kept;
        let at = self
            .locks
            .partition_point(|lock| (lock.start, lock.owner) <= (merged.start, merged.owner));
        self.locks.insert(at, merged);
    }

    /// Release `[start, end)` for `owner`. An exact match drops one reference; any other
    /// overlap removes the covered part and keeps the remainders.
    ///
    /// Returns false when the owner held nothing in the range.
    pub(crate) fn remove(&mut self, owner: u64, start: u64, end: u64) -> bool {
        let mut changed = false;
        let mut kept: Vec<RangeLock> = Vec::with_capacity(self.locks.len());
        for lock in self.locks.drain(..) {
            if lock.owner != owner || !lock.overlaps(start, end) {
                kept.push(lock);
                continue;
            }
            changed = true;
            if lock.start == start && lock.end == end {
                if lock.count > 1 {
                    kept.push(RangeLock {
                        count: lock.count - 1,
                        ..lock
                    });
                }
                continue;
            }
            kept.extend(lock.outside(start, end));
        }
        kept.sort_by_key(|lock| (lock.start, lock.owner));
        self.locks = kept;
        changed
    }

    pub(crate) fn is_unused(&self) -> bool {
        self.locks.is_empty() && !self.converting
    }
}

/// Range-lock state of one lock name.
#[derive(Debug)]
pub(crate) struct Resource {
    pub name: LockName,
    pub gate: Arc<tokio::sync::Mutex<ResourceState>>,
    /// Blocked requests, for diagnostics and retirement decisions
    pub pending: Mutex<Vec<PendingRange>>,
    /// Woken whenever records change or a conversion ends
    pub waiters: Notify,
}

impl Resource {
    pub(crate) fn new(name: LockName) -> Self {
        Self {
            name,
            gate: Arc::new(tokio::sync::Mutex::new(ResourceState::default())),
            pending: Mutex::new(Vec::new()),
            waiters: Notify::new(),
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    pub(crate) fn add_pending(&self, range: PendingRange) {
        self.pending.lock().push(range);
    }

    pub(crate) fn remove_pending(&self, range: PendingRange) {
        let mut pending = self.pending.lock();
        if let Some(at) = pending.iter().position(|p| *p == range) {
            pending.remove(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(state: &ResourceState) -> Vec<(u64, u64, u64, u32)> {
        state.locks.iter().map(|l| (l.owner, l.start, l.end, l.count)).collect()
    }

    #[test]
    fn test_conflicts() {
        let mut state = ResourceState::default();
        state.insert(1, 0, 100, false);
        assert!(state.conflict(2, 50, 60, false).is_none());
        assert!(state.conflict(2, 50, 60, true).is_some());
        assert!(state.conflict(1, 50, 60, true).is_none());
        assert!(state.conflict(2, 100, 200, true).is_none());
        assert_eq!(state.needed_mode(false), DlmMode::Pr);
        assert_eq!(state.needed_mode(true), DlmMode::Ex);
    }

    #[test]
    fn test_insert_merges_same_owner() {
        let mut state = ResourceState::default();
        state.insert(1, 0, 100, true);
        state.insert(1, 50, 150, true);
        state.insert(2, 200, 300, true);
        state.insert(1, 400, 500, false);
        assert_eq!(ranges(&state), vec![(1, 0, 150, 2), (2, 200, 300, 1), (1, 400, 500, 1)]);
    }

    #[test]
    fn test_insert_replaces_other_kind() {
        let mut state = ResourceState::default();
        state.insert(1, 0, 100, false);
        state.insert(2, 200, 300, false);
        state.insert(1, 40, 60, true);
        let kinds: Vec<_> = state.locks.iter().map(|l| (l.owner, l.start, l.end, l.exclusive)).collect();
        assert_eq!(
            kinds,
            vec![(1, 0, 40, false), (1, 40, 60, true), (1, 60, 100, false), (2, 200, 300, false)]
        );

        // downgrading the whole range leaves a single shared record
        state.insert(1, 0, 100, false);
        let kinds: Vec<_> = state.locks.iter().map(|l| (l.owner, l.start, l.end, l.exclusive)).collect();
        assert_eq!(kinds, vec![(1, 0, 100, false), (2, 200, 300, false)]);
        assert_eq!(state.needed_mode(false), DlmMode::Pr);
    }

    #[test]
    fn test_remove_counts_and_splits() {
        let mut state = ResourceState::default();
        state.insert(1, 0, 100, true);
        state.insert(1, 0, 100, true);
        assert!(state.remove(1, 0, 100));
        assert_eq!(ranges(&state), vec![(1, 0, 100, 1)]);

        assert!(state.remove(1, 40, 60));
        assert_eq!(ranges(&state), vec![(1, 0, 40, 1), (1, 60, 100, 1)]);

        assert!(!state.remove(2, 0, 100));
        assert!(state.remove(1, 0, 100));
        assert!(state.locks.is_empty());
        assert!(state.is_unused());
    }

    #[test]
    fn test_pending_bookkeeping() {
        let res = Resource::new(LockName::new(6, 1));
        let range = PendingRange {
            owner: 1,
            start: 0,
            end: 10,
            exclusive: true,
        };
        res.add_pending(range);
        assert!(res.has_pending());
        res.remove_pending(range);
        assert!(!res.has_pending());
    }
}
