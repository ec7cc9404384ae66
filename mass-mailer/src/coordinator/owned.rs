//! In-memory set of ranges a worker currently drains.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::registry::{HashRange, WorkerId};

/// Shared handle: the coordinator writes, the sender loop reads each iteration.
pub type SharedRangeSet = Arc<RwLock<OwnedRangeSet>>;

/// Own base range plus the base ranges of every record this worker substitutes.
#[derive(Debug, Clone)]
pub struct OwnedRangeSet {
    own: HashRange,
    own_active: bool,
    substitutes: BTreeMap<WorkerId, HashRange>,
}

impl OwnedRangeSet {
    /// A set whose own range is not drained until [`activate_own`](Self::activate_own).
    pub fn new(own: HashRange) -> Self {
        Self {
            own,
            own_active: false,
            substitutes: BTreeMap::new(),
        }
    }

    pub fn shared(own: HashRange) -> SharedRangeSet {
        Arc::new(RwLock::new(Self::new(own)))
    }

    pub fn own_range(&self) -> HashRange {
        self.own
    }

    pub fn is_own_active(&self) -> bool {
        self.own_active
    }

    pub fn activate_own(&mut self) {
        self.own_active = true;
    }

    /// Drop every range, own included.
    pub fn deactivate(&mut self) {
        self.own_active = false;
        self.substitutes.clear();
    }

    /// Returns `true` if the worker was not already substituted.
    pub fn add_substitute(&mut self, worker: WorkerId, range: HashRange) -> bool {
        self.substitutes.insert(worker, range).is_none()
    }

    pub fn remove_substitute(&mut self, worker: WorkerId) -> Option<HashRange> {
        self.substitutes.remove(&worker)
    }

    pub fn clear_substitutes(&mut self) {
        self.substitutes.clear();
    }

    pub fn is_substituting(&self, worker: WorkerId) -> bool {
        self.substitutes.contains_key(&worker)
    }

    pub fn substitute_ids(&self) -> Vec<WorkerId> {
        self.substitutes.keys().copied().collect()
    }

    pub fn substitute_count(&self) -> usize {
        self.substitutes.len()
    }

    /// Ranges to drain, own range first.
    pub fn ranges(&self) -> Vec<HashRange> {
        let own = self.own_active.then_some(self.own);
        own.into_iter()
            .chain(self.substitutes.values().copied())
            .collect()
    }

    pub fn covers(&self, piece: i64) -> bool {
        self.ranges().iter().any(|r| r.contains(piece))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_set_drains_nothing() {
        let set = OwnedRangeSet::new(HashRange::new(0, 300));
        assert!(set.ranges().is_empty());
        assert!(!set.covers(10));
    }

    #[test]
    fn test_substitutes_follow_own_range() {
        let mut set = OwnedRangeSet::new(HashRange::new(0, 300));
        set.activate_own();
        assert!(set.add_substitute(2, HashRange::new(600, 900)));
        assert!(set.add_substitute(1, HashRange::new(300, 600)));
        assert!(!set.add_substitute(1, HashRange::new(300, 600)));

        assert_eq!(
            set.ranges(),
            vec![
                HashRange::new(0, 300),
                HashRange::new(300, 600),
                HashRange::new(600, 900)
            ]
        );
        assert_eq!(set.substitute_ids(), vec![1, 2]);

        assert_eq!(set.remove_substitute(1), Some(HashRange::new(300, 600)));
        assert!(!set.covers(450));
        assert!(set.covers(700));
    }

    #[test]
    fn test_deactivate_drops_everything() {
        let mut set = OwnedRangeSet::new(HashRange::new(0, 300));
        set.activate_own();
        set.add_substitute(1, HashRange::new(300, 600));
        set.deactivate();
        assert!(!set.is_own_active());
        assert_eq!(set.substitute_count(), 0);
        assert!(set.ranges().is_empty());
    }
}
