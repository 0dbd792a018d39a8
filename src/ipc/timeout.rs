//! The timed-wait primitive (C2): a deadline-ordered list shared by the
//! reply correlator.
//!
//! The source keeps this as a doubly-linked list so removal is O(1) given
//! the link; a sorted `Vec` gives the same ordering guarantee and the same
//! "insertion is the expensive operation, cancellation is cheap" trade-off
//! the design calls out as acceptable (§4.2: "n is small in practice and
//! cancellations dominate"), without unsafe intrusive-list plumbing.

use crate::clock::Timeval;

/// A deadline-ordered list of `(deadline, key)` pairs, ascending. `K` is
/// whatever the owner uses to look its own entry back up after a sweep —
/// the correlator uses the outstanding message's table key.
pub struct TimeoutList<K> {
    entries: Vec<(Timeval, K)>,
}

impl<K> Default for TimeoutList<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + PartialEq> TimeoutList<K> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Sorted insert, O(n).
    pub fn insert(&mut self, deadline: Timeval, key: K) {
        let pos = self.entries.partition_point(|(d, _)| *d <= deadline);
        self.entries.insert(pos, (deadline, key));
    }

    /// Remove the (at most one) entry for `key`. Returns whether one was
    /// found.
    pub fn remove(&mut self, key: K) -> bool {
        if let Some(pos) = self.entries.iter().position(|(_, k)| *k == key) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// The earliest deadline still pending, if any.
    pub fn next_deadline(&self) -> Option<Timeval> {
        self.entries.first().map(|(d, _)| *d)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unlink and return every entry whose deadline has passed (`<= now`),
    /// in ascending deadline order.
    pub fn pop_expired(&mut self, now: Timeval) -> Vec<K> {
        let split = self.entries.partition_point(|(d, _)| *d <= now);
        self.entries.drain(..split).map(|(_, k)| k).collect()
    }

    #[cfg(test)]
    pub(crate) fn entries_for_test(&self) -> &[(Timeval, K)] {
        &self.entries
    }
}
