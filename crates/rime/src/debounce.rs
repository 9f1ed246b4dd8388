//! Coalescing queue for item fetch results.
//!
//! Item fetches that settle inside one window are applied together as a
//! single repository transition. The first result queued in a window asks
//! its caller to schedule the flush; later results ride along.

use std::collections::HashSet;

use crate::types::Resource;

/// An `(model, canonical key)` pair.
pub(crate) type SlotKey = (String, String);

#[derive(Debug, Default)]
pub(crate) struct PendingInserts {
    resources: Vec<Resource>,
    settled: Vec<SlotKey>,
    flush_scheduled: bool,
}

impl PendingInserts {
    /// Queue a fetched resource under the in-flight key that produced it.
    ///
    /// Returns `true` when no flush is scheduled for the current window yet,
    /// in which case the caller owns scheduling it.
    pub(crate) fn push(&mut self, key: SlotKey, resource: Resource) -> bool {
        self.resources.push(resource);
        self.settled.push(key);
        !std::mem::replace(&mut self.flush_scheduled, true)
    }

    /// Drain the window, closing it.
    pub(crate) fn take(&mut self) -> (Vec<Resource>, Vec<SlotKey>) {
        self.flush_scheduled = false;
        (
            std::mem::take(&mut self.resources),
            std::mem::take(&mut self.settled),
        )
    }

    /// Drop queued results for slots an explicit write has superseded.
    ///
    /// Returns the in-flight keys of the dropped results.
    pub(crate) fn discard(&mut self, written: &HashSet<SlotKey>) -> Vec<SlotKey> {
        let mut dropped = Vec::new();
        let mut kept_resources = Vec::with_capacity(self.resources.len());
        let mut kept_settled = Vec::with_capacity(self.settled.len());
        for (resource, key) in self.resources.drain(..).zip(self.settled.drain(..)) {
            if written.contains(&key) {
                dropped.push(key);
            } else {
                kept_resources.push(resource);
                kept_settled.push(key);
            }
        }
        self.resources = kept_resources;
        self.settled = kept_settled;
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        self.resources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> SlotKey {
        ("blogPost".to_string(), id.to_string())
    }

    #[test]
    fn test_only_first_push_schedules() {
        let mut pending = PendingInserts::default();
        assert!(pending.push(key("1"), Resource::stub("blogPost", "1")));
        assert!(!pending.push(key("2"), Resource::stub("blogPost", "2")));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_take_opens_a_new_window() {
        let mut pending = PendingInserts::default();
        pending.push(key("1"), Resource::stub("blogPost", "1"));

        let (resources, settled) = pending.take();
        assert_eq!(resources.len(), 1);
        assert_eq!(settled, vec![key("1")]);
        assert_eq!(pending.len(), 0);

        assert!(pending.push(key("2"), Resource::stub("blogPost", "2")));
    }

    #[test]
    fn test_discard_drops_only_written_slots() {
        let mut pending = PendingInserts::default();
        pending.push(key("1"), Resource::stub("blogPost", "1"));
        pending.push(key("2"), Resource::stub("blogPost", "2"));

        let dropped = pending.discard(&HashSet::from([key("1"), key("3")]));
        assert_eq!(dropped, vec![key("1")]);
        assert_eq!(pending.len(), 1);

        let (resources, settled) = pending.take();
        assert_eq!(resources, vec![Resource::stub("blogPost", "2")]);
        assert_eq!(settled, vec![key("2")]);
    }
}
