//! Per-CPU context-tag cache.
//!
//! The hardware keeps TLB entries tagged with a small process-context ID
//! so switching address spaces does not dump the whole translation cache.
//! Only a handful of tags exist, so each CPU runs a tiny LRU cache mapping
//! address spaces to tags.  A tag is flushed exactly once, at the moment
//! it is stolen from one space and rebound to another.

use super::address_space::SpaceId;
use super::tlb::TlbOps;

/// Hardware context tags managed per CPU.
pub const N_PCIDS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct PcidSlot {
    pcid: u16,
    space: Option<SpaceId>,
    timestamp: u64,
}

/// LRU cache binding address spaces to the CPU's context tags.
pub struct PcidCache {
    slots: [PcidSlot; N_PCIDS],
    next_timestamp: u64,
}

impl PcidCache {
    pub fn new() -> Self {
        let mut slots = [PcidSlot { pcid: 0, space: None, timestamp: 0 }; N_PCIDS];
        for (index, slot) in slots.iter_mut().enumerate() {
            slot.pcid = index as u16;
        }
        Self { slots, next_timestamp: 1 }
    }

    /// Return the tag bound to `space`, binding one if needed.
    ///
    /// A cache hit only refreshes the slot's timestamp.  A miss takes a
    /// free slot if one exists; otherwise the least-recently-used slot is
    /// evicted, and its tag's stale translations are flushed before the
    /// rebind.  Ties on the timestamp go to the lowest slot index.
    pub fn acquire(&mut self, space: SpaceId, tlb: &mut dyn TlbOps) -> u16 {
        let stamp = self.next_timestamp;
        self.next_timestamp += 1;

        if let Some(slot) = self.slots.iter_mut().find(|s| s.space == Some(space)) {
            slot.timestamp = stamp;
            return slot.pcid;
        }

        if let Some(slot) = self.slots.iter_mut().find(|s| s.space.is_none()) {
            slot.space = Some(space);
            slot.timestamp = stamp;
            return slot.pcid;
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(index, slot)| (slot.timestamp, *index))
            .map(|(index, _)| index)
            .unwrap();
        let slot = &mut self.slots[victim];
        tlb.flush_context(slot.pcid);
        slot.space = Some(space);
        slot.timestamp = stamp;
        slot.pcid
    }

    /// Unbind `space` if it holds a tag, flushing the tag's translations.
    /// Called when the space is destroyed so a later rebind of the freed
    /// slot cannot observe its mappings.
    pub fn drop_space(&mut self, space: SpaceId, tlb: &mut dyn TlbOps) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.space == Some(space)) {
            tlb.flush_context(slot.pcid);
            slot.space = None;
            slot.timestamp = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn lookup(&self, space: SpaceId) -> Option<u16> {
        self.slots
            .iter()
            .find(|s| s.space == Some(space))
            .map(|s| s.pcid)
    }
}

impl Default for PcidCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tlb::recording::{RecordingTlb, TlbEvent};

    #[test]
    fn rebinding_a_cached_space_does_not_flush() {
        let (mut tlb, log) = RecordingTlb::new();
        let mut cache = PcidCache::new();
        let first = cache.acquire(7, &mut tlb);
        let again = cache.acquire(7, &mut tlb);
        assert_eq!(first, again);
        assert!(log.events().is_empty());
    }

    #[test]
    fn distinct_spaces_get_distinct_tags_while_slots_last() {
        let (mut tlb, log) = RecordingTlb::new();
        let mut cache = PcidCache::new();
        let mut tags = alloc::vec::Vec::new();
        for space in 0..N_PCIDS {
            tags.push(cache.acquire(space, &mut tlb));
        }
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), N_PCIDS);
        assert!(log.events().is_empty());
    }

    #[test]
    fn full_cache_evicts_least_recently_used_and_flushes_its_tag() {
        let (mut tlb, log) = RecordingTlb::new();
        let mut cache = PcidCache::new();
        for space in 0..N_PCIDS {
            cache.acquire(space, &mut tlb);
        }
        // Touch space 0 so space 1 becomes the oldest binding.
        cache.acquire(0, &mut tlb);
        let stale_tag = cache.lookup(1).unwrap();

        let tag = cache.acquire(100, &mut tlb);
        assert_eq!(tag, stale_tag);
        assert_eq!(log.events(), alloc::vec![TlbEvent::FlushContext(stale_tag)]);
        assert_eq!(cache.lookup(1), None);
        assert_eq!(cache.lookup(100), Some(tag));
    }

    #[test]
    fn eviction_ties_break_toward_the_lowest_slot() {
        let (mut tlb, _log) = RecordingTlb::new();
        let mut cache = PcidCache::new();
        for slot in cache.slots.iter_mut() {
            slot.space = Some(slot.pcid as SpaceId);
            slot.timestamp = 42;
        }
        let tag = cache.acquire(100, &mut tlb);
        assert_eq!(tag, 0);
    }

    #[test]
    fn dropping_a_space_frees_its_slot_and_flushes() {
        let (mut tlb, log) = RecordingTlb::new();
        let mut cache = PcidCache::new();
        let tag = cache.acquire(3, &mut tlb);
        cache.drop_space(3, &mut tlb);
        assert_eq!(cache.lookup(3), None);
        assert_eq!(log.events(), alloc::vec![TlbEvent::FlushContext(tag)]);

        // Dropping an unbound space is a no-op.
        log.clear();
        cache.drop_space(3, &mut tlb);
        assert!(log.events().is_empty());
    }
}
