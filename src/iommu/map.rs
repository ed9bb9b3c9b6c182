// SPDX-License-Identifier: MPL-2.0

//! Ordered index from virtual-address interval to DMA mapping.
//!
//! A probabilistic skip list with a fixed maximum of 8 levels. Entries are
//! keyed by their virtual-address interval and looked up by point: given a
//! `vaddr`, the entry whose `[vaddr, vaddr + len)` interval contains it.
//! Two singleton sentinels bound every level, a head below all addresses
//! and a tail above them. The list height grows by at most one per insert
//! and shrinks while the topmost level is empty.
//!
//! Structural mutation and traversal are protected by the owning context's
//! mutex; mapping churn is rare compared to DMA issue, so nothing
//! lock-free is warranted here.

use rand::Rng;

use super::Mapping;
use crate::{Error, Result};

pub(crate) const SKIPLIST_LEVELS: usize = 8;

struct Node {
    mapping: Mapping,
    forward: [*mut Node; SKIPLIST_LEVELS],
}

impl Node {
    /// One past the last virtual address the entry covers.
    fn end(&self) -> usize {
        self.mapping.vaddr.wrapping_add(self.mapping.len)
    }
}

fn sentinel(vaddr: usize) -> *mut Node {
    Box::into_raw(Box::new(Node {
        mapping: Mapping {
            vaddr,
            len: 0,
            iova: 0,
            flags: super::MappingFlags::empty(),
        },
        forward: [std::ptr::null_mut(); SKIPLIST_LEVELS],
    }))
}

/// Geometric level choice with p = 1/2, capped at the list maximum.
fn random_level() -> usize {
    let mut rng = rand::rng();
    let mut k = 0;
    while k < SKIPLIST_LEVELS - 1 && rng.random::<bool>() {
        k += 1;
    }
    k
}

pub(crate) struct IovaMap {
    head: *mut Node,
    tail: *mut Node,
    /// Index of the topmost level currently in use.
    height: usize,
    len: usize,
}

// SAFETY: all node pointers are owned by the map and only dereferenced
// under the protecting mutex.
unsafe impl Send for IovaMap {}

impl IovaMap {
    pub(crate) fn new() -> Self {
        let head = sentinel(0);
        let tail = sentinel(usize::MAX);
        // SAFETY: both sentinels were just allocated.
        unsafe {
            (*head).forward = [tail; SKIPLIST_LEVELS];
        }
        Self {
            head,
            tail,
            height: 0,
            len: 0,
        }
    }

    /// Walks the list from the top level down.
    ///
    /// Returns the entry containing `vaddr` (or null) and, per level, the
    /// rightmost node strictly before `vaddr`.
    fn find_path(&self, vaddr: usize) -> (*mut Node, [*mut Node; SKIPLIST_LEVELS]) {
        let mut update = [self.head; SKIPLIST_LEVELS];
        let mut p = self.head;

        for k in (0..=self.height).rev() {
            // SAFETY: forward pointers at or below the current height point
            // to live nodes and every level is terminated by the tail.
            unsafe {
                let mut next = (*p).forward[k];
                while next != self.tail && vaddr >= (*next).end() {
                    p = next;
                    next = (*p).forward[k];
                }
            }
            update[k] = p;
        }

        // SAFETY: as above; level 0 links every entry.
        let candidate = unsafe { (*p).forward[0] };
        let hit = candidate != self.tail && {
            // SAFETY: candidate is a live non-sentinel node.
            unsafe { vaddr >= (*candidate).mapping.vaddr && vaddr < (*candidate).end() }
        };

        (if hit { candidate } else { std::ptr::null_mut() }, update)
    }

    /// Returns the mapping whose interval contains `vaddr`.
    pub(crate) fn find(&self, vaddr: usize) -> Option<Mapping> {
        let (node, _) = self.find_path(vaddr);
        if node.is_null() {
            return None;
        }
        // SAFETY: a non-null hit is a live node.
        Some(unsafe { (*node).mapping })
    }

    /// Inserts a mapping, failing if its start address is already covered.
    pub(crate) fn insert(&mut self, mapping: Mapping) -> Result<()> {
        if mapping.len == 0 {
            return Err(Error::InvalidArgs);
        }

        let (existing, mut update) = self.find_path(mapping.vaddr);
        if !existing.is_null() {
            return Err(Error::Exists);
        }

        let mut k = random_level();
        if k > self.height {
            // Grow by at most one level per insert.
            self.height += 1;
            k = self.height;
            update[k] = self.head;
        }

        let node = Box::into_raw(Box::new(Node {
            mapping,
            forward: [std::ptr::null_mut(); SKIPLIST_LEVELS],
        }));
        for level in 0..=k {
            // SAFETY: update[level] is a live node whose forward pointer at
            // `level` is valid; the new node is spliced in behind it.
            unsafe {
                (*node).forward[level] = (*update[level]).forward[level];
                (*update[level]).forward[level] = node;
            }
        }

        self.len += 1;
        Ok(())
    }

    /// Removes the mapping starting exactly at `vaddr`.
    pub(crate) fn remove(&mut self, vaddr: usize) -> Result<Mapping> {
        let (node, update) = self.find_path(vaddr);
        // SAFETY: a non-null hit is a live node.
        if node.is_null() || unsafe { (*node).mapping.vaddr } != vaddr {
            return Err(Error::InvalidArgs);
        }

        for level in 0..=self.height {
            // SAFETY: update entries at or below the height are live nodes.
            unsafe {
                if (*update[level]).forward[level] != node {
                    break;
                }
                (*update[level]).forward[level] = (*node).forward[level];
            }
        }

        // SAFETY: the node was allocated by `insert` and is now unlinked
        // from every level.
        let mapping = unsafe {
            let boxed = Box::from_raw(node);
            boxed.mapping
        };

        // SAFETY: head is live; levels at or below the height are linked.
        while self.height > 0 && unsafe { (*self.head).forward[self.height] } == self.tail {
            self.height -= 1;
        }

        self.len -= 1;
        Ok(mapping)
    }

    /// Removes every entry, invoking `f` on each mapping as it goes away.
    pub(crate) fn clear_with<F: FnMut(&Mapping)>(&mut self, mut f: F) {
        // SAFETY: level 0 links every entry; each node is freed exactly
        // once and the sentinels are relinked afterwards.
        unsafe {
            let mut node = (*self.head).forward[0];
            while node != self.tail {
                let next = (*node).forward[0];
                f(&(*node).mapping);
                drop(Box::from_raw(node));
                node = next;
            }
            (*self.head).forward = [self.tail; SKIPLIST_LEVELS];
        }
        self.height = 0;
        self.len = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Visits every mapping in address order.
    pub(crate) fn for_each<F: FnMut(&Mapping)>(&self, mut f: F) {
        // SAFETY: level 0 links every live entry.
        unsafe {
            let mut node = (*self.head).forward[0];
            while node != self.tail {
                f(&(*node).mapping);
                node = (*node).forward[0];
            }
        }
    }

    #[cfg(test)]
    fn structure(&self) -> (usize, [usize; SKIPLIST_LEVELS]) {
        let mut occupancy = [0; SKIPLIST_LEVELS];
        for (k, slot) in occupancy.iter_mut().enumerate() {
            // SAFETY: every level is terminated by the tail sentinel.
            unsafe {
                let mut node = (*self.head).forward[k];
                while node != self.tail {
                    *slot += 1;
                    node = (*node).forward[k];
                }
            }
        }
        (self.height, occupancy)
    }
}

impl Drop for IovaMap {
    fn drop(&mut self) {
        self.clear_with(|_| ());
        // SAFETY: the sentinels were allocated in `new` and all entries are
        // gone.
        unsafe {
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::MappingFlags;
    use super::*;

    fn mapping(vaddr: usize, len: usize, iova: u64) -> Mapping {
        Mapping {
            vaddr,
            len,
            iova,
            flags: MappingFlags::STICKY,
        }
    }

    #[test]
    fn point_lookup_resolves_any_covered_address() {
        let mut map = IovaMap::new();
        map.insert(mapping(0x7000_0000, 0x3000, 0x10000)).unwrap();

        for k in [0usize, 1, 0x1001, 0x2fff] {
            let m = map.find(0x7000_0000 + k).unwrap();
            assert_eq!(m.iova, 0x10000);
            assert_eq!(m.vaddr, 0x7000_0000);
        }
        assert!(map.find(0x7000_0000 - 1).is_none());
        assert!(map.find(0x7000_3000).is_none());
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut map = IovaMap::new();
        map.insert(mapping(0x1000, 0x1000, 1)).unwrap();
        assert!(matches!(
            map.insert(mapping(0x1000, 0x2000, 2)),
            Err(Error::Exists)
        ));
        // A start address inside an existing interval is a duplicate too.
        assert!(matches!(
            map.insert(mapping(0x1800, 0x1000, 3)),
            Err(Error::Exists)
        ));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_requires_the_exact_start_address() {
        let mut map = IovaMap::new();
        map.insert(mapping(0x1000, 0x2000, 1)).unwrap();
        assert!(matches!(map.remove(0x1008), Err(Error::InvalidArgs)));
        assert!(matches!(map.remove(0x4000), Err(Error::InvalidArgs)));
        assert!(map.remove(0x1000).is_ok());
        assert!(map.is_empty());
    }

    #[test]
    fn insert_then_remove_restores_the_structure() {
        let mut map = IovaMap::new();
        for i in 0..32usize {
            map.insert(mapping(0x10_0000 + i * 0x2000, 0x1000, i as u64))
                .unwrap();
        }
        let before = map.structure();

        map.insert(mapping(0x5000, 0x1000, 999)).unwrap();
        map.remove(0x5000).unwrap();

        assert_eq!(map.structure(), before);
    }

    #[test]
    fn interleaved_inserts_stay_ordered() {
        let mut map = IovaMap::new();
        let addrs: Vec<usize> = (0..64).map(|i| 0x1000 * ((i * 37) % 64 + 1)).collect();
        for (i, &a) in addrs.iter().enumerate() {
            map.insert(mapping(a, 0x1000, i as u64)).unwrap();
        }

        let mut seen = Vec::new();
        map.for_each(|m| seen.push(m.vaddr));
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(seen, sorted);
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn clear_with_visits_everything() {
        let mut map = IovaMap::new();
        for i in 1..=16usize {
            map.insert(mapping(i * 0x10000, 0x1000, i as u64)).unwrap();
        }
        let mut count = 0;
        map.clear_with(|_| count += 1);
        assert_eq!(count, 16);
        assert!(map.is_empty());
        assert!(map.find(0x10000).is_none());

        // The emptied list accepts inserts again.
        map.insert(mapping(0x10000, 0x1000, 1)).unwrap();
        assert!(map.find(0x10000).is_some());
    }

    #[test]
    fn height_never_exceeds_the_level_cap() {
        let mut map = IovaMap::new();
        for i in 1..=1024usize {
            map.insert(mapping(i * 0x1000, 0x800, i as u64)).unwrap();
        }
        let (height, _) = map.structure();
        assert!(height < SKIPLIST_LEVELS);
        for i in 1..=1024usize {
            map.remove(i * 0x1000).unwrap();
        }
        let (height, occupancy) = map.structure();
        assert_eq!(height, 0);
        assert_eq!(occupancy, [0; SKIPLIST_LEVELS]);
    }
}
