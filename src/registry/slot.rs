//! Per-shard hunk pool kept compact with a max-heap
//!
//! ```text
//! hunks: [h0][h1][ -- ][h3] ...        lazily allocated, released when empty
//! free:  heap of (hunk index + 1), fullest non-full hunk at the root
//! ```
//!
//! Inserts always land in the root hunk. Sparse hunks sink in the heap, stop
//! receiving items, drain to zero and get released. Hunk 0 starts with half
//! of its entries reserved, which pins it near the top under spiky,
//! evenly-draining workloads and keeps it from ever being released.

use super::hunk::Hunk;
use super::tag::Layout;
use crate::error::Fault;
use tracing::debug;

pub(crate) struct Slot<T> {
    hunks: Box<[Option<Box<Hunk<T>>>]>,
    /// Heap of hunk indexes plus one; `0` is an untouched position that
    /// implies hunk `position`
    free: Box<[u32]>,
    /// Bumped after every successful insert to vary marks
    pub(crate) version: u64,
    items_len: u32,
}

impl<T> Slot<T> {
    pub fn new(layout: &Layout) -> Self {
        let hunks_len = layout.hunks_len() as usize;
        Self {
            hunks: std::iter::repeat_with(|| None).take(hunks_len).collect(),
            free: vec![0; hunks_len].into_boxed_slice(),
            version: 0,
            items_len: layout.items_len(),
        }
    }

    /// Register `item` in the fullest hunk that still has room
    ///
    /// Returns `(hunk, entry)`, or the item if every hunk is full.
    pub fn add(&mut self, item: T, mark: u32) -> Result<(u32, u32), T> {
        if self.free[0] == 0 {
            // first insert ever: seed the heap root with a pre-booked hunk 0
            self.free[0] = 1;
            self.hunks[0] = Some(Box::new(Hunk::with_reserved(
                self.items_len,
                self.items_len / 2,
            )));
        }

        let index = self.free[0] - 1;
        let items_len = self.items_len;
        let hunk = self.hunks[index as usize].get_or_insert_with(|| {
            debug!(hunk = index, "Allocated hunk");
            Box::new(Hunk::new(items_len))
        });

        // heap order puts full hunks last, so a full root means a full slot
        let entry = hunk.insert(item, mark)?;

        if hunk.is_full() {
            self.fix(0);
        }
        Ok((index, entry))
    }

    pub fn get(&self, hunk: u64, entry: u64, mark: u32) -> Result<&T, Fault> {
        let index = self.check(hunk, entry)?;
        match &self.hunks[index] {
            Some(hunk) => hunk.get(entry, mark),
            None => Err(Fault::StaleTag),
        }
    }

    pub fn take(&mut self, hunk: u64, entry: u64, mark: u32) -> Result<T, Fault> {
        let index = self.check(hunk, entry)?;
        let hunk = self.hunks[index].as_mut().ok_or(Fault::StaleTag)?;

        let item = hunk.take(entry, mark)?;
        let rank = hunk.rank;
        if hunk.used == 0 {
            self.hunks[index] = None;
            debug!(hunk = index, "Released empty hunk");
        }
        self.fix(rank);

        Ok(item)
    }

    /// Number of items stored across all hunks
    pub fn live(&self) -> usize {
        self.hunks.iter().flatten().map(|hunk| hunk.live()).sum()
    }

    /// Number of hunks currently allocated
    pub fn allocated_hunks(&self) -> usize {
        self.hunks.iter().filter(|hunk| hunk.is_some()).count()
    }

    fn check(&self, hunk: u64, entry: u64) -> Result<usize, Fault> {
        if hunk >= self.hunks.len() as u64 || entry >= u64::from(self.items_len) {
            return Err(Fault::OutOfRange);
        }
        Ok(hunk as usize)
    }

    /// Heap key: fullest non-full hunks first, absent hunks next, full last
    fn key(&self, position: usize) -> i64 {
        let f = self.free[position];
        if f == 0 {
            return 0;
        }
        match &self.hunks[f as usize - 1] {
            Some(hunk) if hunk.used < self.items_len => i64::from(hunk.used) + 1,
            Some(_) => -1,
            None => 0,
        }
    }

    fn less(&self, i: usize, j: usize) -> bool {
        // max-heap
        self.key(j) < self.key(i)
    }

    fn swap(&mut self, i: usize, j: usize) {
        let (fi, fj) = (self.free[i], self.free[j]);
        if fi == fj {
            return;
        }

        let fi = if fi == 0 {
            i as u32 + 1
        } else {
            if let Some(hunk) = self.hunks[fi as usize - 1].as_mut() {
                hunk.rank = j;
            }
            fi
        };
        let fj = if fj == 0 {
            j as u32 + 1
        } else {
            if let Some(hunk) = self.hunks[fj as usize - 1].as_mut() {
                hunk.rank = i;
            }
            fj
        };

        self.free[i] = fj;
        self.free[j] = fi;
    }

    /// Restore heap order after the key at `position` changed
    fn fix(&mut self, position: usize) {
        if !self.sift_down(position) {
            self.sift_up(position);
        }
    }

    fn sift_up(&mut self, mut child: usize) {
        while child > 0 {
            let parent = (child - 1) / 2;
            if !self.less(child, parent) {
                break;
            }
            self.swap(parent, child);
            child = parent;
        }
    }

    fn sift_down(&mut self, start: usize) -> bool {
        let len = self.free.len();
        let mut parent = start;
        loop {
            let left = 2 * parent + 1;
            if left >= len {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < len && self.less(right, left) {
                child = right;
            }
            if !self.less(child, parent) {
                break;
            }
            self.swap(parent, child);
            parent = child;
        }
        parent > start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;

    // 54 usable entries per hunk, 6 usable hunks
    fn small_slot() -> Slot<u64> {
        Slot::new(&Layout::new(&RegistryConfig::new(64, 16, 8)))
    }

    fn fill(slot: &mut Slot<u64>, count: usize) -> Vec<(u32, u32)> {
        (0..count)
            .map(|i| slot.add(i as u64, 1).expect("slot has room"))
            .collect()
    }

    #[test]
    fn test_first_hunk_is_half_reserved() {
        let mut slot = small_slot();
        let addrs = fill(&mut slot, 27);

        // 54 - 27 reserved = 27 items fit in hunk 0
        assert!(addrs.iter().all(|&(hunk, _)| hunk == 0));
        assert_eq!(slot.allocated_hunks(), 1);

        let (hunk, entry) = slot.add(99, 1).unwrap();
        assert_ne!(hunk, 0);
        assert_eq!(entry, 0);
        assert_eq!(slot.allocated_hunks(), 2);
    }

    #[test]
    fn test_capacity() {
        let mut slot = small_slot();
        let capacity = 6 * 54 - 27;
        fill(&mut slot, capacity);

        assert_eq!(slot.live(), capacity);
        assert_eq!(slot.add(7, 1), Err(7));
    }

    #[test]
    fn test_get_and_take() {
        let mut slot = small_slot();
        let (hunk, entry) = slot.add(42, 9).unwrap();

        assert_eq!(slot.get(hunk as u64, entry as u64, 9), Ok(&42));
        assert_eq!(slot.get(hunk as u64, entry as u64, 8), Err(Fault::StaleTag));
        assert_eq!(slot.take(hunk as u64, entry as u64, 9), Ok(42));
        assert_eq!(slot.take(hunk as u64, entry as u64, 9), Err(Fault::StaleTag));
    }

    #[test]
    fn test_out_of_range_hunk() {
        let slot = small_slot();
        assert_eq!(slot.get(6, 0, 0), Err(Fault::OutOfRange));
        assert_eq!(slot.get(5, 0, 0), Err(Fault::StaleTag));
        assert_eq!(slot.get(0, 54, 0), Err(Fault::OutOfRange));
    }

    #[test]
    fn test_drained_hunks_are_released() {
        let mut slot = small_slot();
        let addrs = fill(&mut slot, 27 + 54 + 10);
        assert_eq!(slot.allocated_hunks(), 3);

        // drain everything outside hunk 0
        for &(hunk, entry) in addrs.iter().filter(|&&(hunk, _)| hunk != 0) {
            slot.take(hunk as u64, entry as u64, 1).unwrap();
        }

        assert_eq!(slot.allocated_hunks(), 1);
        assert_eq!(slot.live(), 27);
    }

    #[test]
    fn test_first_hunk_is_never_released() {
        let mut slot = small_slot();
        let addrs = fill(&mut slot, 5);

        for &(hunk, entry) in &addrs {
            slot.take(hunk as u64, entry as u64, 1).unwrap();
        }

        assert_eq!(slot.live(), 0);
        assert_eq!(slot.allocated_hunks(), 1);
    }

    #[test]
    fn test_prefers_fullest_hunk() {
        let mut slot = small_slot();
        // hunk 0 full, hunk A full, hunk B partially filled
        let addrs = fill(&mut slot, 27 + 54 + 20);
        let second = addrs[27].0;
        let third = addrs[27 + 54].0;
        assert_ne!(second, third);

        // free a few entries in the full second hunk: it now holds 50,
        // still fuller than the third hunk's 20
        for &(hunk, entry) in addrs.iter().filter(|&&(hunk, _)| hunk == second).take(4) {
            slot.take(hunk as u64, entry as u64, 1).unwrap();
        }

        let (hunk, _) = slot.add(1000, 1).unwrap();
        assert_eq!(hunk, second);
    }

    #[test]
    fn test_refill_after_full_drain() {
        let mut slot = small_slot();
        let capacity = 6 * 54 - 27;

        for _ in 0..3 {
            let addrs = fill(&mut slot, capacity);
            for &(hunk, entry) in addrs.iter().rev() {
                slot.take(hunk as u64, entry as u64, 1).unwrap();
            }
            assert_eq!(slot.live(), 0);
        }

        fill(&mut slot, capacity);
        assert_eq!(slot.add(0, 1), Err(0));
    }
}
