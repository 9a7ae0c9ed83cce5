//! Fixed-capacity entry block
//!
//! Free entries form a LIFO chain threaded through `next`:
//!
//! ```text
//! head ─→ 5 ─→ !next[5] = 2 ─→ !next[2] = 7 ─→ ...
//! ```
//!
//! A vacant entry stores the bit complement of the next free index, or `0`
//! if it was never linked, in which case the next free entry is `index + 1`.
//! An occupied entry reuses the same word for the mark of its item.

use crate::error::Fault;

pub(crate) struct Hunk<T> {
    items: Box<[Option<T>]>,
    /// Free-list link (complemented) or item mark
    next: Box<[u32]>,
    /// First free entry
    head: u32,
    /// Position of this hunk in the owning slot's heap
    pub(crate) rank: usize,
    /// Occupied entries, plus any reserved count
    pub(crate) used: u32,
}

impl<T> Hunk<T> {
    pub fn new(capacity: u32) -> Self {
        Self::with_reserved(capacity, 0)
    }

    /// Create a hunk that reports `reserved` entries as used from the start
    pub fn with_reserved(capacity: u32, reserved: u32) -> Self {
        Self {
            items: std::iter::repeat_with(|| None)
                .take(capacity as usize)
                .collect(),
            next: vec![0; capacity as usize].into_boxed_slice(),
            head: 0,
            rank: 0,
            used: reserved,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.items.len() as u32
    }

    pub fn is_full(&self) -> bool {
        self.used >= self.capacity()
    }

    /// Store `item` under `mark` in the most recently freed entry
    ///
    /// Hands the item back if the hunk is full.
    pub fn insert(&mut self, item: T, mark: u32) -> Result<u32, T> {
        if self.is_full() {
            return Err(item);
        }

        let index = self.head;
        let link = self.next[index as usize];
        self.head = if link == 0 { index + 1 } else { !link };
        self.used += 1;

        self.items[index as usize] = Some(item);
        self.next[index as usize] = mark;

        Ok(index)
    }

    pub fn get(&self, index: u64, mark: u32) -> Result<&T, Fault> {
        let index = self.check(index, mark)?;
        self.items[index].as_ref().ok_or(Fault::StaleTag)
    }

    /// Remove the item at `index` if `mark` matches
    pub fn take(&mut self, index: u64, mark: u32) -> Result<T, Fault> {
        let index = self.check(index, mark)?;
        let item = self.items[index].take().ok_or(Fault::StaleTag)?;

        self.next[index] = !self.head;
        self.head = index as u32;
        self.used -= 1;

        Ok(item)
    }

    /// Number of items actually stored, reserved count excluded
    pub fn live(&self) -> usize {
        self.items.iter().filter(|item| item.is_some()).count()
    }

    fn check(&self, index: u64, mark: u32) -> Result<usize, Fault> {
        if index >= self.items.len() as u64 {
            return Err(Fault::OutOfRange);
        }
        let index = index as usize;
        if self.next[index] != mark {
            return Err(Fault::StaleTag);
        }
        Ok(index)
    }
}
