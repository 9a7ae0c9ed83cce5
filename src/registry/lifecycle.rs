//! Lock-free shard acquisition
//!
//! A Treiber-style free list over shard indexes. Every reference to a list
//! node, `head` as well as the `next[]` links, carries a generation in its
//! high part:
//!
//! ```text
//! shard ref = generation * slots_len + index
//! head      = (first free shard ref) - 1
//! next[i]   = ref of the node after i while i is free,
//!             the ref handed out for i while i is acquired,
//!             0 if never touched (implies i + 1)
//! ```
//!
//! Releasing bumps the generation of the pushed reference, so a thread that
//! read `head` before a release/re-acquire cycle fails its compare-and-swap
//! instead of linking a stale node (the ABA case).
//!
//! Index 0 is never handed out; exhausting the pool yields
//! [`ShardRef::SHARED`].

use super::tag::ShardRef;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Lifecycle {
    head: AtomicU64,
    next: Box<[AtomicU64]>,
    slots_len: u64,
}

impl Lifecycle {
    pub fn new(slots_len: usize) -> Self {
        Self {
            head: AtomicU64::new(0),
            next: std::iter::repeat_with(|| AtomicU64::new(0))
                .take(slots_len)
                .collect(),
            slots_len: slots_len as u64,
        }
    }

    /// Pop a free shard
    ///
    /// `install` runs once the index is exclusively ours, before the shard
    /// reference is published in `next[]`. Returns [`ShardRef::SHARED`] when
    /// the pool is exhausted.
    pub fn acquire(&self, install: impl FnOnce(usize)) -> ShardRef {
        loop {
            // + 1 keeps index 0 reserved for the shared shard
            let observed = self.head.load(Ordering::Acquire);
            let head = observed.wrapping_add(1);

            let index = head % self.slots_len;
            if index == 0 {
                return ShardRef::SHARED;
            }

            let mut next = self.next[index as usize].load(Ordering::Acquire);
            if next == 0 {
                next = index + 1;
            }

            // next[index] is not ours until the swap succeeds, so `next` may
            // already be stale here; the generation in `head` catches that
            if self
                .head
                .compare_exchange_weak(
                    observed,
                    next.wrapping_sub(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                install(index as usize);
                self.next[index as usize].store(head, Ordering::Release);
                return ShardRef::from_raw(head);
            }
        }
    }

    /// Index of `shard` if it is the live reference for its index
    pub fn current(&self, shard: ShardRef) -> Option<usize> {
        let raw = shard.into_raw();
        let index = (raw % self.slots_len) as usize;
        if index == 0 || self.next[index].load(Ordering::Acquire) != raw {
            return None;
        }
        Some(index)
    }

    /// Push `shard` back onto the free list with a bumped generation
    ///
    /// `clear` runs while the index is still owned. Returns `false` without
    /// touching anything if `shard` is not the live reference (double
    /// release, corruption, or the shared shard).
    pub fn release(&self, shard: ShardRef, clear: impl FnOnce(usize)) -> bool {
        let Some(index) = self.current(shard) else {
            return false;
        };

        clear(index);

        let head = shard.into_raw().wrapping_add(self.slots_len);
        loop {
            let observed = self.head.load(Ordering::Acquire);
            // still owned, so writing our own link is race-free
            self.next[index].store(observed.wrapping_add(1), Ordering::Release);

            if self
                .head
                .compare_exchange_weak(
                    observed,
                    head.wrapping_sub(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }
}
