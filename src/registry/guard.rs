//! Thread-bound shard handle
//!
//! A [`ShardGuard`] owns one shard reference for as long as it lives and can
//! never leave the thread that created it, which is exactly the ownership
//! contract the raw [`Registry`] operations ask their callers to uphold.
//!
//! While any guard on a thread is inside an operation (an item's `Clone`
//! runs under the shard borrow, and under the shared shard's read lock),
//! every guard on that thread refuses further operations instead of
//! re-entering a borrowed shard or a held lock.

use super::engine::Registry;
use super::tag::{ShardRef, Tag};
use crate::error::Fault;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

thread_local! {
    /// Set while a guard operation is in progress on this thread
    static BUSY: Cell<bool> = const { Cell::new(false) };
}

/// Safe access to a registry through a shard owned by the current thread
///
/// Inserts go to the guard's private shard, overflowing to the shared shard
/// when it is full or when the pool was exhausted at acquisition. Tags that
/// belong to another thread's private shard are refused. The shard is
/// released, and anything left in it dropped, when the guard goes away.
///
/// ```
/// use handle_registry::{Registry, RegistryConfig};
///
/// let registry = Registry::new(RegistryConfig::new(64, 16, 8))?;
/// let shard = registry.shard();
///
/// let tag = shard.insert(String::from("filter"));
/// assert_eq!(shard.lookup(tag).as_deref(), Some("filter"));
/// assert_eq!(shard.remove(tag).as_deref(), Some("filter"));
/// assert_eq!(shard.lookup(tag), None);
/// # Ok::<(), handle_registry::Error>(())
/// ```
pub struct ShardGuard<'r, T> {
    registry: &'r Registry<T>,
    shard: ShardRef,
    index: usize,
    _not_send: PhantomData<*const ()>,
}

impl<'r, T> ShardGuard<'r, T> {
    pub(crate) fn new(registry: &'r Registry<T>, shard: ShardRef) -> Self {
        Self {
            index: registry.layout().shard_index(shard),
            registry,
            shard,
            _not_send: PhantomData,
        }
    }

    /// Shard reference held by this guard
    pub fn shard(&self) -> ShardRef {
        self.shard
    }

    /// True if the pool was exhausted and this guard works on the shared shard
    pub fn is_shared(&self) -> bool {
        self.shard.is_shared()
    }

    /// Whether `tag` points into a shard this guard may touch
    pub fn owns(&self, tag: Tag) -> bool {
        matches!(self.registry.shard_of(tag), Some(index) if index == 0 || index == self.index)
    }

    /// Register `item`; [`Tag::NONE`] if every shard it may use is full
    /// or the call re-enters another guard operation
    pub fn insert(&self, item: T) -> Tag {
        self.try_insert(item).unwrap_or(Tag::NONE)
    }

    /// Register `item`, handing it back if every shard it may use is full
    /// or the call re-enters another guard operation
    pub fn try_insert(&self, item: T) -> Result<Tag, T> {
        if BUSY.with(Cell::get) {
            return Err(item);
        }
        // SAFETY: the guard is !Send, so this is the acquiring thread
        self.enter(|| unsafe { self.registry.try_insert(self.shard, item) })
    }

    /// Clone of the item registered under `tag`
    pub fn lookup(&self, tag: Tag) -> Option<T>
    where
        T: Clone,
    {
        if !self.admits(tag) {
            return None;
        }
        // SAFETY: private tags are limited to the guard's own shard
        self.enter(|| unsafe { self.registry.lookup(tag) })
    }

    /// Remove and return the item registered under `tag`
    pub fn remove(&self, tag: Tag) -> Option<T> {
        if !self.admits(tag) {
            return None;
        }
        // SAFETY: private tags are limited to the guard's own shard
        self.enter(|| unsafe { self.registry.remove(tag) })
    }

    /// Foreign tags are counted as faults, re-entrant calls are not
    fn admits(&self, tag: Tag) -> bool {
        if BUSY.with(Cell::get) {
            return false;
        }
        if !self.owns(tag) {
            if !tag.is_none() {
                self.registry.tag_fault(Fault::InvalidShardRef, tag);
            }
            return false;
        }
        true
    }

    fn enter<R>(&self, op: impl FnOnce() -> R) -> R {
        BUSY.with(|busy| busy.set(true));
        let _busy = BusyReset;
        op()
    }
}

/// Clears the busy flag even if an item's `Clone` panics
struct BusyReset;

impl Drop for BusyReset {
    fn drop(&mut self) {
        BUSY.with(|busy| busy.set(false));
    }
}

impl<T> Drop for ShardGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: still on the acquiring thread; the guard held the only
        // private access to the shard
        unsafe { self.registry.release(self.shard) };
    }
}

impl<T> fmt::Debug for ShardGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardGuard")
            .field("shard", &self.shard)
            .field("index", &self.index)
            .finish()
    }
}
