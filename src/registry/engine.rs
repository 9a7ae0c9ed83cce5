//! Registry facade
//!
//! Routes tags to shards and combines the lock-free shard lifecycle with the
//! per-shard slots. Private shards carry no synchronisation at all: the
//! embedding side guarantees that only the acquiring thread touches them.
//! Shard 0 is shared by every thread and sits behind a reader/writer lock.
//!
//! Resolving a tag costs three array lookups:
//!
//! ```text
//! entry = slots[tag.slot].hunks[tag.hunk].items[tag.entry]   (+ mark check)
//! ```

use super::guard::ShardGuard;
use super::lifecycle::Lifecycle;
use super::slot::Slot;
use super::tag::{Layout, Location, ShardRef, Tag};
use crate::config::RegistryConfig;
use crate::error::{Fault, Result};
use crate::metrics::{RegistryMetrics, RegistryStats};
use parking_lot::RwLock;
use std::cell::UnsafeCell;
use tracing::{debug, info, warn};

/// Storage for one private shard
struct ShardCell<T>(UnsafeCell<Option<Box<Slot<T>>>>);

// SAFETY: a private shard is only touched by the thread that acquired it,
// except for lookups the caller has promised cannot race a removal; both are
// contracts of the `unsafe` entry points below.
unsafe impl<T: Send + Sync> Sync for ShardCell<T> {}

/// Concurrent, bounded, self-compacting handle registry
///
/// Maps opaque 64-bit [`Tag`]s to owned items so that a caller that can only
/// pass integers can later retrieve or release them. See [`ShardGuard`] for
/// the safe, thread-bound interface.
pub struct Registry<T> {
    config: RegistryConfig,
    layout: Layout,
    lifecycle: Lifecycle,
    /// Private shards; index 0 is never used here
    slots: Box<[ShardCell<T>]>,
    shared: RwLock<Slot<T>>,
    metrics: RegistryMetrics,
}

impl<T> Registry<T> {
    /// Create a registry with the given dimensions
    pub fn new(config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        let layout = Layout::new(&config);
        let metrics = RegistryMetrics::new(&config.name)?;

        info!(
            registry = %config.name,
            shards = config.max_slots,
            shard_capacity = config.shard_capacity(),
            "Initializing handle registry"
        );

        Ok(Self {
            lifecycle: Lifecycle::new(config.max_slots),
            slots: std::iter::repeat_with(|| ShardCell(UnsafeCell::new(None)))
                .take(config.max_slots)
                .collect(),
            shared: RwLock::new(Slot::new(&layout)),
            metrics,
            layout,
            config,
        })
    }

    /// Create a registry with default dimensions
    pub fn with_defaults() -> Result<Self> {
        Self::new(RegistryConfig::default())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn metrics(&self) -> &RegistryMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> RegistryStats {
        self.metrics.snapshot()
    }

    /// Items a private shard takes before inserts overflow to the shared one
    pub fn shard_capacity(&self) -> usize {
        self.config.shard_capacity()
    }

    /// Number of items held by the shared shard
    pub fn shared_len(&self) -> usize {
        self.shared.read().live()
    }

    /// Acquire a shard bound to the calling thread, released on drop
    pub fn shard(&self) -> ShardGuard<'_, T> {
        ShardGuard::new(self, self.acquire())
    }

    /// Acquire a private shard
    ///
    /// Lock-free. Returns [`ShardRef::SHARED`] once `max_slots - 1` shards
    /// are out; operations on it go through the shared shard's lock.
    pub fn acquire(&self) -> ShardRef {
        let shard = self.lifecycle.acquire(|index| {
            // SAFETY: winning the pop makes `index` exclusively ours
            unsafe { *self.slots[index].0.get() = Some(Box::new(Slot::new(&self.layout))) };
        });

        if shard.is_shared() {
            self.metrics.pool_exhausted();
            debug!(registry = %self.config.name, "Shard pool exhausted, using shared shard");
        } else {
            self.metrics.shard_acquired();
            debug!(registry = %self.config.name, %shard, "Acquired shard");
        }
        shard
    }

    /// Return a shard to the pool, dropping anything still stored in it
    ///
    /// Releasing [`ShardRef::SHARED`] is a no-op; a stale or unknown reference
    /// is logged and ignored.
    ///
    /// # Safety
    ///
    /// Must be called from the thread that acquired `shard`, and no other
    /// thread may be looking up tags of that shard concurrently.
    pub unsafe fn release(&self, shard: ShardRef) {
        if shard.is_shared() {
            return;
        }

        let mut retired = None;
        let released = self.lifecycle.release(shard, |index| {
            // SAFETY: the caller owns the shard until it is pushed back
            retired = unsafe { (*self.slots[index].0.get()).take() };
        });

        if !released {
            self.shard_fault(Fault::InvalidShardRef, shard);
            return;
        }

        self.metrics.shard_released();
        debug!(
            registry = %self.config.name,
            %shard,
            hunks = retired.as_ref().map_or(0, |slot| slot.allocated_hunks()),
            "Released shard"
        );

        // dropped outside the cell so item destructors may re-enter
        if let Some(slot) = retired {
            let live = slot.live();
            if live > 0 {
                self.metrics.fault_by(Fault::LeakedEntries, live as u64);
                warn!(
                    registry = %self.config.name,
                    %shard,
                    live,
                    fault = %Fault::LeakedEntries,
                    "Shard released with live entries"
                );
            }
        }
    }

    /// Register `item` and return its tag, or [`Tag::NONE`] if even the
    /// shared shard is full
    ///
    /// # Safety
    ///
    /// Same contract as [`Registry::try_insert`].
    pub unsafe fn insert(&self, shard: ShardRef, item: T) -> Tag {
        // SAFETY: forwarded contract
        unsafe { self.try_insert(shard, item) }.unwrap_or(Tag::NONE)
    }

    /// Register `item`, handing it back if no shard has room
    ///
    /// A stale or unknown `shard`, or a full private shard, transparently
    /// falls back to the shared shard.
    ///
    /// # Safety
    ///
    /// Unless `shard` is [`ShardRef::SHARED`], the calling thread must be the
    /// one that acquired `shard`.
    pub unsafe fn try_insert(&self, shard: ShardRef, item: T) -> std::result::Result<Tag, T> {
        let item = match self.lifecycle.current(shard) {
            Some(index) => {
                // SAFETY: `shard` is live and owned by the calling thread
                match unsafe { (*self.slots[index].0.get()).as_deref_mut() } {
                    Some(slot) => match self.add(slot, index, shard, item) {
                        Ok(tag) => return Ok(tag),
                        Err(item) => {
                            self.shard_fault(Fault::CapacityExhausted, shard);
                            item
                        }
                    },
                    None => item,
                }
            }
            None => {
                if !shard.is_shared() {
                    self.shard_fault(Fault::InvalidShardRef, shard);
                }
                item
            }
        };

        let mut shared = self.shared.write();
        self.add(&mut shared, 0, ShardRef::SHARED, item)
            .map_err(|item| {
                self.shard_fault(Fault::SharedExhausted, ShardRef::SHARED);
                item
            })
    }

    /// Item registered under `tag`, if any
    ///
    /// # Safety
    ///
    /// If `tag` lives in a private shard, either the calling thread acquired
    /// that shard, or the caller guarantees the entry cannot be removed and
    /// the shard cannot be released while the lookup runs (long-lived items
    /// such as configuration objects).
    ///
    /// `T::clone` runs while the entry's shard is borrowed (for shard 0,
    /// under its read lock) and must not call back into the registry.
    pub unsafe fn lookup(&self, tag: Tag) -> Option<T>
    where
        T: Clone,
    {
        let (index, location, mark) = self.locate(tag)?;

        let found = if index == 0 {
            self.shared
                .read()
                .get(location.hunk, location.entry, mark)
                .cloned()
        } else {
            // SAFETY: forwarded contract
            match unsafe { (*self.slots[index].0.get()).as_deref() } {
                Some(slot) => slot.get(location.hunk, location.entry, mark).cloned(),
                None => Err(Fault::StaleTag),
            }
        };

        self.settle(tag, found)
    }

    /// Remove and return the item registered under `tag`, if any
    ///
    /// # Safety
    ///
    /// If `tag` lives in a private shard, the calling thread must be the one
    /// that acquired that shard.
    pub unsafe fn remove(&self, tag: Tag) -> Option<T> {
        let (index, location, mark) = self.locate(tag)?;

        let removed = if index == 0 {
            self.shared.write().take(location.hunk, location.entry, mark)
        } else {
            // SAFETY: forwarded contract
            match unsafe { (*self.slots[index].0.get()).as_deref_mut() } {
                Some(slot) => slot.take(location.hunk, location.entry, mark),
                None => Err(Fault::StaleTag),
            }
        };

        self.settle(tag, removed)
    }

    /// Shard index a tag points into, `None` for [`Tag::NONE`]
    pub fn shard_of(&self, tag: Tag) -> Option<usize> {
        self.layout.decode(tag).map(|location| location.slot as usize)
    }

    fn add(
        &self,
        slot: &mut Slot<T>,
        index: usize,
        shard: ShardRef,
        item: T,
    ) -> std::result::Result<Tag, T> {
        let mark = self.layout.mark(slot.version, shard);
        let (hunk, entry) = slot.add(item, mark)?;
        slot.version = slot.version.wrapping_add(1);

        Ok(self.layout.encode(Location::new(
            u64::from(mark),
            index as u64,
            u64::from(hunk),
            u64::from(entry),
        )))
    }

    /// Decode `tag` and range-check the shard index and mark
    fn locate(&self, tag: Tag) -> Option<(usize, Location, u32)> {
        let location = self.layout.decode(tag)?;

        let mark = match u32::try_from(location.mark) {
            Ok(mark) if location.slot < self.layout.slots_len() => mark,
            _ => {
                self.tag_fault(Fault::OutOfRange, tag);
                return None;
            }
        };

        Some((location.slot as usize, location, mark))
    }

    /// Count a rejected tag; tags are caller input, so this stays at debug
    pub(crate) fn tag_fault(&self, fault: Fault, tag: Tag) {
        self.metrics.fault(fault);
        debug!(registry = %self.config.name, %tag, %fault, "Tag rejected");
    }

    fn shard_fault(&self, fault: Fault, shard: ShardRef) {
        self.metrics.fault(fault);
        if fault == Fault::SharedExhausted {
            warn!(registry = %self.config.name, %shard, %fault, "Insert failed");
        } else {
            debug!(registry = %self.config.name, %shard, %fault, "Shard degraded");
        }
    }

    fn settle<R>(&self, tag: Tag, outcome: std::result::Result<R, Fault>) -> Option<R> {
        match outcome {
            Ok(item) => Some(item),
            Err(fault) => {
                self.tag_fault(fault, tag);
                None
            }
        }
    }
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .finish()
    }
}
