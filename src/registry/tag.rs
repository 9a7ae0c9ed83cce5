//! Tag codec
//!
//! A tag packs the location of an entry and a checksum ("mark") into one
//! 64-bit integer using mixed-radix arithmetic:
//!
//! ```text
//! tag = mark  * mark_base      mark_base = max_slots * slot_base
//!     + slot  * slot_base      slot_base = hunks_per_slot * hunk_base
//!     + hunk  * hunk_base      hunk_base = items_per_hunk
//!     + entry
//!     + 1
//! ```
//!
//! The usable part of each level is `base - spare`, so a legitimate tag never
//! uses the top of any digit and the `+ 1` keeps it away from `0`.

use crate::config::{RegistryConfig, MARK_CEILING};
use std::fmt;

/// Multiplier mixed into marks so neighbouring shards diverge quickly
const MARK_MIX: u64 = 0x9e37_79b9;

/// Opaque handle for a registered item
///
/// `Tag::NONE` (`0`) is never issued for a live entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tag(u64);

impl Tag {
    /// The "no value" tag
    pub const NONE: Tag = Tag(0);

    /// Wrap a raw value received from across a call boundary
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value to hand across a call boundary
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Tag {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<Tag> for u64 {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Versioned shard ownership reference
///
/// Encodes `generation * max_slots + index`. `ShardRef::SHARED` (`0`) routes
/// every operation through the mutex-guarded shared shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ShardRef(u64);

impl ShardRef {
    /// The shared overflow shard
    pub const SHARED: ShardRef = ShardRef(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn into_raw(self) -> u64 {
        self.0
    }

    pub const fn is_shared(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for ShardRef {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<ShardRef> for u64 {
    fn from(shard: ShardRef) -> Self {
        shard.0
    }
}

impl fmt::Display for ShardRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shard({})", self.0)
    }
}

/// Decoded tag components
///
/// Components come straight out of the arithmetic and are not bounds-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub mark: u64,
    pub slot: u64,
    pub hunk: u64,
    pub entry: u64,
}

impl Location {
    pub fn new(mark: u64, slot: u64, hunk: u64, entry: u64) -> Self {
        Self {
            mark,
            slot,
            hunk,
            entry,
        }
    }
}

/// Radix bases and usable lengths derived from a [`RegistryConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    items_len: u32,
    hunks_len: u32,
    slots_len: u64,
    hunk_base: u64,
    slot_base: u64,
    mark_base: u64,
    mark_modulus: u64,
}

impl Layout {
    /// Derive the layout; `config` must have passed validation
    pub fn new(config: &RegistryConfig) -> Self {
        let hunk_base = config.items_per_hunk as u64;
        let slot_base = config.hunks_per_slot as u64 * hunk_base;
        let mark_base = config.max_slots as u64 * slot_base;

        Self {
            items_len: config.items_len() as u32,
            hunks_len: config.hunks_len() as u32,
            slots_len: config.max_slots as u64,
            hunk_base,
            slot_base,
            mark_base,
            mark_modulus: (u64::MAX / mark_base).min(MARK_CEILING),
        }
    }

    /// Usable entries per hunk
    pub fn items_len(&self) -> u32 {
        self.items_len
    }

    /// Usable hunks per slot
    pub fn hunks_len(&self) -> u32 {
        self.hunks_len
    }

    /// Number of shards including the shared one
    pub fn slots_len(&self) -> u64 {
        self.slots_len
    }

    /// Number of distinct marks
    pub fn mark_modulus(&self) -> u64 {
        self.mark_modulus
    }

    pub fn encode(&self, location: Location) -> Tag {
        Tag(location.mark * self.mark_base
            + location.slot * self.slot_base
            + location.hunk * self.hunk_base
            + location.entry
            + 1)
    }

    /// Split a tag into its components; `None` only for [`Tag::NONE`]
    pub fn decode(&self, tag: Tag) -> Option<Location> {
        let rest = tag.0.checked_sub(1)?;

        let mark = rest / self.mark_base;
        let rest = rest % self.mark_base;

        let slot = rest / self.slot_base;
        let rest = rest % self.slot_base;

        let hunk = rest / self.hunk_base;
        let entry = rest % self.hunk_base;

        Some(Location {
            mark,
            slot,
            hunk,
            entry,
        })
    }

    /// Derive the mark for the next insert into a shard
    ///
    /// Cheap corruption detector, not an authenticator: a stale tag is caught
    /// with high probability only.
    pub fn mark(&self, version: u64, shard: ShardRef) -> u32 {
        let mixed = version
            .wrapping_mul(self.mark_base)
            .wrapping_add(shard.0.wrapping_mul(MARK_MIX));
        // mark_modulus <= MARK_CEILING, so the cast is lossless
        ((mixed / self.mark_base) % self.mark_modulus) as u32
    }

    /// Shard index of a shard reference (generation stripped)
    pub fn shard_index(&self, shard: ShardRef) -> usize {
        (shard.0 % self.slots_len) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_layout() -> Layout {
        Layout::new(&RegistryConfig::new(64, 16, 8))
    }

    #[test]
    fn test_tag_never_zero() {
        let layout = small_layout();
        let tag = layout.encode(Location::new(0, 0, 0, 0));
        assert!(!tag.is_none());
        assert_eq!(tag.into_raw(), 1);
    }

    #[test]
    fn test_decode_none() {
        assert_eq!(small_layout().decode(Tag::NONE), None);
    }

    #[test]
    fn test_encode_decode_components() {
        let layout = small_layout();
        let location = Location::new(12345, 7, 5, 53);

        let tag = layout.encode(location);
        assert_eq!(layout.decode(tag), Some(location));
    }

    #[test]
    fn test_default_layout_bit_widths() {
        let layout = Layout::new(&RegistryConfig::default());
        let location = Location::new(1, 1, 1, 1);

        // 12 bits per level below a 28-bit mark
        let raw = layout.encode(location).into_raw();
        assert_eq!(raw, (1 << 36) + (1 << 24) + (1 << 12) + 1 + 1);
        assert_eq!(layout.mark_modulus(), MARK_CEILING - 1);
    }

    #[test]
    fn test_decode_spare_digits_are_reported_raw() {
        let layout = small_layout();
        // hunk 14 and entry 60 sit in the spare range; decode only splits
        let location = layout
            .decode(Tag::from_raw(3 * 64 * 16 * 8 + 2 * 64 * 16 + 14 * 64 + 60 + 1))
            .unwrap();

        assert_eq!(location, Location::new(3, 2, 14, 60));
        assert!(location.hunk >= u64::from(layout.hunks_len()));
        assert!(location.entry >= u64::from(layout.items_len()));
    }

    #[test]
    fn test_mark_changes_with_version() {
        let layout = Layout::new(&RegistryConfig::default());
        let shard = ShardRef::from_raw(1);

        let first = layout.mark(0, shard);
        let second = layout.mark(1, shard);
        assert_ne!(first, second);
        assert!(u64::from(first) < layout.mark_modulus());
    }

    #[test]
    fn test_shard_index_strips_generation() {
        let layout = small_layout();
        assert_eq!(layout.shard_index(ShardRef::from_raw(3)), 3);
        assert_eq!(layout.shard_index(ShardRef::from_raw(3 + 8 * 5)), 3);
        assert_eq!(layout.shard_index(ShardRef::SHARED), 0);
    }
}
