//! Handle registry
//!
//! Hands out opaque 64-bit tags for owned items so that code which can only
//! carry integers can refer to them, look them up again and release them.
//!
//! # Architecture
//!
//! ```text
//! Registry
//!   ├─→ Lifecycle (lock-free free list of shard indexes)
//!   ├─→ Slot 0   (shared, RwLock)      ← pool exhausted / overflow
//!   ├─→ Slot 1   (private to thread A)
//!   │     └─→ heap of Hunks, fullest first
//!   │           └─→ Hunk: [item|mark] x items_len, LIFO free chain
//!   └─→ Slot N   (private to thread B)
//!
//! Tag = mark · slot · hunk · entry  (mixed radix, + 1)
//! ```
//!
//! Private shards have no locks. A thread acquires one, stores and removes
//! items in it and releases it when done; only lookups of long-lived items
//! may come from other threads. [`ShardGuard`] enforces the thread binding
//! in the type system, the raw `unsafe` operations on [`Registry`] leave it
//! to the caller.
//!
//! Memory stays proportional to live items: inserts favour the fullest hunk,
//! so sparse hunks drain and get freed.

pub mod engine;
pub mod guard;
pub mod tag;

pub(crate) mod hunk;
pub(crate) mod lifecycle;
pub(crate) mod slot;

pub use engine::Registry;
pub use guard::ShardGuard;
pub use tag::{Layout, Location, ShardRef, Tag};
