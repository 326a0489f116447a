//! # Scoped Cache Module
//!
//! A key/value store owned by the [`WorkerContext`](crate::context::WorkerContext):
//! visible to every request the worker serves, invisible to other worker processes,
//! and lost when the worker exits.
//!
//! ## Expiry
//!
//! Entries carry an optional expiry instant. A read after expiry behaves exactly
//! like a miss. Expired entries are purged lazily on access, and the dispatch loop
//! also calls [`ScopedCache::sweep`] every `cache.sweep_interval` requests.
//!
//! ## Values
//!
//! Values are opaque `serde_json::Value`s. `get` returns `Option<Value>`, so a
//! present `null`, `false` or `""` is distinct from absence.
//!
//! ## Bounding
//!
//! With `cache.max_entries > 0` the store is an LRU: inserting into a full cache
//! evicts the least recently read or written entry.
//!
//! ## Time
//!
//! Expiry is computed against a [`Clock`]. Production uses [`SystemClock`]; tests
//! inject a [`ManualClock`] to simulate elapsed time without sleeping.

mod clock;
mod core;

pub use clock::{Clock, ManualClock, SystemClock};
pub use core::{CacheEntry, CacheStats, ScopedCache};
