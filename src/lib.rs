//! A concurrent map with a lock-free read path.
//!
//! The [`SplitMap`] keeps its data in two structures. An immutable snapshot, published through
//! an atomic pointer, answers reads without taking any lock. A mutex-guarded dirty map picks
//! up everything the snapshot cannot answer ‒ freshly inserted keys in particular. Reads that
//! had to fall through to the dirty map are counted and, once they outnumber it, the dirty
//! map is promoted wholesale into a new snapshot. Keys that are read repeatedly therefore end
//! up on the lock-free path, while the promotion cost stays amortized by the misses that
//! triggered it.
//!
//! The design shines when entries are written once and read many times, or when threads work
//! on disjoint keys. It is *not* a general replacement for a locked `HashMap`: a workload
//! that keeps inserting fresh keys pays for both structures and wins nothing.
//!
//! # Consistency
//!
//! Operations on a single key are linearizable with respect to each other ‒ a thread that
//! stores a value and loads the same key right away sees that value (or a newer one). There
//! is no ordering across distinct keys, and [`range`][SplitMap::range] is only weakly
//! consistent. If stronger guarantees are needed, they have to be built outside.
//!
//! # Examples
//!
//! ```rust
//! use splitmap::SplitMap;
//! use crossbeam_utils::thread;
//!
//! let map = SplitMap::new();
//!
//! thread::scope(|s| {
//!     s.spawn(|_| {
//!         map.store("hello", 1);
//!     });
//!     s.spawn(|_| {
//!         map.store("world", 2);
//!     });
//! }).unwrap();
//!
//! assert_eq!(Some(1), map.load("hello"));
//! assert_eq!(Some(2), map.load("world"));
//! assert_eq!(None, map.load("universe"));
//! ```

mod entry;
pub mod existing_or_new;
pub mod map;
#[cfg(test)]
mod tests;

pub use crate::existing_or_new::ExistingOrNew;
pub use crate::map::SplitMap;
