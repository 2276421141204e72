//! The [`SplitMap`][crate::SplitMap] type and its helpers.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::hash::{BuildHasher, Hash};
use std::iter::FromIterator;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_epoch::{Atomic, Guard, Owned};

use crate::entry::{self, Entry, TryLoadOrStore, Value};
use crate::existing_or_new::ExistingOrNew;

type Entries<K, V, S> = HashMap<K, Arc<Entry<V>>, S>;
type Slot<'g, V> = crossbeam_epoch::Shared<'g, Value<V>>;

/// One published, immutable generation of the map.
///
/// Readers reach it through an atomic pointer and it never changes afterwards; updates build a
/// new snapshot and swap the pointer, retiring the old one through the epoch machinery. The
/// `entries` map sits behind an `Arc` so that flipping `amended` republishes the same map
/// without copying it.
struct Snapshot<K, V, S> {
    entries: Arc<Entries<K, V, S>>,
    /// The dirty map may hold keys that are not present in `entries`.
    amended: bool,
}

struct Dirty<K, V, S> {
    /// All keys not cleanly resolvable from the snapshot, superset of the snapshot's live
    /// entries while it exists. `None` between a promotion and the next write of a fresh key.
    entries: Option<Entries<K, V, S>>,
    /// Snapshot misses since the last promotion. Once they match the dirty map's size, the
    /// next miss promotes it, which bounds the total promotion cost by the misses paid.
    misses: usize,
}

impl<K, V, S> Dirty<K, V, S> {
    fn entries_mut(&mut self) -> &mut Entries<K, V, S> {
        self.entries
            .as_mut()
            .expect("No dirty map behind an amended snapshot")
    }
}

/// A concurrent map with a lock-free read path.
///
/// The map keeps its entries in two structures: an immutable snapshot shared by all readers
/// and consulted without any locking, and a smaller mutex-guarded dirty map holding the keys
/// the snapshot cannot resolve. Reads that have to take the locked detour are counted, and
/// once they outnumber the dirty map its contents are promoted wholesale into a fresh
/// snapshot. A key that is read repeatedly therefore settles onto the lock-free path, and the
/// promotion work is amortized by the misses that paid for it.
///
/// This layout favours workloads where entries are written once and read many times, or where
/// threads touch disjoint sets of keys. Under a sustained stream of fresh keys it behaves
/// like a locked `HashMap` with extra bookkeeping, and a plain (or sharded) mutex may serve
/// such loads better.
///
/// Looking up values copies them out with `Clone`, so the map is best suited for values that
/// are cheap to clone; wrap expensive ones in an [`Arc`][std::sync::Arc]. The
/// [`compare_and_swap`][SplitMap::compare_and_swap] family compares by value equality and is
/// only available when `V: PartialEq`.
///
/// Operations on a single key are linearizable with respect to each other. There is no
/// ordering guarantee across different keys, and iteration is weakly consistent ‒ see
/// [`range`][SplitMap::range].
///
/// # Examples
///
/// ```rust
/// use splitmap::SplitMap;
///
/// let map = SplitMap::new();
/// map.store("hello", 1);
/// map.store("world", 2);
/// assert_eq!(Some(1), map.load("hello"));
/// assert_eq!(None, map.load("universe"));
/// map.remove("hello");
/// assert_eq!(None, map.load("hello"));
/// ```
///
/// ```rust
/// use splitmap::SplitMap;
/// use crossbeam_utils::thread;
///
/// let map: SplitMap<usize, usize> = SplitMap::new();
///
/// thread::scope(|s| {
///     for t in 0..4 {
///         let map = &map;
///         s.spawn(move |_| {
///             for i in 0..100 {
///                 map.store(t * 100 + i, i);
///             }
///         });
///     }
/// }).unwrap();
///
/// let mut count = 0;
/// map.range(|_, _| {
///     count += 1;
///     true
/// });
/// assert_eq!(400, count);
/// ```
pub struct SplitMap<K, V, S = RandomState> {
    hash_builder: S,
    read: Atomic<Snapshot<K, V, S>>,
    dirty: Mutex<Dirty<K, V, S>>,
}

impl<K, V> SplitMap<K, V, RandomState>
where
    K: Hash + Eq + Clone,
{
    /// Creates an empty map with the default hasher.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K, V, S> SplitMap<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher + Clone,
{
    /// Creates an empty map with the provided hasher.
    pub fn with_hasher(hash_builder: S) -> Self {
        let entries = Arc::new(HashMap::with_hasher(hash_builder.clone()));
        Self {
            hash_builder,
            read: Atomic::new(Snapshot {
                entries,
                amended: false,
            }),
            dirty: Mutex::new(Dirty {
                entries: None,
                misses: 0,
            }),
        }
    }

    /// The currently published snapshot.
    fn snapshot<'g>(&self, pin: &'g Guard) -> &'g Snapshot<K, V, S> {
        // Initialized on construction and only ever swapped for another snapshot, never null.
        unsafe { self.read.load(Ordering::Acquire, pin).deref() }
    }

    fn lock_dirty(&self) -> MutexGuard<'_, Dirty<K, V, S>> {
        // No user code runs while the lock is held (entry transitions and map bookkeeping
        // only), so poisoning means a bug in here, not in the caller.
        self.dirty.lock().expect("Lock poisoned")
    }

    /// Publishes a new snapshot, retiring the previous one.
    fn publish(&self, snapshot: Snapshot<K, V, S>, pin: &Guard) {
        let old = self.read.swap(Owned::new(snapshot), Ordering::AcqRel, pin);
        unsafe { pin.defer_destroy(old) };
    }

    /// Records one locked-path detour and promotes the dirty map once enough of them have
    /// accumulated to pay for it.
    fn miss_locked(&self, dirty: &mut Dirty<K, V, S>, pin: &Guard) {
        dirty.misses += 1;
        if dirty.misses < dirty.entries.as_ref().map_or(0, HashMap::len) {
            return;
        }
        self.promote_locked(dirty, pin);
    }

    /// Promotes the dirty map into a fresh, unamended snapshot.
    fn promote_locked(&self, dirty: &mut Dirty<K, V, S>, pin: &Guard) {
        let entries = dirty.entries.take().expect("Promoting without a dirty map");
        self.publish(
            Snapshot {
                entries: Arc::new(entries),
                amended: false,
            },
            pin,
        );
        dirty.misses = 0;
    }

    /// Builds the dirty map from the snapshot if there is none yet.
    ///
    /// Live entries are shared into it; tombstoned ones are expunged instead, which is what
    /// keeps the dirty map a superset of everything the snapshot can still resolve.
    fn dirty_locked(&self, read: &Snapshot<K, V, S>, dirty: &mut Dirty<K, V, S>, pin: &Guard) {
        if dirty.entries.is_some() {
            return;
        }
        let mut entries =
            HashMap::with_capacity_and_hasher(read.entries.len(), self.hash_builder.clone());
        for (key, entry) in read.entries.iter() {
            if !entry.try_expunge_locked(pin) {
                entries.insert(key.clone(), Arc::clone(entry));
            }
        }
        dirty.entries = Some(entries);
    }

    /// The read-side triage shared by the lookup-flavoured operations.
    ///
    /// Tries the snapshot lock-free; on a miss with an amended snapshot takes the lock,
    /// re-checks (a concurrent promotion may have moved the key) and falls back to the dirty
    /// map, counting the miss. With `evict` set, a dirty-resident key is removed outright ‒
    /// that is the deletion flavour, where the key should not survive the next promotion.
    fn search<Q>(&self, key: &Q, evict: bool, pin: &Guard) -> Option<Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let read = self.snapshot(pin);
        if let Some(entry) = read.entries.get(key) {
            return Some(Arc::clone(entry));
        }
        if !read.amended {
            return None;
        }

        let mut dirty = self.lock_dirty();
        let read = self.snapshot(pin);
        if let Some(entry) = read.entries.get(key) {
            return Some(Arc::clone(entry));
        }
        if !read.amended {
            return None;
        }
        let entries = dirty.entries_mut();
        let entry = if evict {
            entries.remove(key)
        } else {
            entries.get(key).map(Arc::clone)
        };
        // Counted whether or not the key was there ‒ the detour is what costs.
        self.miss_locked(&mut dirty, pin);
        entry
    }

    /// Retires a previous value pointer, turning a null one into `None`.
    ///
    /// The pointer stays readable until the guard is dropped.
    fn retire<'g>(prev: Slot<'g, V>, pin: &'g Guard) -> Option<Slot<'g, V>> {
        if prev.is_null() {
            None
        } else {
            unsafe { pin.defer_destroy(prev) };
            Some(prev)
        }
    }

    /// The store path shared by [`store`][SplitMap::store] and [`swap`][SplitMap::swap]:
    /// swaps the value in, creating the key as needed, and returns the retired previous
    /// pointer, if any.
    fn swap_raw<'g>(&self, key: K, value: V, pin: &'g Guard) -> Option<Slot<'g, V>> {
        let read = self.snapshot(pin);
        let mut value = Owned::new(Value(value));
        if let Some(entry) = read.entries.get(&key) {
            match entry.try_swap(value, pin) {
                Ok(prev) => return Self::retire(prev, pin),
                Err(rejected) => value = rejected,
            }
        }

        let mut dirty = self.lock_dirty();
        let read = self.snapshot(pin);
        let prev = if let Some(entry) = read.entries.get(&key) {
            if entry.unexpunge_locked(pin) {
                // The key fell out of the dirty map when it was rebuilt; share it back in so
                // the next promotion does not lose this write.
                dirty.entries_mut().insert(key, Arc::clone(entry));
            }
            entry.swap_locked(value, pin)
        } else if let Some(entry) = dirty.entries.as_ref().and_then(|m| m.get(&key)) {
            entry.swap_locked(value, pin)
        } else {
            if !read.amended {
                // First fresh key since the last promotion: build the dirty map and flag the
                // snapshot so readers know to take the locked path for unknown keys.
                self.dirty_locked(read, &mut dirty, pin);
                self.publish(
                    Snapshot {
                        entries: Arc::clone(&read.entries),
                        amended: true,
                    },
                    pin,
                );
            }
            dirty.entries_mut().insert(key, Arc::new(Entry::from(value)));
            return None;
        };
        Self::retire(prev, pin)
    }

    /// Looks up the value stored for `key`.
    ///
    /// Lock-free whenever the key resolves from the current snapshot.
    pub fn load<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        let pin = crossbeam_epoch::pin();
        self.search(key, false, &pin)
            .and_then(|entry| entry.load(&pin).cloned())
    }

    /// Stores a value for `key`, replacing any previous one.
    pub fn store(&self, key: K, value: V) {
        let pin = crossbeam_epoch::pin();
        let _ = self.swap_raw(key, value, &pin);
    }

    /// Stores a value for `key` and returns the previously stored one, if any.
    pub fn swap(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        let pin = crossbeam_epoch::pin();
        let prev = self.swap_raw(key, value, &pin)?;
        Some(unsafe { entry::value_ref(prev) }.clone())
    }

    fn finish_load_or_store(result: TryLoadOrStore<'_, V>) -> ExistingOrNew<V>
    where
        V: Clone,
    {
        match result {
            TryLoadOrStore::Loaded(ptr) => {
                ExistingOrNew::Existing(unsafe { entry::value_ref(ptr) }.clone())
            }
            TryLoadOrStore::Stored(ptr) => {
                ExistingOrNew::New(unsafe { entry::value_ref(ptr) }.clone())
            }
            TryLoadOrStore::Expunged(_) => {
                unreachable!("Entry expunged while the lock is held")
            }
        }
    }

    /// Returns the value stored for `key`, inserting `value` first if there was none.
    ///
    /// When several threads race on a vacant key, exactly one insertion wins and every caller
    /// gets the winning value back.
    pub fn load_or_store(&self, key: K, value: V) -> ExistingOrNew<V>
    where
        V: Clone,
    {
        let pin = crossbeam_epoch::pin();
        let read = self.snapshot(&pin);
        let mut value = Owned::new(Value(value));
        if let Some(entry) = read.entries.get(&key) {
            match entry.try_load_or_store(value, &pin) {
                TryLoadOrStore::Expunged(rejected) => value = rejected,
                resolved => return Self::finish_load_or_store(resolved),
            }
        }

        let mut dirty = self.lock_dirty();
        let read = self.snapshot(&pin);
        if let Some(entry) = read.entries.get(&key) {
            if entry.unexpunge_locked(&pin) {
                dirty.entries_mut().insert(key, Arc::clone(entry));
            }
            Self::finish_load_or_store(entry.try_load_or_store(value, &pin))
        } else if let Some(entry) = dirty.entries.as_ref().and_then(|m| m.get(&key)).map(Arc::clone)
        {
            let resolved = Self::finish_load_or_store(entry.try_load_or_store(value, &pin));
            self.miss_locked(&mut dirty, &pin);
            resolved
        } else {
            if !read.amended {
                self.dirty_locked(read, &mut dirty, &pin);
                self.publish(
                    Snapshot {
                        entries: Arc::clone(&read.entries),
                        amended: true,
                    },
                    &pin,
                );
            }
            let stored = V::clone(&value.0);
            dirty.entries_mut().insert(key, Arc::new(Entry::from(value)));
            ExistingOrNew::New(stored)
        }
    }

    /// Deletes the value stored for `key` and returns it.
    ///
    /// A snapshot-resident key is tombstoned in place (lock-free); a dirty-resident one is
    /// removed outright.
    pub fn load_and_delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        let pin = crossbeam_epoch::pin();
        let entry = self.search(key, true, &pin)?;
        let prev = entry.delete(&pin)?;
        let value = unsafe { entry::value_ref(prev) }.clone();
        unsafe { pin.defer_destroy(prev) };
        Some(value)
    }

    /// Deletes the value stored for `key`.
    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let pin = crossbeam_epoch::pin();
        if let Some(entry) = self.search(key, true, &pin) {
            if let Some(prev) = entry.delete(&pin) {
                unsafe { pin.defer_destroy(prev) };
            }
        }
    }

    /// Replaces the value for `key` with `new` if the current one equals `old`.
    ///
    /// Returns whether the swap happened. A vacant (or deleted) key never matches.
    pub fn compare_and_swap<Q>(&self, key: &Q, old: &V, new: V) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: PartialEq,
    {
        let pin = crossbeam_epoch::pin();
        let read = self.snapshot(&pin);
        if let Some(entry) = read.entries.get(key) {
            return entry.try_compare_and_swap(old, new, &pin);
        }
        if !read.amended {
            return false;
        }

        let mut dirty = self.lock_dirty();
        let read = self.snapshot(&pin);
        if let Some(entry) = read.entries.get(key) {
            entry.try_compare_and_swap(old, new, &pin)
        } else if let Some(entry) = dirty.entries.as_ref().and_then(|m| m.get(key)).map(Arc::clone)
        {
            let swapped = entry.try_compare_and_swap(old, new, &pin);
            // The key set did not change, but the locked detour still counts towards the
            // next promotion.
            self.miss_locked(&mut dirty, &pin);
            swapped
        } else {
            false
        }
    }

    /// Deletes the value for `key` if the current one equals `old`.
    ///
    /// Returns whether the deletion happened.
    pub fn compare_and_delete<Q>(&self, key: &Q, old: &V) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: PartialEq,
    {
        let pin = crossbeam_epoch::pin();
        // The key stays in the dirty map even on success ‒ it is tombstoned, not removed, and
        // the next dirty rebuild expunges it.
        match self.search(key, false, &pin) {
            Some(entry) => entry.try_compare_and_delete(old, &pin),
            None => false,
        }
    }

    /// Calls `f` for every key/value pair; returning `false` stops the iteration.
    ///
    /// Iteration is weakly consistent: a key present for the whole duration of the call is
    /// visited exactly once, but inserts and deletes racing with the call may or may not be
    /// reflected. No lock is held while `f` runs.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let pin = crossbeam_epoch::pin();
        let mut read = self.snapshot(&pin);
        if read.amended {
            let mut dirty = self.lock_dirty();
            read = self.snapshot(&pin);
            if read.amended {
                // Iteration needs the whole key set anyway, so fold the dirty map in right
                // away instead of paying for it miss by miss.
                self.promote_locked(&mut dirty, &pin);
                read = self.snapshot(&pin);
            }
        }

        for (key, entry) in read.entries.iter() {
            if let Some(value) = entry.load(&pin) {
                if !f(key, value) {
                    break;
                }
            }
        }
    }

    /// Removes all entries.
    ///
    /// Lock-free writes racing with the clear that already resolved their entry from the old
    /// snapshot may land in it unobserved; that is the same weak consistency iteration has.
    pub fn clear(&self) {
        let pin = crossbeam_epoch::pin();
        let read = self.snapshot(&pin);
        if read.entries.is_empty() && !read.amended {
            // Already clear; don't publish a new snapshot for nothing.
            return;
        }

        let mut dirty = self.lock_dirty();
        let read = self.snapshot(&pin);
        if !read.entries.is_empty() || read.amended {
            self.publish(
                Snapshot {
                    entries: Arc::new(HashMap::with_hasher(self.hash_builder.clone())),
                    amended: false,
                },
                &pin,
            );
        }
        dirty.entries = None;
        dirty.misses = 0;
    }

    /// Panics if a dirty map still exists or the snapshot is still amended.
    ///
    /// The &mut makes sure nobody is modifying the map right now, so the unprotected access
    /// is fine.
    #[cfg(test)]
    pub(crate) fn assert_promoted(&mut self) {
        let dirty = self.dirty.get_mut().expect("Lock poisoned");
        assert!(dirty.entries.is_none(), "Dirty map still present");
        unsafe {
            let pin = crossbeam_epoch::unprotected();
            let read = self.read.load(Ordering::Relaxed, pin);
            assert!(!read.deref().amended, "Snapshot still amended");
        }
    }
}

// Implementing manually, derive would ask for K, V: Default
impl<K, V, S> Default for SplitMap<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher + Clone + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> Debug for SplitMap<K, V, S>
where
    K: Hash + Eq + Clone + Debug,
    V: Debug,
    S: BuildHasher + Clone,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        let mut output = fmt.debug_map();
        self.range(|key, value| {
            output.entry(key, value);
            true
        });
        output.finish()
    }
}

impl<K, V, S> Extend<(K, V)> for &'_ SplitMap<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher + Clone,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (key, value) in iter {
            self.store(key, value);
        }
    }
}

impl<K, V, S> Extend<(K, V)> for SplitMap<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher + Clone,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let mut me: &SplitMap<K, V, S> = self;
        me.extend(iter);
    }
}

impl<K, V> FromIterator<(K, V)> for SplitMap<K, V>
where
    K: Hash + Eq + Clone,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = SplitMap::new();
        for (key, value) in iter {
            map.store(key, value);
        }
        map
    }
}

impl<K, V, S> Drop for SplitMap<K, V, S> {
    fn drop(&mut self) {
        /*
         * Notes about unsafety here:
         * * We are in a destructor with &mut self, so there are no concurrent accesses any
         *   more; unprotected access and the Relaxed ordering are fine.
         * * Entries are reference counted and shared with the dirty map, which the Mutex
         *   drops on its own; the values inside are freed by the entries' own destructors.
         *   The only thing owned directly here is the snapshot allocation.
         */
        unsafe {
            let pin = crossbeam_epoch::unprotected();
            let read = self.read.load(Ordering::Relaxed, pin);
            drop(read.into_owned());
        }
    }
}
