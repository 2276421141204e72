//! The per-key atomic value slot.
//!
//! One [`Entry`] exists per key and is shared (behind an `Arc`) between the read snapshot and
//! the dirty map, so both sides always observe the same slot. All the lock-free state
//! transitions of the map happen here; the map itself only decides *which* entry to talk to.

use std::sync::atomic::Ordering;

use bitflags::bitflags;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

bitflags! {
    /// Flags living in the unused low bits of the value pointer.
    ///
    /// A null pointer with no flags is a plain tombstone ‒ the key was deleted through the
    /// lock-free path but still occupies its slot.
    struct SlotFlags: usize {
        /// The slot was tombstoned when the current dirty map was built, so the key is missing
        /// from the dirty map. A lock-free store into such a slot would be lost by the next
        /// promotion; stores must take the locked path and re-insert the key into the dirty
        /// map first.
        const EXPUNGED = 0b1;
    }
}

/// The boxed form of a stored value.
///
/// The flags need at least one free bit in the pointer, which the allocation must provide. The
/// forced alignment makes that hold even for types like `u8` or zero-sized values.
#[repr(align(4))]
pub(crate) struct Value<V>(pub(crate) V);

/// Extracts [`SlotFlags`] from a pointer.
fn flags<V>(ptr: Shared<'_, Value<V>>) -> SlotFlags {
    SlotFlags::from_bits_truncate(ptr.tag())
}

/// Borrows the value behind a non-null slot pointer.
///
/// The caller must have obtained the pointer under the guard the lifetime is tied to.
pub(crate) unsafe fn value_ref<'g, V>(ptr: Shared<'g, Value<V>>) -> &'g V {
    &ptr.deref().0
}

/// What came out of [`Entry::try_load_or_store`].
pub(crate) enum TryLoadOrStore<'g, V> {
    /// A value was already present; the allocation was dropped.
    Loaded(Shared<'g, Value<V>>),
    /// The slot was empty and now holds the provided value.
    Stored(Shared<'g, Value<V>>),
    /// The slot is expunged, nothing was done. The allocation is handed back so the caller can
    /// retry through the locked path without reallocating.
    Expunged(Owned<Value<V>>),
}

/// An atomically updated slot for one value.
///
/// The pointer inside is in one of three states:
///
/// * non-null ‒ a value is present,
/// * null ‒ tombstoned (deleted, but the key still occupies its snapshot slot),
/// * null with [`SlotFlags::EXPUNGED`] ‒ deleted *and* absent from the dirty map.
///
/// Methods suffixed `_locked` may only be called while holding the owning map's mutex; the
/// expunged state is never entered or left outside of it.
pub(crate) struct Entry<V> {
    slot: Atomic<Value<V>>,
}

impl<V> Entry<V> {
    fn expunged<'g>() -> Shared<'g, Value<V>> {
        Shared::null().with_tag(SlotFlags::EXPUNGED.bits())
    }

    /// Reads the current value, if any.
    pub(crate) fn load<'g>(&self, pin: &'g Guard) -> Option<&'g V> {
        let ptr = self.slot.load(Ordering::Acquire, pin);
        if ptr.is_null() {
            // Covers both the tombstoned and the expunged state.
            None
        } else {
            Some(unsafe { value_ref(ptr) })
        }
    }

    /// Swaps the value in, unless the slot is expunged.
    ///
    /// On success returns the previous pointer (null if the slot was tombstoned); retiring it
    /// is the caller's job. On failure the allocation is handed back.
    pub(crate) fn try_swap<'g>(
        &self,
        mut value: Owned<Value<V>>,
        pin: &'g Guard,
    ) -> Result<Shared<'g, Value<V>>, Owned<Value<V>>> {
        let mut ptr = self.slot.load(Ordering::Acquire, pin);
        loop {
            if flags(ptr).contains(SlotFlags::EXPUNGED) {
                return Err(value);
            }
            match self.slot.compare_exchange_weak(
                ptr,
                value,
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            ) {
                Ok(_) => return Ok(ptr),
                Err(err) => {
                    ptr = err.current;
                    value = err.new;
                }
            }
        }
    }

    /// Unconditionally swaps the value in.
    ///
    /// Only valid under the map's mutex, on a slot known not to be expunged (either just
    /// unexpunged, or reachable from the dirty map). Returns the previous pointer.
    pub(crate) fn swap_locked<'g>(
        &self,
        value: Owned<Value<V>>,
        pin: &'g Guard,
    ) -> Shared<'g, Value<V>> {
        self.slot.swap(value, Ordering::AcqRel, pin)
    }

    /// Takes the value out, leaving a tombstone.
    ///
    /// Returns the previous pointer so the caller can clone the value out and retire it, or
    /// `None` if there was nothing to delete.
    pub(crate) fn delete<'g>(&self, pin: &'g Guard) -> Option<Shared<'g, Value<V>>> {
        let mut ptr = self.slot.load(Ordering::Acquire, pin);
        loop {
            if ptr.is_null() {
                return None;
            }
            match self.slot.compare_exchange_weak(
                ptr,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            ) {
                Ok(_) => return Some(ptr),
                Err(err) => ptr = err.current,
            }
        }
    }

    /// Compare-and-swap by value equality.
    ///
    /// Replaces the value only if one is present and equal to `old`. The replaced value is
    /// retired here.
    pub(crate) fn try_compare_and_swap(&self, old: &V, new: V, pin: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut ptr = self.slot.load(Ordering::Acquire, pin);
        if ptr.is_null() || unsafe { value_ref(ptr) } != old {
            return false;
        }
        let mut new = Owned::new(Value(new));
        loop {
            match self
                .slot
                .compare_exchange_weak(ptr, new, Ordering::AcqRel, Ordering::Acquire, pin)
            {
                Ok(_) => {
                    unsafe { pin.defer_destroy(ptr) };
                    return true;
                }
                Err(err) => {
                    ptr = err.current;
                    new = err.new;
                    if ptr.is_null() || unsafe { value_ref(ptr) } != old {
                        return false;
                    }
                }
            }
        }
    }

    /// Compare-and-delete by value equality, leaving a tombstone on success.
    pub(crate) fn try_compare_and_delete(&self, old: &V, pin: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut ptr = self.slot.load(Ordering::Acquire, pin);
        loop {
            if ptr.is_null() || unsafe { value_ref(ptr) } != old {
                return false;
            }
            match self.slot.compare_exchange_weak(
                ptr,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            ) {
                Ok(_) => {
                    unsafe { pin.defer_destroy(ptr) };
                    return true;
                }
                Err(err) => ptr = err.current,
            }
        }
    }

    /// Stores the value if the slot is tombstoned, or reports what is already there.
    pub(crate) fn try_load_or_store<'g>(
        &self,
        mut value: Owned<Value<V>>,
        pin: &'g Guard,
    ) -> TryLoadOrStore<'g, V> {
        let mut ptr = self.slot.load(Ordering::Acquire, pin);
        loop {
            if flags(ptr).contains(SlotFlags::EXPUNGED) {
                return TryLoadOrStore::Expunged(value);
            }
            if !ptr.is_null() {
                return TryLoadOrStore::Loaded(ptr);
            }
            match self.slot.compare_exchange_weak(
                ptr,
                value,
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            ) {
                Ok(stored) => return TryLoadOrStore::Stored(stored),
                Err(err) => {
                    ptr = err.current;
                    value = err.new;
                }
            }
        }
    }

    /// Tombstoned → expunged, when a new dirty map is built without this key.
    ///
    /// Returns whether the slot ended up expunged (even if some other call got there first).
    /// Only under the map's mutex.
    pub(crate) fn try_expunge_locked(&self, pin: &Guard) -> bool {
        let mut ptr = self.slot.load(Ordering::Acquire, pin);
        while ptr.is_null() && !flags(ptr).contains(SlotFlags::EXPUNGED) {
            match self.slot.compare_exchange_weak(
                ptr,
                Self::expunged(),
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            ) {
                Ok(_) => return true,
                Err(err) => ptr = err.current,
            }
        }
        flags(ptr).contains(SlotFlags::EXPUNGED)
    }

    /// Expunged → tombstoned, right before the key is re-inserted into the dirty map.
    ///
    /// Returns whether the slot used to be expunged. Only under the map's mutex.
    pub(crate) fn unexpunge_locked(&self, pin: &Guard) -> bool {
        self.slot
            .compare_exchange(
                Self::expunged(),
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            )
            .is_ok()
    }
}

impl<V> From<Owned<Value<V>>> for Entry<V> {
    fn from(value: Owned<Value<V>>) -> Self {
        Entry {
            slot: Atomic::from(value),
        }
    }
}

impl<V> Drop for Entry<V> {
    fn drop(&mut self) {
        /*
         * We have &mut self, so nobody else is looking at the slot any more; the unprotected
         * guard and the Relaxed ordering are fine. A null pointer (tombstoned or expunged)
         * carries no allocation.
         */
        unsafe {
            let pin = crossbeam_epoch::unprotected();
            let ptr = self.slot.load(Ordering::Relaxed, pin);
            if !ptr.is_null() {
                drop(ptr.into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(value: usize) -> Entry<usize> {
        Entry::from(Owned::new(Value(value)))
    }

    #[test]
    fn load_present() {
        let e = entry(42);
        let pin = crossbeam_epoch::pin();
        assert_eq!(Some(&42), e.load(&pin));
    }

    #[test]
    fn delete_leaves_tombstone() {
        let e = entry(42);
        let pin = crossbeam_epoch::pin();
        let prev = e.delete(&pin).expect("Value should have been present");
        assert_eq!(42, *unsafe { value_ref(prev) });
        unsafe { pin.defer_destroy(prev) };
        assert_eq!(None, e.load(&pin));
        assert!(e.delete(&pin).is_none());
    }

    #[test]
    fn swap_resurrects_tombstone() {
        let e = entry(1);
        let pin = crossbeam_epoch::pin();
        let prev = e.delete(&pin).unwrap();
        unsafe { pin.defer_destroy(prev) };

        // A tombstone is not expunged, so the lock-free swap must succeed.
        let prev = e.try_swap(Owned::new(Value(2)), &pin).ok().unwrap();
        assert!(prev.is_null());
        assert_eq!(Some(&2), e.load(&pin));
    }

    #[test]
    fn expunged_rejects_lock_free_writes() {
        let e = entry(1);
        let pin = crossbeam_epoch::pin();
        let prev = e.delete(&pin).unwrap();
        unsafe { pin.defer_destroy(prev) };

        assert!(e.try_expunge_locked(&pin));
        assert_eq!(None, e.load(&pin));
        assert!(e.try_swap(Owned::new(Value(2)), &pin).is_err());
        match e.try_load_or_store(Owned::new(Value(2)), &pin) {
            TryLoadOrStore::Expunged(_) => (),
            _ => panic!("Expunged slot accepted a lock-free store"),
        }

        assert!(e.unexpunge_locked(&pin));
        assert!(!e.unexpunge_locked(&pin));
        assert!(e.try_swap(Owned::new(Value(2)), &pin).is_ok());
        assert_eq!(Some(&2), e.load(&pin));
    }

    #[test]
    fn expunge_only_hits_tombstones() {
        let e = entry(1);
        let pin = crossbeam_epoch::pin();
        assert!(!e.try_expunge_locked(&pin));
        assert_eq!(Some(&1), e.load(&pin));
    }

    #[test]
    fn compare_and_swap_by_value() {
        let e = entry(1);
        let pin = crossbeam_epoch::pin();
        assert!(e.try_compare_and_swap(&1, 2, &pin));
        assert_eq!(Some(&2), e.load(&pin));
        assert!(!e.try_compare_and_swap(&1, 3, &pin));
        assert_eq!(Some(&2), e.load(&pin));
    }

    #[test]
    fn compare_and_delete_by_value() {
        let e = entry(1);
        let pin = crossbeam_epoch::pin();
        assert!(!e.try_compare_and_delete(&2, &pin));
        assert!(e.try_compare_and_delete(&1, &pin));
        assert_eq!(None, e.load(&pin));
        // Deleted already, nothing to match against.
        assert!(!e.try_compare_and_delete(&1, &pin));
    }

    #[test]
    fn load_or_store_prefers_existing() {
        let e = entry(1);
        let pin = crossbeam_epoch::pin();
        match e.try_load_or_store(Owned::new(Value(2)), &pin) {
            TryLoadOrStore::Loaded(ptr) => assert_eq!(1, *unsafe { value_ref(ptr) }),
            _ => panic!("Existing value should have won"),
        }

        let prev = e.delete(&pin).unwrap();
        unsafe { pin.defer_destroy(prev) };
        match e.try_load_or_store(Owned::new(Value(2)), &pin) {
            TryLoadOrStore::Stored(ptr) => assert_eq!(2, *unsafe { value_ref(ptr) }),
            _ => panic!("Tombstoned slot should have accepted the store"),
        }
    }
}
