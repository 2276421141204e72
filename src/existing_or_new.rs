//! The [`ExistingOrNew`][crate::ExistingOrNew] enum.

use std::ops::Deref;

/// Distinguishes whether a value returned by [`load_or_store`][crate::SplitMap::load_or_store]
/// was already in the map or was just inserted by this call.
///
/// It dereferences to the held value, so in many places it can be used directly as a `T`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ExistingOrNew<T> {
    /// The key already had a value; this is it.
    Existing(T),
    /// The key was vacant and the provided value was inserted.
    New(T),
}

impl<T> ExistingOrNew<T> {
    /// Extracts the inner value, dropping the distinction.
    pub fn into_inner(self) -> T {
        match self {
            ExistingOrNew::Existing(value) => value,
            ExistingOrNew::New(value) => value,
        }
    }

    /// Checks if the value was inserted by the call that returned this.
    pub fn is_new(&self) -> bool {
        match self {
            ExistingOrNew::Existing(_) => false,
            ExistingOrNew::New(_) => true,
        }
    }

    /// Transforms the inner value while keeping the existing/new distinction.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> ExistingOrNew<U> {
        match self {
            ExistingOrNew::Existing(value) => ExistingOrNew::Existing(f(value)),
            ExistingOrNew::New(value) => ExistingOrNew::New(f(value)),
        }
    }
}

impl<T> Deref for ExistingOrNew<T> {
    type Target = T;
    fn deref(&self) -> &T {
        match self {
            ExistingOrNew::Existing(value) => value,
            ExistingOrNew::New(value) => value,
        }
    }
}
