//! Crate-level tests that don't belong to any single module.
