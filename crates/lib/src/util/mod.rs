//! Shared utilities.
//!
//! Hashing for content addressing, and filesystem helpers for moving snapshot trees around.

pub mod fs;
pub mod hash;
