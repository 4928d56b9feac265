//! rdc-util - Foundation types for the rdc decompiler
//!
//! Provides the small vocabulary every other crate builds on: machine
//! addresses, typed index vectors, and interned symbols. None of these
//! types know anything about IR or passes.

pub mod addr;
pub mod index_vec;
pub mod interner;

pub use addr::Address;
pub use index_vec::{Idx, IndexVec};
pub use interner::Symbol;

// Re-export commonly used hash collections
pub use rustc_hash::FxHashMap;
pub use rustc_hash::FxHashSet;
