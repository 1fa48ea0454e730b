//! Pluggable persistence for atom stores.
//!
//! [`AtomStorage`] is the abstract backend interface; [`MemoryStorage`]
//! is the in-memory reference implementation.

mod memory;
mod traits;

pub use memory::MemoryStorage;
pub use traits::{AtomStorage, StorageError};
