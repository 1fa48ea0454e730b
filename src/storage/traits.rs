//! Abstract persistence trait for atom stores.
//!
//! The cluster layer keeps spaces converged in memory; durability is a
//! backend concern behind [`AtomStorage`]. By using a trait, we enable:
//! - In-memory backends for testing and embedded use
//! - Persistent backends for production
//! - Distributed backends for scale

use thiserror::Error;

use crate::atom::{Atom, Handle};
use crate::space::AtomSpace;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Atom not found.
    #[error("Atom not found in storage: {handle}")]
    AtomNotFound {
        /// Handle that was requested.
        handle: Handle,
    },

    /// Backend error.
    #[error("Storage backend error: {reason}")]
    BackendError {
        /// What went wrong.
        reason: String,
    },

    /// Serialization failed.
    #[error("Serialization error: {reason}")]
    SerializationError {
        /// What failed to round-trip.
        reason: String,
    },

    /// Connection failed or the backend is not open.
    #[error("Connection error: {reason}")]
    ConnectionError {
        /// Why the backend is unreachable.
        reason: String,
    },
}

/// Storage backend for atoms and whole spaces.
///
/// Backends are opened before use and closed after; operations against a
/// closed backend fail with `ConnectionError`. Atom identity is the
/// content-derived handle, so storing the same atom twice overwrites in
/// place rather than duplicating.
///
/// # Safety Considerations
/// - All mutations should be atomic where possible
/// - Implementations should handle concurrent access safely
pub trait AtomStorage: Send + Sync {
    /// Opens the backend. Idempotent.
    fn open(&self) -> Result<(), StorageError>;

    /// Closes the backend, flushing anything buffered. Idempotent.
    fn close(&self) -> Result<(), StorageError>;

    /// Stores one atom, overwriting any previous version.
    fn store_atom(&self, atom: &Atom) -> Result<(), StorageError>;

    /// Fetches one atom by handle.
    fn fetch_atom(&self, handle: &Handle) -> Result<Option<Atom>, StorageError>;

    /// Removes one atom. Returns `AtomNotFound` if it was never stored.
    fn remove_atom(&self, handle: &Handle) -> Result<(), StorageError>;

    /// Persists every atom in the space. Returns the number stored.
    fn store_atomspace(&self, space: &AtomSpace) -> Result<usize, StorageError>;

    /// Replays every stored atom into the space, children before the
    /// links that reference them. Returns the number loaded.
    fn load_atomspace(&self, space: &AtomSpace) -> Result<usize, StorageError>;
}
