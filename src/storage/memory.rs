//! In-memory storage backend.
//!
//! Thread-safe in-memory implementation of [`AtomStorage`], intended for
//! embedded usage, tests, and as a reference for persistent backends.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::atom::{Atom, Handle};
use crate::error::SpaceError;
use crate::space::AtomSpace;
use crate::storage::traits::{AtomStorage, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError {
        reason: format!("poisoned lock: {context}"),
    }
}

fn space_err(error: SpaceError) -> StorageError {
    StorageError::BackendError {
        reason: error.to_string(),
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    atoms: HashMap<Handle, Atom>,
    open: bool,
}

impl MemoryState {
    fn ensure_open(&self, context: &'static str) -> Result<(), StorageError> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::ConnectionError {
                reason: format!("storage is not open ({context})"),
            })
        }
    }
}

/// Thread-safe in-memory atom store.
///
/// Created closed; [`AtomStorage::open`] must run before any operation.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of atoms currently stored.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the state lock is poisoned.
    pub fn atom_count(&self) -> Result<usize, StorageError> {
        Ok(self.read("atom_count")?.atoms.len())
    }

    fn read(
        &self,
        context: &'static str,
    ) -> Result<RwLockReadGuard<'_, MemoryState>, StorageError> {
        self.state.read().map_err(|_| lock_err(context))
    }

    fn write(
        &self,
        context: &'static str,
    ) -> Result<RwLockWriteGuard<'_, MemoryState>, StorageError> {
        self.state.write().map_err(|_| lock_err(context))
    }
}

impl AtomStorage for MemoryStorage {
    fn open(&self) -> Result<(), StorageError> {
        self.write("open")?.open = true;
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.write("close")?.open = false;
        Ok(())
    }

    fn store_atom(&self, atom: &Atom) -> Result<(), StorageError> {
        let mut state = self.write("store_atom")?;
        state.ensure_open("store_atom")?;
        state.atoms.insert(atom.handle(), atom.clone());
        Ok(())
    }

    fn fetch_atom(&self, handle: &Handle) -> Result<Option<Atom>, StorageError> {
        let state = self.read("fetch_atom")?;
        state.ensure_open("fetch_atom")?;
        Ok(state.atoms.get(handle).cloned())
    }

    fn remove_atom(&self, handle: &Handle) -> Result<(), StorageError> {
        let mut state = self.write("remove_atom")?;
        state.ensure_open("remove_atom")?;
        match state.atoms.remove(handle) {
            Some(_) => Ok(()),
            None => Err(StorageError::AtomNotFound { handle: *handle }),
        }
    }

    fn store_atomspace(&self, space: &AtomSpace) -> Result<usize, StorageError> {
        let atoms = space.export_atoms().map_err(space_err)?;
        let mut state = self.write("store_atomspace")?;
        state.ensure_open("store_atomspace")?;
        for atom in &atoms {
            state.atoms.insert(atom.handle(), atom.clone());
        }
        Ok(atoms.len())
    }

    fn load_atomspace(&self, space: &AtomSpace) -> Result<usize, StorageError> {
        let mut pending: Vec<Atom> = {
            let state = self.read("load_atomspace")?;
            state.ensure_open("load_atomspace")?;
            state.atoms.values().cloned().collect()
        };
        // Deterministic replay order; links may still precede their
        // children here, the deferral passes below fix that up.
        pending.sort_by_key(Atom::handle);

        let mut loaded = 0usize;
        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for atom in pending {
                match space.add_atom(atom.clone()) {
                    Ok(_) => loaded += 1,
                    Err(SpaceError::MissingChild { .. }) => deferred.push(atom),
                    Err(e) => return Err(space_err(e)),
                }
            }
            pending = deferred;
            if pending.len() == before {
                return Err(StorageError::BackendError {
                    reason: format!(
                        "{} links reference children missing from storage",
                        pending.len()
                    ),
                });
            }
        }
        Ok(loaded)
    }
}
