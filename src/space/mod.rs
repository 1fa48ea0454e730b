//! The atom space: a deduplicating, indexed hypergraph store.
//!
//! One space owns the canonical instance of every atom it holds. Inserts
//! are idempotent on content: adding an atom that already exists merges
//! truth values instead of duplicating the atom, so identical knowledge
//! arriving from many sources converges on a single handle. Links point
//! at canonical children by handle, and a child cannot be removed while
//! links still reference it.
//!
//! All mutation goes through one writer lock; events fire after the lock
//! is released, in mutation order.

mod events;

pub use events::{
    AtomEvent, EventKind, EventOrigin, ObserverRegistry, SpaceObserver,
    DEFAULT_SUBSCRIBER_CAPACITY,
};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crossbeam_channel::Receiver;

use crate::atom::{Atom, AtomType, Handle};
use crate::error::SpaceError;
use crate::truth::TruthValue;

fn lock_err(context: &'static str) -> SpaceError {
    SpaceError::LockPoisoned { context }
}

#[derive(Debug, Default)]
struct SpaceInner {
    atoms: HashMap<Handle, Atom>,
    by_type: HashMap<AtomType, HashSet<Handle>>,
    by_name: HashMap<String, HashSet<Handle>>,
    incoming: HashMap<Handle, HashSet<Handle>>,
    node_count: usize,
    link_count: usize,
}

impl SpaceInner {
    fn has_incoming(&self, handle: &Handle) -> bool {
        self.incoming.get(handle).is_some_and(|links| !links.is_empty())
    }
}

/// A deduplicating hypergraph store of truth-valued atoms.
///
/// # Examples
///
/// ```
/// use cogmesh::{Atom, AtomSpace, AtomType, TruthValue};
///
/// let space = AtomSpace::new();
/// let water = Atom::node_with_tv(
///     AtomType::Concept,
///     "water",
///     TruthValue::simple(0.9, 0.8).unwrap(),
/// )
/// .unwrap();
///
/// let canonical = space.add_atom(water).unwrap();
/// assert_eq!(space.atom_count().unwrap(), 1);
/// assert!(space.get_atom(&canonical.handle()).unwrap().is_some());
/// ```
#[derive(Debug, Default)]
pub struct AtomSpace {
    inner: RwLock<SpaceInner>,
    registry: ObserverRegistry,
}

impl AtomSpace {
    /// Creates an empty space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an atom originated by this process.
    ///
    /// See [`AtomSpace::add_atom_with_origin`].
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::MissingChild` if the atom is a link and any
    /// child is absent.
    pub fn add_atom(&self, atom: Atom) -> Result<Atom, SpaceError> {
        self.add_atom_with_origin(atom, EventOrigin::Local)
    }

    /// Inserts an atom, recording where the mutation came from.
    ///
    /// If an atom with the same content already exists, the truth values
    /// are merged in place and a `TruthValueChanged` event fires;
    /// otherwise the atom is indexed and `AtomAdded` fires. Either way
    /// the canonical atom is returned.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::MissingChild` if the atom is a link and any
    /// child is absent; links may only reference atoms the space already
    /// holds.
    pub fn add_atom_with_origin(
        &self,
        atom: Atom,
        origin: EventOrigin,
    ) -> Result<Atom, SpaceError> {
        let handle = atom.handle();

        let (event, canonical) = {
            let mut inner = self.inner.write().map_err(|_| lock_err("add_atom"))?;

            if let Some(existing) = inner.atoms.get_mut(&handle) {
                let merged = existing.tv().merge(atom.tv());
                existing.set_tv(merged);
                let canonical = existing.clone();
                (
                    AtomEvent::new(EventKind::TruthValueChanged, canonical.clone(), origin),
                    canonical,
                )
            } else {
                if let Some(outgoing) = atom.outgoing() {
                    for child in outgoing {
                        if !inner.atoms.contains_key(child) {
                            return Err(SpaceError::MissingChild { handle: *child });
                        }
                    }
                }

                inner
                    .by_type
                    .entry(atom.atom_type().clone())
                    .or_default()
                    .insert(handle);
                if let Some(name) = atom.name() {
                    inner.by_name.entry(name.to_string()).or_default().insert(handle);
                }
                match atom.outgoing() {
                    Some(outgoing) => {
                        for child in outgoing {
                            inner.incoming.entry(*child).or_default().insert(handle);
                        }
                        inner.link_count += 1;
                    }
                    None => inner.node_count += 1,
                }
                inner.atoms.insert(handle, atom.clone());

                (
                    AtomEvent::new(EventKind::AtomAdded, atom.clone(), origin),
                    atom,
                )
            }
        };

        self.registry.dispatch(&event);
        Ok(canonical)
    }

    /// Replaces an atom's truth value (no merge), locally originated.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::AtomNotFound` if no atom has this handle.
    pub fn set_truth_value(&self, handle: &Handle, tv: TruthValue) -> Result<Atom, SpaceError> {
        self.set_truth_value_with_origin(handle, tv, EventOrigin::Local)
    }

    /// Replaces an atom's truth value, recording the mutation origin.
    ///
    /// This is the overwrite path; use [`AtomSpace::add_atom`] when the
    /// new truth is additional evidence rather than a replacement.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::AtomNotFound` if no atom has this handle.
    pub fn set_truth_value_with_origin(
        &self,
        handle: &Handle,
        tv: TruthValue,
        origin: EventOrigin,
    ) -> Result<Atom, SpaceError> {
        let event = {
            let mut inner = self.inner.write().map_err(|_| lock_err("set_truth_value"))?;
            let atom = inner
                .atoms
                .get_mut(handle)
                .ok_or(SpaceError::AtomNotFound { handle: *handle })?;
            atom.set_tv(tv);
            AtomEvent::new(EventKind::TruthValueChanged, atom.clone(), origin)
        };

        let canonical = event.atom.clone();
        self.registry.dispatch(&event);
        Ok(canonical)
    }

    /// Removes an atom originated by this process.
    ///
    /// See [`AtomSpace::remove_atom_with_origin`].
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::LockPoisoned` only; refusals are `Ok(false)`.
    pub fn remove_atom(&self, handle: &Handle) -> Result<bool, SpaceError> {
        self.remove_atom_with_origin(handle, EventOrigin::Local)
    }

    /// Removes an atom, recording where the mutation came from.
    ///
    /// Returns `Ok(false)` without mutating anything when the atom is
    /// absent or when links still reference it; referential integrity is
    /// an expected outcome here, not an error. Returns `Ok(true)` and
    /// fires `AtomRemoved` on success.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::LockPoisoned` only.
    pub fn remove_atom_with_origin(
        &self,
        handle: &Handle,
        origin: EventOrigin,
    ) -> Result<bool, SpaceError> {
        let event = {
            let mut inner = self.inner.write().map_err(|_| lock_err("remove_atom"))?;

            if !inner.atoms.contains_key(handle) || inner.has_incoming(handle) {
                return Ok(false);
            }

            let Some(atom) = inner.atoms.remove(handle) else {
                return Ok(false);
            };

            if let Some(handles) = inner.by_type.get_mut(atom.atom_type()) {
                handles.remove(handle);
                if handles.is_empty() {
                    inner.by_type.remove(atom.atom_type());
                }
            }
            if let Some(name) = atom.name() {
                if let Some(handles) = inner.by_name.get_mut(name) {
                    handles.remove(handle);
                    if handles.is_empty() {
                        inner.by_name.remove(name);
                    }
                }
            }
            match atom.outgoing() {
                Some(outgoing) => {
                    for child in outgoing {
                        if let Some(links) = inner.incoming.get_mut(child) {
                            links.remove(handle);
                            if links.is_empty() {
                                inner.incoming.remove(child);
                            }
                        }
                    }
                    inner.link_count -= 1;
                }
                None => inner.node_count -= 1,
            }
            inner.incoming.remove(handle);

            AtomEvent::new(EventKind::AtomRemoved, atom, origin)
        };

        self.registry.dispatch(&event);
        Ok(true)
    }

    /// Fetches the canonical atom for a handle.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::LockPoisoned` if the space lock is poisoned.
    pub fn get_atom(&self, handle: &Handle) -> Result<Option<Atom>, SpaceError> {
        let inner = self.inner.read().map_err(|_| lock_err("get_atom"))?;
        Ok(inner.atoms.get(handle).cloned())
    }

    /// Returns true if the space holds an atom with this handle.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::LockPoisoned` if the space lock is poisoned.
    pub fn contains(&self, handle: &Handle) -> Result<bool, SpaceError> {
        let inner = self.inner.read().map_err(|_| lock_err("contains"))?;
        Ok(inner.atoms.contains_key(handle))
    }

    /// Every atom with the given type tag, in handle order.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::LockPoisoned` if the space lock is poisoned.
    pub fn get_atoms_by_type(&self, atom_type: &AtomType) -> Result<Vec<Atom>, SpaceError> {
        let inner = self.inner.read().map_err(|_| lock_err("get_atoms_by_type"))?;
        let mut atoms: Vec<Atom> = inner
            .by_type
            .get(atom_type)
            .into_iter()
            .flatten()
            .filter_map(|handle| inner.atoms.get(handle).cloned())
            .collect();
        atoms.sort_by_key(Atom::handle);
        Ok(atoms)
    }

    /// Every node with the given name, optionally restricted to a type,
    /// in handle order.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::LockPoisoned` if the space lock is poisoned.
    pub fn get_nodes_by_name(
        &self,
        name: &str,
        atom_type: Option<&AtomType>,
    ) -> Result<Vec<Atom>, SpaceError> {
        let inner = self.inner.read().map_err(|_| lock_err("get_nodes_by_name"))?;
        let mut atoms: Vec<Atom> = inner
            .by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|handle| inner.atoms.get(handle).cloned())
            .filter(|atom| atom_type.map_or(true, |t| atom.atom_type() == t))
            .collect();
        atoms.sort_by_key(Atom::handle);
        Ok(atoms)
    }

    /// Every link whose outgoing set references the handle, in handle
    /// order.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::LockPoisoned` if the space lock is poisoned.
    pub fn get_incoming(&self, handle: &Handle) -> Result<Vec<Atom>, SpaceError> {
        let inner = self.inner.read().map_err(|_| lock_err("get_incoming"))?;
        let mut atoms: Vec<Atom> = inner
            .incoming
            .get(handle)
            .into_iter()
            .flatten()
            .filter_map(|link| inner.atoms.get(link).cloned())
            .collect();
        atoms.sort_by_key(Atom::handle);
        Ok(atoms)
    }

    /// Total atom count.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::LockPoisoned` if the space lock is poisoned.
    pub fn atom_count(&self) -> Result<usize, SpaceError> {
        let inner = self.inner.read().map_err(|_| lock_err("atom_count"))?;
        Ok(inner.atoms.len())
    }

    /// Node count.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::LockPoisoned` if the space lock is poisoned.
    pub fn node_count(&self) -> Result<usize, SpaceError> {
        let inner = self.inner.read().map_err(|_| lock_err("node_count"))?;
        Ok(inner.node_count)
    }

    /// Link count.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::LockPoisoned` if the space lock is poisoned.
    pub fn link_count(&self) -> Result<usize, SpaceError> {
        let inner = self.inner.read().map_err(|_| lock_err("link_count"))?;
        Ok(inner.link_count)
    }

    /// Returns true if the space holds no atoms.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::LockPoisoned` if the space lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, SpaceError> {
        Ok(self.atom_count()? == 0)
    }

    /// Every atom, ordered so children precede the links that reference
    /// them: nodes first, then links by nesting depth. Feeding this
    /// sequence to [`AtomSpace::add_atom_with_origin`] on an empty space
    /// reproduces the population without `MissingChild` failures.
    ///
    /// # Errors
    ///
    /// Returns `SpaceError::LockPoisoned` if the space lock is poisoned.
    pub fn export_atoms(&self) -> Result<Vec<Atom>, SpaceError> {
        let inner = self.inner.read().map_err(|_| lock_err("export_atoms"))?;

        fn depth(
            handle: &Handle,
            atoms: &HashMap<Handle, Atom>,
            memo: &mut HashMap<Handle, usize>,
        ) -> usize {
            if let Some(&known) = memo.get(handle) {
                return known;
            }
            let value = match atoms.get(handle).and_then(Atom::outgoing) {
                // Handles are content-derived, so the reference graph is
                // acyclic and this recursion terminates.
                Some(outgoing) => {
                    1 + outgoing
                        .iter()
                        .map(|child| depth(child, atoms, memo))
                        .max()
                        .unwrap_or(0)
                }
                None => 0,
            };
            memo.insert(*handle, value);
            value
        }

        let mut memo = HashMap::new();
        let mut atoms: Vec<Atom> = inner.atoms.values().cloned().collect();
        atoms.sort_by_key(|atom| (depth(&atom.handle(), &inner.atoms, &mut memo), atom.handle()));
        Ok(atoms)
    }

    /// Registers a synchronous observer.
    pub fn register_observer(&self, observer: Arc<dyn SpaceObserver>) {
        self.registry.register(observer);
    }

    /// Opens an event subscription with the default buffer capacity.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<AtomEvent> {
        self.registry.subscribe()
    }

    /// Opens an event subscription with an explicit buffer capacity.
    #[must_use]
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Receiver<AtomEvent> {
        self.registry.subscribe_with_capacity(capacity)
    }

    /// Number of events dropped because a subscriber buffer was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.registry.dropped_events()
    }
}
