//! Interned module symbols.
//!
//! Module names are interned once and referred to by a small copyable id
//! from then on. Equality and hashing on [`Atom`] are integer operations,
//! which is what makes atoms usable as part of hot map keys (the closure
//! registry hashes one per lookup).

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// An interned symbol. Cheap to copy, compare and hash.
///
/// Atoms are only meaningful relative to the [`AtomTable`] that produced
/// them; resolving an atom from a different table yields garbage or `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Atom(u32);

impl Atom {
    /// Raw index, for diagnostics output.
    pub fn index(self) -> u32 {
        self.0
    }
}

#[derive(Default)]
struct AtomTableState {
    by_name: FxHashMap<Arc<str>, Atom>,
    names: Vec<Arc<str>>,
}

/// Process-wide symbol interner.
///
/// Reads (resolution) take the lock shared; interning a new name takes it
/// exclusive. Interning is idempotent: the same name always yields the
/// same atom.
#[derive(Default)]
pub struct AtomTable {
    state: RwLock<AtomTableState>,
}

impl AtomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `name`, returning its atom. Existing names are found under
    /// the shared lock; only genuinely new names take the exclusive lock.
    pub fn intern(&self, name: &str) -> Atom {
        if let Some(&atom) = self.state.read().by_name.get(name) {
            return atom;
        }

        let mut state = self.state.write();
        // Re-check: another thread may have interned it between locks.
        if let Some(&atom) = state.by_name.get(name) {
            return atom;
        }

        let atom = Atom(state.names.len() as u32);
        let name: Arc<str> = Arc::from(name);
        state.names.push(Arc::clone(&name));
        state.by_name.insert(name, atom);
        atom
    }

    /// Resolve an atom back to its name.
    pub fn resolve(&self, atom: Atom) -> Option<Arc<str>> {
        self.state.read().names.get(atom.0 as usize).cloned()
    }

    /// Number of interned symbols.
    pub fn len(&self) -> usize {
        self.state.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
