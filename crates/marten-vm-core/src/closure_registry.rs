//! The closure registry: the process-wide table mapping closure identities
//! to their entries.
//!
//! The table is a hash map guarded by a single reader/writer lock tuned for
//! a frequent-read, rare-write pattern. The lock protects table *shape*
//! only: `upsert` and an erasing `release` take it exclusively, while
//! `lookup`, enumeration and the purge-prepare scan share it. The purge
//! scan mutates entry address fields in place under the shared lock, which
//! is sound because those fields are barrier-ordered atomics, not because
//! the lock grants exclusive access (see [`crate::closure`]).
//!
//! # Purge protocol
//!
//! When a module's code is about to be unmapped, the unload subsystem runs
//! a three-phase handshake:
//!
//! 1. [`begin_purge`](ClosureRegistry::begin_purge) retargets every entry
//!    pointing into the doomed region at the unloaded stub, saving the old
//!    address, and returns the affected batch.
//! 2. If the unload is cancelled: [`abort_purge`](ClosureRegistry::abort_purge)
//!    restores the saved addresses, then
//!    [`finalize_abort`](ClosureRegistry::finalize_abort) clears the
//!    in-flight markers.
//! 3. Otherwise [`complete_purge`](ClosureRegistry::complete_purge) clears
//!    the markers and drops the reference that stood for "the code exists",
//!    erasing entries that nothing else refers to.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use marten_vm_code::{AtomTable, CodeRegion};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::closure::{ClosureEntry, ClosureId, Digest};
use crate::error::{InvariantViolation, ViolationKind, raise};

type Table = FxHashMap<ClosureId, Arc<ClosureEntry>>;

/// Entries collected by [`ClosureRegistry::begin_purge`], to be handed back
/// to exactly one of the abort or complete paths.
#[derive(Debug, Default)]
pub struct PurgeBatch {
    entries: SmallVec<[Arc<ClosureEntry>; 8]>,
}

impl PurgeBatch {
    pub fn entries(&self) -> &[Arc<ClosureEntry>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The identity → entry table. One instance per runtime, constructed at
/// startup and shared by the loader, the dispatcher's resolution path and
/// the unload subsystem.
#[derive(Default)]
pub struct ClosureRegistry {
    table: RwLock<Table>,
}

impl ClosureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or create the entry for `id`, refreshing its metadata and
    /// taking a reference to it.
    ///
    /// A created entry starts unresolved; the loader calls
    /// [`ClosureEntry::bind`] once the module's code is mapped.
    pub fn upsert(
        &self,
        id: ClosureId,
        legacy_index: u32,
        digest: Digest,
        arity: u32,
    ) -> Arc<ClosureEntry> {
        let mut table = self.table.write();
        let entry = table.entry(id).or_insert_with(|| {
            tracing::trace!(?id, "new closure entry");
            ClosureEntry::new(id)
        });
        entry.set_meta(legacy_index, digest, arity);
        entry.claim();
        Arc::clone(entry)
    }

    /// Find the entry for `id`, taking a reference to it. Absence is a
    /// normal outcome; the caller decides whether it is an error.
    pub fn lookup(&self, id: &ClosureId) -> Option<Arc<ClosureEntry>> {
        let table = self.table.read();
        let entry = table.get(id)?;
        entry.claim();
        Some(Arc::clone(entry))
    }

    /// Drop one reference to `entry`. When the count reaches the
    /// no-referrers threshold the entry is erased from the table, unless
    /// it still points at loaded code, which is a fatal inconsistency.
    pub fn release(&self, entry: &ClosureEntry) {
        let post = entry.release_count();
        if post == 0 {
            self.erase(entry);
        } else if post < 0 {
            raise(InvariantViolation {
                id: *entry.id(),
                kind: ViolationKind::RefCountUnderflow,
            });
        }
    }

    /// Erase `entry` under the write lock.
    ///
    /// The count is decremented and tested *again* inside the lock: a
    /// lookup may have revived the entry between the threshold hit and the
    /// lock acquisition, in which case its bias-aware claim has already
    /// compensated for this second decrement.
    fn erase(&self, entry: &ClosureEntry) {
        let mut table = self.table.write();
        if entry.release_count() <= 0 {
            if entry.is_resolved() {
                raise(InvariantViolation {
                    id: *entry.id(),
                    kind: ViolationKind::EraseWhileLoaded,
                });
            }
            tracing::debug!(id = ?entry.id(), "erasing closure entry");
            table.remove(entry.id());
        }
    }

    /// Number of entries in the table.
    pub fn count(&self) -> usize {
        self.table.read().len()
    }

    /// Read-only enumeration in unspecified order. The visitor may mutate
    /// the visited entry's atomic fields in place, never table shape.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<ClosureEntry>),
    {
        let table = self.table.read();
        for entry in table.values() {
            visitor(entry);
        }
    }

    /// Prepare to unload `region`: retarget every entry whose address lies
    /// inside it at the unloaded stub and collect it into the returned
    /// batch. Concurrent readers observe either the old address or the
    /// stub, never a torn value.
    pub fn begin_purge(&self, region: &CodeRegion) -> PurgeBatch {
        let mut batch = PurgeBatch::default();
        let table = self.table.read();
        for entry in table.values() {
            if entry.begin_purge_if_in(region) {
                batch.entries.push(Arc::clone(entry));
            }
        }
        tracing::debug!(affected = batch.len(), "closure purge prepared");
        batch
    }

    /// Roll back a prepared purge: restore the saved address of every entry
    /// in the batch that is still retargeted at the stub. The in-flight
    /// markers stay set until [`Self::finalize_abort`].
    pub fn abort_purge(&self, batch: &PurgeBatch) {
        for entry in &batch.entries {
            entry.abort_pending();
        }
    }

    /// Second half of the rollback: clear the in-flight markers.
    pub fn finalize_abort(&self, batch: PurgeBatch) {
        for entry in &batch.entries {
            entry.clear_pending();
        }
    }

    /// Commit a prepared purge: clear the in-flight markers and release the
    /// reference that stood for "the code exists". Entries that remain
    /// referenced survive, unresolved, for a future upsert to re-bind;
    /// the rest are erased before the caller unmaps the region.
    pub fn complete_purge(&self, batch: PurgeBatch) {
        for entry in &batch.entries {
            entry.clear_pending();
            let post = entry.release_count();
            if post == 0 {
                self.erase(entry);
            } else if post < 0 {
                raise(InvariantViolation {
                    id: *entry.id(),
                    kind: ViolationKind::RefCountUnderflow,
                });
            }
        }
        // All erasures must be visible before the unload proceeds.
        fence(Ordering::SeqCst);
        tracing::debug!(purged = batch.len(), "closure purge completed");
    }

    /// Write one record per entry to `out`, sorted by identity so the
    /// output is deterministic.
    pub fn dump(&self, atoms: &AtomTable, out: &mut dyn fmt::Write) -> fmt::Result {
        let table = self.table.read();
        dump_table(&table, atoms, out)
    }

    /// Lock-free variant of [`Self::dump`] for crash dumps.
    ///
    /// # Safety
    ///
    /// Sound only in the crash-dump pass where every other thread has been
    /// stopped: the table is read without taking the lock, so a concurrent
    /// writer would be a data race.
    pub unsafe fn dump_crash_dump(&self, atoms: &AtomTable, out: &mut dyn fmt::Write) -> fmt::Result {
        // SAFETY: caller guarantees no other thread is running.
        let table = unsafe { &*self.table.data_ptr() };
        dump_table(table, atoms, out)
    }

    /// Lock-free variant of [`Self::count`] for crash dumps.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::dump_crash_dump`].
    pub unsafe fn count_crash_dump(&self) -> usize {
        // SAFETY: caller guarantees no other thread is running.
        unsafe { &*self.table.data_ptr() }.len()
    }
}

fn dump_table(table: &Table, atoms: &AtomTable, out: &mut dyn fmt::Write) -> fmt::Result {
    let mut entries: Vec<&Arc<ClosureEntry>> = table.values().collect();
    entries.sort_by_key(|e| (e.id().module, e.id().index, e.id().hash));

    for entry in entries {
        let id = entry.id();
        writeln!(out, "=closure")?;
        match atoms.resolve(id.module) {
            Some(name) => writeln!(out, "Module: {name}")?,
            None => writeln!(out, "Module: #atom{}", id.module.index())?,
        }
        writeln!(out, "Uniq: {}", id.hash)?;
        writeln!(out, "Index: {}", entry.legacy_index())?;
        write!(out, "Digest: ")?;
        for byte in entry.digest() {
            write!(out, "{byte:02x}")?;
        }
        writeln!(out)?;
        writeln!(out, "Address: {}", entry.address())?;
        writeln!(out, "Refc: {}", entry.ref_count())?;
    }
    Ok(())
}
