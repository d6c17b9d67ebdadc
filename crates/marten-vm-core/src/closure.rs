//! Closure identities and entries.
//!
//! A [`ClosureId`] names a closure for the lifetime of the program; a
//! [`ClosureEntry`] is the single mutable record bound to that identity,
//! holding its current entry point, purge state and reference count.
//!
//! Entries have no lock of their own. The registry's table lock protects
//! table *shape* only; the entry fields that are mutated while readers are
//! active (`address`, `pending_purge`, `refs`) are atomics with explicit
//! ordering, and the remaining metadata is only written under the table's
//! write lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering, fence};

use marten_vm_code::{Atom, CodeAddress, CodeRegion};
use parking_lot::Mutex;

/// Length in bytes of a closure's content digest.
pub const DIGEST_LEN: usize = 16;

/// Fixed-size opaque digest distinguishing closures that otherwise share
/// a module and declaration index.
pub type Digest = [u8; DIGEST_LEN];

/// The identity of a closure: defining module, content hash of the closure
/// body, and declaration index within the module.
///
/// The *legacy* index is deliberately not part of identity: multiple
/// declarations that share a compiled wrapper may alias on it, while the
/// declaration index is guaranteed distinct for code the loader accepts.
/// The legacy fields survive on the entry for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClosureId {
    /// Defining module symbol.
    pub module: Atom,
    /// Hash of the closure body, stable across loads of identical code.
    pub hash: u64,
    /// Declaration index within the defining module.
    pub index: u32,
}

/// Metadata refreshed on every upsert. Written only under the registry's
/// write lock; read under the read lock, so the uncontended mutex here is
/// just Rust's proof of that discipline.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClosureMeta {
    pub(crate) legacy_index: u32,
    pub(crate) digest: Digest,
    pub(crate) arity: u32,
}

/// Fresh entries start below the no-referrers threshold. See
/// [`ClosureEntry::claim`] for the full convention.
pub(crate) const REFC_BIAS: i64 = -1;

/// `pending_purge` value meaning "no purge in flight". Mapped code never
/// sits at address zero.
const PENDING_NONE: usize = 0;

/// The mutable record bound to one closure identity.
///
/// Handed out as `Arc<ClosureEntry>`: the `Arc` keeps the allocation alive
/// across any misuse, while the explicit [`refs`](Self::ref_count) counter
/// governs *table membership*: an entry is erased from the registry only
/// when its count reaches the no-referrers threshold while unresolved.
pub struct ClosureEntry {
    id: ClosureId,
    meta: Mutex<ClosureMeta>,
    /// Current entry point, or [`CodeAddress::UNLOADED`].
    address: AtomicUsize,
    /// Previous entry point while a purge is tentatively in flight.
    pending_purge: AtomicUsize,
    /// Biased reference count; see [`Self::claim`].
    refs: AtomicI64,
}

impl ClosureEntry {
    pub(crate) fn new(id: ClosureId) -> Arc<Self> {
        Arc::new(Self {
            id,
            meta: Mutex::new(ClosureMeta {
                legacy_index: 0,
                digest: [0; DIGEST_LEN],
                arity: 0,
            }),
            address: AtomicUsize::new(CodeAddress::UNLOADED.as_usize()),
            pending_purge: AtomicUsize::new(PENDING_NONE),
            refs: AtomicI64::new(REFC_BIAS),
        })
    }

    pub fn id(&self) -> &ClosureId {
        &self.id
    }

    pub fn module(&self) -> Atom {
        self.id.module
    }

    /// Display-only index inherited from older compiled forms.
    pub fn legacy_index(&self) -> u32 {
        self.meta.lock().legacy_index
    }

    pub fn digest(&self) -> Digest {
        self.meta.lock().digest
    }

    pub fn arity(&self) -> u32 {
        self.meta.lock().arity
    }

    pub(crate) fn set_meta(&self, legacy_index: u32, digest: Digest, arity: u32) {
        *self.meta.lock() = ClosureMeta {
            legacy_index,
            digest,
            arity,
        };
    }

    /// The currently callable entry point, or the unloaded stub.
    pub fn address(&self) -> CodeAddress {
        CodeAddress::new(self.address.load(Ordering::Acquire))
    }

    /// True iff code is currently loaded for this closure.
    pub fn is_resolved(&self) -> bool {
        self.address().is_loaded()
    }

    /// The address saved by an in-flight purge, if any.
    pub fn pending_purge_address(&self) -> Option<CodeAddress> {
        match self.pending_purge.load(Ordering::Acquire) {
            PENDING_NONE => None,
            raw => Some(CodeAddress::new(raw)),
        }
    }

    /// Loader hook: store the real entry point once the module's code is
    /// mapped. Release-ordered so the code is published before the address.
    pub fn bind(&self, addr: CodeAddress) {
        debug_assert!(addr.is_loaded());
        self.address.store(addr.as_usize(), Ordering::Release);
    }

    /// Current reference count. Diagnostics only; stale by the time the
    /// caller looks at it.
    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    /// Take a reference to this entry, bias-aware.
    ///
    /// Fresh entries start at [`REFC_BIAS`] rather than zero, and an entry
    /// whose count has just hit the threshold sits at zero while its erase
    /// is still pending the write lock. Both states are "not (yet) claimed":
    /// if the post-increment value is still below 2, one *additional*
    /// increment is performed. The extra increment either lifts a fresh
    /// entry to a logical count of 1, or pre-compensates the second
    /// decrement that the pending erase will apply when it re-checks under
    /// the lock. A naive "compare to zero, then set to one" would let two
    /// threads both conclude they are the sole owner; the unconditional
    /// fetch-add makes exactly one claimant see each intermediate value.
    ///
    /// Callers must hold the table lock (shared is enough) so that the
    /// double-increment cannot interleave with an erase's locked re-check.
    pub(crate) fn claim(&self) {
        let post = self.refs.fetch_add(1, Ordering::AcqRel) + 1;
        if post < 2 {
            self.refs.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Drop one reference, returning the post-decrement count.
    pub(crate) fn release_count(&self) -> i64 {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Purge scan step: if the current entry point lies in `region`, save
    /// it and retarget the entry to the unloaded stub. Returns whether the
    /// entry joined the purge batch.
    ///
    /// Runs under the *shared* table lock. The release fence orders the
    /// saved-address store before the sentinel store: a concurrent reader
    /// that observes the sentinel must not be handed an address into memory
    /// that is about to be reclaimed, and a reader that observes the old
    /// address is still safe because the region is not unmapped until the
    /// purge completes.
    pub(crate) fn begin_purge_if_in(&self, region: &CodeRegion) -> bool {
        let addr = self.address();
        if !region.contains(addr) {
            return false;
        }
        self.pending_purge.store(addr.as_usize(), Ordering::Relaxed);
        fence(Ordering::Release);
        self.address.store(CodeAddress::UNLOADED.as_usize(), Ordering::Release);
        true
    }

    /// Abort step: restore the saved entry point, but only if the entry is
    /// still retargeted at the stub (a concurrent upsert may have re-bound
    /// it in the meantime).
    pub(crate) fn abort_pending(&self) {
        if self.address.load(Ordering::Acquire) == CodeAddress::UNLOADED.as_usize() {
            let saved = self.pending_purge.load(Ordering::Acquire);
            self.address.store(saved, Ordering::Release);
        }
    }

    /// Clear the in-flight purge marker. Kept separate from
    /// [`Self::abort_pending`] so rollback has a window where the entry is
    /// live again but still flagged as not-yet-updated.
    pub(crate) fn clear_pending(&self) {
        self.pending_purge.store(PENDING_NONE, Ordering::Release);
    }
}

impl std::fmt::Debug for ClosureEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureEntry")
            .field("id", &self.id)
            .field("address", &self.address())
            .field("pending_purge", &self.pending_purge_address())
            .field("refs", &self.ref_count())
            .finish()
    }
}
