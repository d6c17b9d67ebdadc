//! Registry error types.
//!
//! The closure registry has no recoverable error paths of its own: a lookup
//! miss is an ordinary `None`, and an unresolved entry point is a fault for
//! the dispatcher to raise. What remains are broken internal invariants,
//! which indicate a use-after-free class bug and must terminate the process
//! rather than limp on. They are raised as a typed panic so a test harness
//! can catch and inspect them without dying itself.

use marten_vm_code::Atom;
use thiserror::Error;

use crate::closure::ClosureId;

/// Which registry invariant was broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ViolationKind {
    /// The reference count hit the no-referrers threshold while the entry
    /// still pointed at loaded code.
    #[error("about to erase a closure still referred to by loaded code")]
    EraseWhileLoaded,

    /// A reference was released that was never held.
    #[error("reference count underflow")]
    RefCountUnderflow,
}

/// A fatal internal-consistency violation, identifying the offending
/// closure. Carried as the panic payload by [`raise`].
#[derive(Debug, Clone, Error)]
#[error("invalid state on closure {:?}.{}.{:#x}: {}", .id.module, .id.index, .id.hash, .kind)]
pub struct InvariantViolation {
    /// Identity of the closure whose state is inconsistent.
    pub id: ClosureId,
    pub kind: ViolationKind,
}

impl InvariantViolation {
    /// Module part of the offending identity.
    pub fn module(&self) -> Atom {
        self.id.module
    }
}

/// Terminate on a broken invariant. Continuing would risk dereferencing
/// freed code, so there is no recovery path.
pub(crate) fn raise(violation: InvariantViolation) -> ! {
    tracing::error!(%violation, "closure registry internal inconsistency");
    std::panic::panic_any(violation)
}
