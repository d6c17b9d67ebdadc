//! Code addresses and mapped-code regions.
//!
//! A [`CodeAddress`] names an entry point inside code the loader has mapped.
//! Address `0` is never produced for mapped code, and [`CodeAddress::UNLOADED`]
//! is a distinguished stub that no region ever contains: a closure whose
//! entry point is the stub has no code loaded for it, and the dispatcher
//! raises an illegal-arity fault instead of jumping through it.

/// An entry point inside mapped code, or the unloaded stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeAddress(usize);

impl CodeAddress {
    /// Sentinel entry point for closures with no loaded code. Invoking it
    /// deterministically fails with an illegal-arity fault; it never lies
    /// inside any [`CodeRegion`].
    pub const UNLOADED: CodeAddress = CodeAddress(usize::MAX);

    pub fn new(raw: usize) -> Self {
        debug_assert!(raw != 0, "mapped code never sits at address zero");
        CodeAddress(raw)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }

    /// True iff this is a real entry point rather than the unloaded stub.
    pub fn is_loaded(self) -> bool {
        self != Self::UNLOADED
    }
}

impl std::fmt::Display for CodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_loaded() {
            write!(f, "{:#x}", self.0)
        } else {
            f.write_str("unloaded")
        }
    }
}

/// A half-open `[start, start + len)` span of mapped code, as reported by
/// the module loader for one module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRegion {
    start: usize,
    len: usize,
}

impl CodeRegion {
    pub fn new(start: usize, len: usize) -> Self {
        debug_assert!(start != 0);
        debug_assert!(start.checked_add(len).is_some());
        CodeRegion { start, len }
    }

    pub fn start(&self) -> CodeAddress {
        CodeAddress(self.start)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Containment test used by the purge scan: does `addr` point into this
    /// module's code? The unloaded stub is outside every region.
    pub fn contains(&self, addr: CodeAddress) -> bool {
        addr.0.wrapping_sub(self.start) < self.len
    }
}
