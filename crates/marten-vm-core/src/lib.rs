//! # Marten VM Core
//!
//! Core runtime state shared by the loader, the dispatcher and the
//! hot-code-unload subsystem. The centerpiece is the closure registry: a
//! process-wide, concurrently-accessed table mapping a closure's identity
//! (defining module, content hash, declaration index) to the mutable record
//! holding its current entry point, reference count and in-flight purge
//! state.
//!
//! ## Concurrency model
//!
//! There is no per-entry lock. Correctness rests on three pieces working
//! together:
//!
//! - a table-wide reader/writer lock protecting table *shape* only,
//! - an atomic, biased reference count closing the creation/first-use race
//!   (see [`closure`]),
//! - barrier-ordered stores of the entry address fields, so the purge scan
//!   can retarget entries in place under the shared lock while other
//!   threads resolve them (see [`closure_registry`]).

pub mod closure;
pub mod closure_registry;
pub mod error;

pub use closure::{ClosureEntry, ClosureId, DIGEST_LEN, Digest};
pub use closure_registry::{ClosureRegistry, PurgeBatch};
pub use error::{InvariantViolation, ViolationKind};
