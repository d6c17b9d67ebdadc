//! # Marten VM Code
//!
//! Leaf crate shared by the loader and the runtime core:
//!
//! - Interned module symbols ([`Atom`], [`AtomTable`]) with cheap equality
//!   and hashing, so module names can be used as map keys everywhere.
//! - Code addresses and mapped-code regions ([`CodeAddress`], [`CodeRegion`]),
//!   including the distinguished "unloaded" sentinel address.

pub mod atom;
pub mod code;

pub use atom::{Atom, AtomTable};
pub use code::{CodeAddress, CodeRegion};
