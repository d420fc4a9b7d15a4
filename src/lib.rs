//! A stack walker for a managed runtime's diagnostic tooling.
//!
//! Given the saved state of a runtime thread and read access to its stack
//! and the compiled-code metadata, [`walk::walk_stack`] rebuilds the logical
//! call chain (interpreted frames, compiled frames, inlined methods and the
//! transition frames between them) and hands every frame and every
//! GC-relevant slot to a [`report::WalkCallbacks`] implementation.
//!
//! Nothing in here owns the memory it looks at. All reads go through a
//! [`memory::MemoryView`], so the same walker works over a live process or a
//! post-mortem snapshot.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate tracing;

use core::fmt;

#[cfg(target_os = "linux")]
mod stdext;

pub mod arch;
pub mod config;
pub mod error;
pub mod flags;
mod governor;
pub mod layout;
pub mod memory;
pub mod metadata;
pub mod report;
pub mod runtime;
mod signature;
mod spill;
pub mod walk;

#[cfg(test)]
mod testing;

pub use config::WalkerConfig;
pub use error::{Result, WalkError};
pub use flags::WalkFlags;
pub use walk::{walk_stack, WalkOptions, WalkResult, WalkReturnCode};

/// An address in the target's address space.
///
/// The target may have a different word size from the host, so this is
/// always 64 bits wide and never dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Addr(pub u64);

impl Addr {
    pub const NULL: Addr = Addr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn byte_add(self, bytes: i64) -> Addr {
        Addr(self.0.wrapping_add_signed(bytes))
    }

    /// Clears the low tag bits.
    pub fn untag(self, bits: u64) -> Addr {
        Addr(self.0 & !bits)
    }

    /// Signed byte distance `self - other`.
    pub fn distance(self, other: Addr) -> i64 {
        self.0.wrapping_sub(other.0) as i64
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
