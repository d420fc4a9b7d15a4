//! Error taxonomy of a walk.
//!
//! Only [`WalkError`] ever reaches the caller. A [`LocalizedSlotError`] is
//! confined to slot iteration and handed to the corruption governor, which
//! decides whether the walk keeps looking at slots.

use alloc::string::String;

use crate::{memory::MemoryError, Addr};

pub type Result<T, E = WalkError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalkError {
    /// The stack or metadata is broken beyond recovery. The walk ends with
    /// `STACK_CORRUPT`; callbacks keep whatever they already saw.
    #[error(transparent)]
    Fatal(#[from] FatalWalkError),
    /// The options ask for something that cannot work. Raised before any
    /// frame is touched.
    #[error("unsupported walk configuration: {0}")]
    UnsupportedConfiguration(&'static str),
    #[error("unsupported platform: {0}")]
    PlatformUnsupported(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalWalkError {
    #[error("unable to read a required field")]
    UnreadableField(#[from] MemoryError),
    #[error("invalid JIT return address {0:?}")]
    InvalidReturnAddress(Addr),
    #[error("bytecode frame at {pc:?} has no method")]
    MissingMethod { pc: Addr },
    #[error("unable to locate JIT stack map for pc {pc:?}")]
    MissingStackMap { pc: Addr },
    #[error("compiled frame at {pc:?} has no metadata")]
    MissingMetadata { pc: Addr },
    #[error("broken decompilation chain at {0:?}")]
    BrokenDecompilationChain(Addr),
    #[error("{what}: {value}")]
    Malformed { what: &'static str, value: u64 },
}

/// A failure confined to the slots of one frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocalizedSlotError {
    #[error("unreadable slot data")]
    Memory(#[from] MemoryError),
    #[error("malformed {what}: {value}")]
    Malformed { what: &'static str, value: u64 },
    #[error(transparent)]
    Structural(FatalWalkError),
}

impl From<FatalWalkError> for LocalizedSlotError {
    fn from(err: FatalWalkError) -> Self {
        match err {
            FatalWalkError::UnreadableField(mem) => LocalizedSlotError::Memory(mem),
            other => LocalizedSlotError::Structural(other),
        }
    }
}

impl From<MemoryError> for WalkError {
    fn from(err: MemoryError) -> Self {
        WalkError::Fatal(FatalWalkError::UnreadableField(err))
    }
}
