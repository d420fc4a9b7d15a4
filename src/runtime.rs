//! What the walker needs to know about the runtime it is walking.
//!
//! Method descriptions, constant pools and the bytecode mappers live in the
//! runtime's own data structures, whose layout changes between runtime
//! versions. A [`Runtime`] implementation translates them.

use alloc::{string::String, vec::Vec};

use crate::{
    error::{FatalWalkError, LocalizedSlotError},
    Addr,
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Modifiers: u32 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
    }
}

/// A method as far as the walker cares.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodInfo {
    pub name: String,
    /// Descriptor, e.g. `(ILjava/lang/String;J)V`.
    pub signature: String,
    pub modifiers: Modifiers,
    /// Argument slots, including the receiver and both halves of longs and
    /// doubles.
    pub arg_count: usize,
    /// Temps beyond the arguments.
    pub temp_count: usize,
    /// Address of the first bytecode.
    pub bytecodes: Addr,
    pub constant_pool: Addr,
    /// The slot holding the declaring class's object.
    pub class_object_slot: Addr,
    /// `java.lang.Object.<init>` with a body keeps a hidden copy of the
    /// receiver below its temps.
    pub non_empty_object_constructor: bool,
}

impl MethodInfo {
    pub fn is_static(&self) -> bool {
        self.modifiers.contains(Modifiers::STATIC)
    }

    pub fn is_synchronized(&self) -> bool {
        self.modifiers.contains(Modifiers::SYNCHRONIZED)
    }

    /// Frames with a hidden slot below the temps.
    pub fn has_hidden_slot(&self) -> bool {
        self.is_synchronized() || self.non_empty_object_constructor
    }
}

pub use crate::config::LocalMapper;

/// The runtime's data model.
pub trait Runtime {
    /// The compiled-method metadata covering `pc`, if `pc` is compiled code.
    fn metadata_for_pc(&self, pc: Addr) -> Option<Addr>;

    fn method(&self, method: Addr) -> Result<MethodInfo, FatalWalkError>;

    /// The signature of the method referenced by a constant pool entry.
    fn resolved_method_signature(&self, constant_pool: Addr, index: u64) -> Result<String, FatalWalkError>;

    /// The method an interface-lookup resolve is dispatching, given the
    /// address of its (interface class, itable slot) pair.
    fn interface_method(&self, interface_and_slot: Addr) -> Result<Addr, FatalWalkError>;

    /// One bit per local, least significant bit first, set for locals that
    /// hold a live reference at `pc_offset`.
    fn local_map(
        &self,
        method: Addr,
        pc_offset: u64,
        locals: usize,
        mapper: LocalMapper,
    ) -> Result<Vec<u32>, LocalizedSlotError>;

    /// Same encoding as [`Runtime::local_map`], for the operand stack.
    fn pending_stack_map(&self, method: Addr, pc_offset: u64, pushes: usize) -> Result<Vec<u32>, LocalizedSlotError>;

    /// Addresses of the reference fields of an object allocated on the stack.
    fn object_fields(&self, object: Addr) -> Result<Vec<Addr>, LocalizedSlotError>;
}

/// The saved state of the thread being walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalkThread {
    /// Identity of the thread, passed through to callbacks.
    pub thread: Addr,
    pub sp: Addr,
    pub arg0_ea: Addr,
    pub pc: Addr,
    /// Where `pc` was saved.
    pub pc_address: Addr,
    pub literals: Addr,
    pub entry_local_storage: Addr,
    pub j2i_frame: Addr,
    pub decompilation_stack: Addr,
    /// The runtime already found this stack corrupt.
    pub stack_corrupt: bool,
    /// An OS thread is attached whose registers the memory view can read.
    pub has_os_thread: bool,
}

/// Where to start a walk, replacing the thread's saved state. Used to resume
/// a walk at a frame found earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalkStart {
    pub sp: Addr,
    pub arg0_ea: Addr,
    pub pc: Addr,
    pub literals: Addr,
    pub entry_local_storage: Addr,
}
