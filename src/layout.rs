//! Word layouts of the runtime's stack frames and the flag words they carry.
//!
//! Offsets are in target words relative to the start of each structure. The
//! interpreter builds frames downward, so a frame's "base" (`bp`) is the
//! address of its last word and `frame_start(bp, SIZE)` recovers the first.

use crate::{memory::Target, Addr};

/// Saved-PC values below `MAX_SPECIAL` name a special frame instead of a
/// return address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    EndOfStack,
    GenericSpecial,
    Method,
    NativeMethod,
    JitResolve,
    JitJniCallout,
    JniNativeMethod,
    MethodType,
    /// Reserved special value the runtime never builds.
    UnknownSpecial(u64),
    /// A real return address: a bytecoded frame or a call-in frame.
    ReturnAddress,
}

pub const END_OF_STACK: u64 = 0;
pub const GENERIC_SPECIAL: u64 = 1;
pub const METHOD: u64 = 2;
pub const NATIVE_METHOD: u64 = 3;
pub const JIT_RESOLVE: u64 = 5;
pub const JIT_JNI_CALLOUT: u64 = 6;
pub const JNI_NATIVE_METHOD: u64 = 7;
pub const METHODTYPE: u64 = 8;
pub const MAX_SPECIAL: u64 = 16;

impl FrameTag {
    pub fn classify(pc: Addr) -> FrameTag {
        match pc.0 {
            END_OF_STACK => FrameTag::EndOfStack,
            GENERIC_SPECIAL => FrameTag::GenericSpecial,
            METHOD => FrameTag::Method,
            NATIVE_METHOD => FrameTag::NativeMethod,
            JIT_RESOLVE => FrameTag::JitResolve,
            JIT_JNI_CALLOUT => FrameTag::JitJniCallout,
            JNI_NATIVE_METHOD => FrameTag::JniNativeMethod,
            METHODTYPE => FrameTag::MethodType,
            other if other <= MAX_SPECIAL => FrameTag::UnknownSpecial(other),
            _ => FrameTag::ReturnAddress,
        }
    }

    pub fn is_native(pc: Addr) -> bool {
        pc.0 == NATIVE_METHOD || pc.0 == JNI_NATIVE_METHOD
    }
}

/// Set in the saved A0 word of frames hidden from stack traces.
pub const A0_INVISIBLE_TAG: u64 = 2;

/// Frame flag words: special frame flags in the low half, the compiled-code
/// transition kind and sub-kind in the high half.
pub mod frame_flags {
    pub const JNI_PUSHED_REF_COUNT_MASK: u64 = 0xFFFF;
    pub const JIT_ARGS_ALIGNED: u64 = 0x0001_0000;
    pub const JNI_REFS_REDIRECTED: u64 = 0x0002_0000;
    pub const RETURNS_OBJECT: u64 = 0x0004_0000;
    pub const METHOD_ENTRY: u64 = 0x0008_0000;

    pub const JIT_RESOLVE_FRAME: u64 = 0x0010_0000;
    pub const JIT_JNI_CALL_OUT_FRAME: u64 = 0x0020_0000;
    pub const JIT_CALL_IN_FRAME: u64 = 0x0040_0000;
    pub const JIT_NATIVE_TRANSITION: u64 = 0x0080_0000;
    /// Any of these means the frame below was built by compiled code.
    pub const TRANSITION_TO_INTERPRETER_MASK: u64 = 0x00F0_0000;

    pub const SUB_TYPE_MASK: u64 = 0x1F00_0000;
    pub const SUB_TYPE_SHIFT: u32 = 24;

    pub const CALL_IN_TYPE_J2I: u64 = 1 << SUB_TYPE_SHIFT;

    /// Low tag bit of a saved return SP whose arguments were re-aligned.
    pub const ARGS_ALIGNED_TAG: u64 = 0x1;
}

/// The transition compiled code built when it called into a runtime helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveKind {
    Generic,
    StackOverflow,
    Data,
    RuntimeHelper,
    InterfaceLookup,
    InterfaceMethod,
    SpecialMethod,
    StaticMethod,
    VirtualMethod,
    Recompilation,
    MonitorEnter,
    MethodMonitorEnter,
    FailedMethodMonitorEnter,
    Allocation,
    BeforeAnewarray,
    BeforeMultianewarray,
    InduceOsr,
    ExceptionCatch,
    Unknown(u8),
}

impl ResolveKind {
    pub fn from_flags(flags: u64) -> ResolveKind {
        let sub_type = ((flags & frame_flags::SUB_TYPE_MASK) >> frame_flags::SUB_TYPE_SHIFT) as u8;
        match sub_type {
            0 => ResolveKind::Generic,
            1 => ResolveKind::StackOverflow,
            2 => ResolveKind::Data,
            3 => ResolveKind::RuntimeHelper,
            4 => ResolveKind::InterfaceLookup,
            5 => ResolveKind::InterfaceMethod,
            6 => ResolveKind::SpecialMethod,
            7 => ResolveKind::StaticMethod,
            8 => ResolveKind::VirtualMethod,
            9 => ResolveKind::Recompilation,
            10 => ResolveKind::MonitorEnter,
            11 => ResolveKind::MethodMonitorEnter,
            12 => ResolveKind::FailedMethodMonitorEnter,
            13 => ResolveKind::Allocation,
            14 => ResolveKind::BeforeAnewarray,
            15 => ResolveKind::BeforeMultianewarray,
            16 => ResolveKind::InduceOsr,
            17 => ResolveKind::ExceptionCatch,
            other => ResolveKind::Unknown(other),
        }
    }

    pub fn to_flags(self) -> u64 {
        let sub_type: u64 = match self {
            ResolveKind::Generic => 0,
            ResolveKind::StackOverflow => 1,
            ResolveKind::Data => 2,
            ResolveKind::RuntimeHelper => 3,
            ResolveKind::InterfaceLookup => 4,
            ResolveKind::InterfaceMethod => 5,
            ResolveKind::SpecialMethod => 6,
            ResolveKind::StaticMethod => 7,
            ResolveKind::VirtualMethod => 8,
            ResolveKind::Recompilation => 9,
            ResolveKind::MonitorEnter => 10,
            ResolveKind::MethodMonitorEnter => 11,
            ResolveKind::FailedMethodMonitorEnter => 12,
            ResolveKind::Allocation => 13,
            ResolveKind::BeforeAnewarray => 14,
            ResolveKind::BeforeMultianewarray => 15,
            ResolveKind::InduceOsr => 16,
            ResolveKind::ExceptionCatch => 17,
            ResolveKind::Unknown(other) => u64::from(other),
        };
        (sub_type << frame_flags::SUB_TYPE_SHIFT) & frame_flags::SUB_TYPE_MASK
    }

    /// Resolves that stop in front of a call and leave its arguments on the
    /// stack, described by the callee's signature.
    pub fn is_method_resolve(self) -> bool {
        matches!(
            self,
            ResolveKind::VirtualMethod
                | ResolveKind::InterfaceMethod
                | ResolveKind::SpecialMethod
                | ResolveKind::StaticMethod
                | ResolveKind::InterfaceLookup
                | ResolveKind::Recompilation
                | ResolveKind::InduceOsr
        )
    }

    /// Resolves raised before the compiled frame below finished building.
    pub fn hides_jit_frame(self) -> bool {
        matches!(self, ResolveKind::StackOverflow | ResolveKind::FailedMethodMonitorEnter)
    }
}

/// Address of the first word of a structure of `size` words ending at `bp`.
pub fn frame_start(target: &Target<'_>, bp: Addr, size: i64) -> Addr {
    target.slot(bp, 1 - size)
}

/// The common tail of every interpreter frame.
pub mod stack_frame {
    pub const SAVED_CP: i64 = 0;
    pub const SAVED_PC: i64 = 1;
    pub const SAVED_A0: i64 = 2;
    pub const SIZE: i64 = 3;
}

pub mod method_frame {
    pub const METHOD: i64 = 0;
    pub const FLAGS: i64 = 1;
    pub const SAVED_CP: i64 = 2;
    pub const SAVED_PC: i64 = 3;
    pub const SAVED_A0: i64 = 4;
    pub const SIZE: i64 = 5;
}

pub mod special_frame {
    pub const FLAGS: i64 = 0;
    pub const SAVED_CP: i64 = 1;
    pub const SAVED_PC: i64 = 2;
    pub const SAVED_A0: i64 = 3;
    pub const SIZE: i64 = 4;
}

pub mod jni_call_in_frame {
    pub const EXIT_ADDRESS: i64 = 0;
    pub const FLAGS: i64 = 1;
    pub const SAVED_CP: i64 = 2;
    pub const SAVED_PC: i64 = 3;
    pub const SAVED_A0: i64 = 4;
    pub const SIZE: i64 = 5;
}

pub mod method_type_frame {
    pub const METHOD_TYPE: i64 = 0;
    pub const ARG_STACK_SLOTS: i64 = 1;
    pub const DESCRIPTION_INT_COUNT: i64 = 2;
    pub const FLAGS: i64 = 3;
    pub const SAVED_CP: i64 = 4;
    pub const SAVED_PC: i64 = 5;
    pub const SAVED_A0: i64 = 6;
    pub const SIZE: i64 = 7;
    /// 32-bit argument description words stored above the frame base.
    pub const DESCRIPTION_WORDS: usize = 8;
}

pub mod jit_resolve_frame {
    pub const SAVED_JIT_EXCEPTION: i64 = 0;
    pub const FLAGS: i64 = 1;
    pub const PARM_COUNT: i64 = 2;
    pub const RETURN_ADDRESS: i64 = 3;
    pub const TAGGED_REGULAR_RETURN_SP: i64 = 4;
    pub const SIZE: i64 = 5;
}

/// Interpreter state saved when the interpreter called compiled code.
pub mod i2j_state {
    pub const RETURN_SP: i64 = 0;
    pub const A0: i64 = 1;
    pub const LITERALS: i64 = 2;
    pub const PC: i64 = 3;
    pub const SIZE: i64 = 4;
}

/// Compiled code calling back into the interpreter. The callee-saved
/// register block between `PREVIOUS_J2I_FRAME` and `flags` has one word per
/// callee-saved register of the architecture.
pub mod j2i_frame {
    use super::i2j_state;

    pub const I2J_STATE: i64 = 0;
    pub const PREVIOUS_J2I_FRAME: i64 = i2j_state::SIZE;
    pub const SAVED_REGISTERS: i64 = PREVIOUS_J2I_FRAME + 1;

    pub const fn flags(saved: i64) -> i64 {
        SAVED_REGISTERS + saved
    }
    pub const fn exit_point(saved: i64) -> i64 {
        SAVED_REGISTERS + saved + 1
    }
    pub const fn return_address(saved: i64) -> i64 {
        SAVED_REGISTERS + saved + 2
    }
    pub const fn tagged_return_sp(saved: i64) -> i64 {
        SAVED_REGISTERS + saved + 3
    }
    pub const fn size(saved: i64) -> i64 {
        SAVED_REGISTERS + saved + 4
    }
}

/// Per-thread record of one interpreter entry.
pub mod entry_local_storage {
    use super::i2j_state;

    pub const OLD_ELS: i64 = 0;
    pub const JIT_GLOBAL_STORAGE_BASE: i64 = 1;
    pub const I2J_STATE: i64 = 2;
    pub const JIT_FP_REGISTER_STORAGE_BASE: i64 = I2J_STATE + i2j_state::SIZE;
}

pub mod jit_frame {
    pub const RETURN_PC: i64 = 0;
    pub const SIZE: i64 = 1;
}

/// One decompilation record in a thread's decompilation stack. The OSR
/// buffer is embedded at the end.
pub mod decompilation_info {
    pub const NEXT: i64 = 0;
    pub const BP: i64 = 1;
    pub const PC: i64 = 2;
    pub const PC_ADDRESS: i64 = 3;
    pub const METHOD: i64 = 4;
    pub const REASON: i64 = 5;
    pub const USES_OSR: i64 = 6;
    pub const OSR_BUFFER: i64 = 7;
}

pub mod osr_buffer {
    pub const NUMBER_OF_FRAMES: i64 = 0;
    pub const JIT_PC: i64 = 1;
    pub const SIZE: i64 = 2;
}

/// A saved interpreter frame inside an OSR buffer, followed by `maxStack`
/// operand slots and `numberOfLocals` local slots.
pub mod osr_frame {
    pub const FLAGS: i64 = 0;
    pub const METHOD: i64 = 1;
    pub const BYTECODE_PC_OFFSET: i64 = 2;
    pub const NUMBER_OF_LOCALS: i64 = 3;
    pub const MAX_STACK: i64 = 4;
    pub const PENDING_STACK_HEIGHT: i64 = 5;
    pub const MONITOR_ENTER_RECORDS: i64 = 6;
    pub const SIZE: i64 = 7;
}
