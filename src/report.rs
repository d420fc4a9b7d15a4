//! The callback boundary between the walker and its caller.

use crate::{Addr, WalkFlags};

/// What the frame callback wants the walk to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    /// End the walk. This is not an error: the result stays `NONE`.
    Stop,
}

/// The part of a frame a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    /// Runtime-internal slots: object pushes, receivers of resolves, sync
    /// objects, class objects.
    Internal,
    /// Arguments and temps of a method.
    MethodLocal,
    /// The operand stack of a bytecoded frame.
    Pending,
    JniLocal,
    /// A register spilled by compiled code.
    JitRegisterMap,
}

/// How a reportable location is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClass {
    Object,
    Primitive,
    /// Points into an object rather than at its header. Adjusted by the
    /// walker, never handed to callbacks.
    InternalPointer,
}

/// One reported object slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    /// Where the reference lives.
    pub address: Addr,
    /// The stack word that led to `address`. Equal to `address` for direct
    /// slots; differs for tagged JNI references and redirected arguments.
    pub indirection: Addr,
    pub slot_type: SlotType,
    /// Position within the slot group; -1 for hidden slots.
    pub index: i64,
}

impl SlotInfo {
    pub fn is_indirect(&self) -> bool {
        self.address != self.indirection
    }
}

/// How the walker found the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Bytecode,
    /// A bytecoded frame entered from compiled code.
    J2iTransition,
    GenericSpecial,
    /// A method frame pushed by a runtime helper or a compiled-code transition.
    Method,
    NativeMethod,
    JniNativeMethod,
    MethodType,
    JitResolve,
    JitJniCallout,
    JniCallIn,
    Jit,
    /// A method inlined into the compiled frame reported after it.
    JitInline,
    /// The half-built compiled frame under a stack-overflow or failed monitor
    /// enter resolve.
    JitHidden,
}

impl FrameKind {
    pub fn is_compiled(self) -> bool {
        matches!(self, FrameKind::Jit | FrameKind::JitInline | FrameKind::JitHidden)
    }
}

/// A snapshot of the walk state handed to callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub thread: Addr,
    pub kind: FrameKind,
    pub pc: Addr,
    /// Frame base: the saved A0 slot of interpreter frames, the return
    /// address slot of compiled frames.
    pub bp: Addr,
    /// Lowest slot in use by this frame.
    pub sp: Addr,
    pub unwind_sp: Addr,
    pub arg0_ea: Addr,
    pub literals: Addr,
    pub method: Addr,
    pub constant_pool: Addr,
    pub frame_flags: u64,
    /// Metadata of the compiled method, null for interpreted frames.
    pub jit_info: Addr,
    /// Inlined frames still to come from the current compiled frame,
    /// counting this one.
    pub inline_depth: usize,
    pub bytecode_pc_offset: Option<u64>,
    pub arg_count: usize,
    /// Argument slots this frame pushed for the frame before it.
    pub outgoing_arg_count: usize,
    pub frames_walked: usize,
    pub walk_flags: WalkFlags,
}

/// The caller's half of a walk.
pub trait WalkCallbacks {
    fn on_frame(&mut self, frame: &Frame) -> FrameAction;

    /// A slot that holds a reference. The callback may rewrite the slot; the
    /// walker re-reads it afterwards.
    fn on_object_slot(&mut self, _frame: &Frame, _slot: &SlotInfo) {}

    /// A reference field of an object that lives on the stack.
    fn on_field_slot(&mut self, _frame: &Frame, _field: Addr, _container: Addr) {}
}

impl<F> WalkCallbacks for F
where
    F: FnMut(&Frame) -> FrameAction,
{
    fn on_frame(&mut self, frame: &Frame) -> FrameAction {
        self(frame)
    }
}
