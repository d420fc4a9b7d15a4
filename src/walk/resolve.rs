//! Resolve frames: compiled code calling a runtime helper to resolve
//! something it needs before it can continue.
//!
//! Method resolves happen in the middle of a call. The outgoing arguments
//! are already pushed, partly still in argument registers the helper spilled
//! to the stack, so the walker reads the target's signature to tell which of
//! them are references.

use alloc::string::String;

use super::WalkState;
use crate::{
    error::{FatalWalkError, LocalizedSlotError},
    layout::{self, entry_local_storage, jit_resolve_frame, ResolveKind},
    report::{FrameAction, FrameKind, SlotType},
    signature::{send_slots, SignatureCursor},
    spill::{float_argument_slot, FloatArgs, SpillCursor},
    Addr, WalkFlags,
};

mod bytecode {
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESPECIAL: u8 = 0xb7;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const INVOKEINTERFACE: u8 = 0xb9;
}

/// Where the outgoing arguments of an interrupted call are.
struct SendArguments {
    /// Stack slot of the next argument, moving down.
    pending: Addr,
    spill: SpillCursor,
    floats: FloatArgs,
}

impl WalkState<'_, '_> {
    pub(super) fn walk_resolve_transition(&mut self) -> Result<FrameAction, FatalWalkError> {
        let frame = layout::frame_start(&self.target, self.bp, jit_resolve_frame::SIZE);
        let kind = ResolveKind::from_flags(self.frame_flags);
        trace!(?kind, ?frame, "resolve frame");

        self.update_pc_from(self.target.slot(frame, jit_resolve_frame::RETURN_ADDRESS))?;
        if kind == ResolveKind::ExceptionCatch {
            // the handler address is the first instruction of its map range
            self.pc = self.pc.byte_add(1);
        }
        self.resolve_frame_flags = self.frame_flags;

        let parms = self
            .target
            .read_addr(self.target.slot(frame, jit_resolve_frame::TAGGED_REGULAR_RETURN_SP))?
            .untag(3);
        self.unwind_sp = parms;
        if self.layout.helpers_pass_parameters_on_stack() {
            let count = self
                .target
                .read_word(self.target.slot(frame, jit_resolve_frame::PARM_COUNT))?;
            self.unwind_sp = self.target.slot(self.unwind_sp, count as i64);
        }

        let shape = self.layout.resolve_shape();
        if kind == ResolveKind::Data {
            if self.flags.contains(WalkFlags::MAINTAIN_REGISTER_MAP) {
                self.registers
                    .fill_data_resolve(self.layout, &self.target, self.unwind_sp);
            }
            self.unwind_sp = self.target.slot(self.unwind_sp, shape.data_resolve_pushes as i64);
            return Ok(FrameAction::Continue);
        }

        if self.flags.contains(WalkFlags::MAINTAIN_REGISTER_MAP) {
            match self.global_storage_base() {
                Ok(base) => self.registers.fill_resolve(&self.target, base),
                Err(err) => self.govern("resolve register saves", Err(err.into())),
            }
        }

        if kind.is_method_resolve() {
            self.walk_resolve_method_frame(kind, parms)?;
        } else if kind.hides_jit_frame() {
            return self.walk_hidden_jit_frame(kind);
        }
        Ok(FrameAction::Continue)
    }

    /// A stack overflow or monitor enter resolve interrupts a compiled
    /// method whose frame is not complete yet.
    fn walk_hidden_jit_frame(&mut self, kind: ResolveKind) -> Result<FrameAction, FatalWalkError> {
        let in_prologue = kind == ResolveKind::StackOverflow;
        let method = self
            .jit_get_exception_table()?
            .ok_or(FatalWalkError::MissingMetadata { pc: self.pc })?;
        self.jit_info = Some(method);
        self.bp = self.unwind_sp;
        if !in_prologue {
            self.bp = self.target.slot(self.bp, method.total_frame_size());
        }
        self.outgoing_arg_count = 0;
        self.set_a0_cp_method(&method);
        self.kind = FrameKind::JitHidden;
        self.bytecode_pc_offset = None;

        if self.walking_slots() {
            let result = self.jit_walk_frame(&method, !in_prologue, None);
            self.govern("hidden compiled frame", result);
        }
        if self.flags.contains(WalkFlags::INCLUDE_HIDDEN_JIT_FRAMES) {
            self.frame_flags = 0;
            if self.walk_frame()? == FrameAction::Stop {
                return Ok(FrameAction::Stop);
            }
        }
        if self.flags.contains(WalkFlags::MAINTAIN_REGISTER_MAP) {
            self.registers.clear_destroyed(self.layout);
        }
        self.unwind_to_caller()?;
        Ok(FrameAction::Continue)
    }

    /// Helper parameter `n`, counting from 1. `parms` is where stack-passed
    /// parameters start.
    fn resolve_parm(&self, n: usize, parms: Addr) -> Result<u64, FatalWalkError> {
        if self.layout.helpers_pass_parameters_on_stack() {
            return Ok(self.target.read_slot(parms, n as i64 - 1)?);
        }
        let register = self
            .layout
            .argument_registers()
            .get(n - 1)
            .ok_or(FatalWalkError::Malformed {
                what: "resolve helper parameter",
                value: n as u64,
            })?;
        Ok(self.target.read_slot(self.global_storage_base()?, i64::from(*register))?)
    }

    /// Argument registers the helper spilled below the outgoing arguments.
    fn spilled_argument_registers(&mut self) -> SpillCursor {
        let count = self.layout.argument_registers().len();
        if count == 0 {
            return SpillCursor::empty();
        }
        self.unwind_sp = self.target.slot(self.unwind_sp, count as i64);
        SpillCursor::new(count, self.target.slot(self.unwind_sp, -1))
    }

    fn walk_resolve_method_frame(&mut self, kind: ResolveKind, parms: Addr) -> Result<(), FatalWalkError> {
        let shape = self.layout.resolve_shape();
        let mut floats = FloatArgs::new(self.layout);
        let signature: String;
        let slots: usize;

        let (spill, receiver) = match kind {
            ResolveKind::Recompilation => {
                let method = self.runtime.method(Addr(self.resolve_parm(1, parms)?))?;
                let spill = self.spilled_argument_registers();
                self.unwind_sp = self.target.slot(self.unwind_sp, shape.recompilation_pushes as i64);
                let receiver = !method.is_static();
                signature = method.signature;
                slots = method.arg_count;
                (spill, receiver)
            }
            ResolveKind::InterfaceLookup => {
                let interface = Addr(self.resolve_parm(2, parms)?);
                let method = self.runtime.method(self.runtime.interface_method(interface)?)?;
                let spill = self.spilled_argument_registers();
                self.unwind_sp = self.target.slot(self.unwind_sp, shape.virtual_method_pushes as i64);
                signature = method.signature;
                slots = method.arg_count;
                (spill, true)
            }
            ResolveKind::InduceOsr => {
                // the outgoing arguments are all on the stack already
                floats = FloatArgs::none(self.layout);
                let Some((call, receiver)) = self.induced_osr_call()? else {
                    return Ok(());
                };
                signature = call;
                slots = send_slots(&signature)? + usize::from(receiver);
                (SpillCursor::empty(), receiver)
            }
            ResolveKind::StaticMethod | ResolveKind::SpecialMethod => {
                floats = FloatArgs::none(self.layout);
                let receiver = kind == ResolveKind::SpecialMethod;
                let constant_pool = Addr(self.resolve_parm(2, parms)?);
                let index = self.resolve_parm(3, parms)?;
                self.unwind_sp = self.target.slot(self.unwind_sp, shape.static_method_pushes as i64);
                signature = self.runtime.resolved_method_signature(constant_pool, index)?;
                slots = send_slots(&signature)? + usize::from(receiver);
                (SpillCursor::empty(), receiver)
            }
            _ => {
                let index_and_literals = Addr(self.resolve_parm(1, parms)?);
                let constant_pool = self.target.read_addr(index_and_literals)?;
                let index = self.target.read_slot(index_and_literals, 1)?;
                let spill = self.spilled_argument_registers();
                self.unwind_sp = self.target.slot(self.unwind_sp, shape.virtual_method_pushes as i64);
                signature = self.runtime.resolved_method_signature(constant_pool, index)?;
                slots = send_slots(&signature)? + 1;
                (spill, true)
            }
        };
        trace!(%signature, slots, receiver, "resolve frame arguments");

        if self.walking_slots() {
            let arguments = SendArguments {
                pending: self.target.slot(self.unwind_sp, slots as i64 - 1),
                spill,
                floats,
            };
            let result = self.walk_send_arguments(&signature, receiver, arguments);
            self.govern("resolve frame arguments", result);
        }

        if self.layout.callee_pops_arguments() {
            self.unwind_sp = self.target.slot(self.unwind_sp, slots as i64);
        }
        self.arg_count = slots;
        Ok(())
    }

    /// The call a compiled method was making when it was sent to the
    /// interpreter, read from the invoke it was compiled from. `None` when
    /// the frame is not stopped at an invoke.
    fn induced_osr_call(&mut self) -> Result<Option<(String, bool)>, FatalWalkError> {
        let method = self
            .jit_get_exception_table()?
            .ok_or(FatalWalkError::MissingMetadata { pc: self.pc })?;
        let inline_map = method
            .maps_at_pc(self.pc)?
            .inline_map
            .ok_or(FatalWalkError::MissingStackMap { pc: self.pc })?;
        let innermost = method.first_call_site(&inline_map)?;
        let info = method.current_byte_code_info(&inline_map, innermost.as_ref())?;
        let caller = self
            .runtime
            .method(innermost.map_or(method.ram_method(), |site| site.method))?;

        let invoke = caller.bytecodes.byte_add(i64::from(info.byte_code_index));
        let opcode = self.target.read_u8(invoke)?;
        let receiver = match opcode {
            bytecode::INVOKEVIRTUAL | bytecode::INVOKESPECIAL | bytecode::INVOKEINTERFACE => true,
            bytecode::INVOKESTATIC => false,
            _ => {
                trace!(opcode, bci = info.byte_code_index, "induced OSR away from an invoke");
                return Ok(None);
            }
        };
        let index = self.target.read_u16(invoke.byte_add(1))?;
        let signature = self
            .runtime
            .resolved_method_signature(caller.constant_pool, u64::from(index))?;
        Ok(Some((signature, receiver)))
    }

    fn walk_send_arguments(
        &mut self,
        signature: &str,
        receiver: bool,
        mut args: SendArguments,
    ) -> Result<(), LocalizedSlotError> {
        if receiver {
            let slot = args.spill.take(&self.target).unwrap_or(args.pending);
            self.report_object(slot, SlotType::Internal, -1)?;
            args.pending = self.target.slot(args.pending, -1);
        }

        let mut cursor = SignatureCursor::new(signature)?;
        loop {
            match cursor.next_arg()? {
                b')' => break,
                b'L' => {
                    let slot = args.spill.take(&self.target).unwrap_or(args.pending);
                    self.report_object(slot, SlotType::Internal, -1)?;
                }
                b'D' if self.layout.float_argument_registers().is_some() => self.walk_double_argument(&mut args)?,
                b'F' if self.layout.float_argument_registers().is_some() => self.walk_float_argument(&mut args)?,
                b'J' | b'D' => self.walk_long_argument(&mut args)?,
                _ => {
                    let slot = args.spill.take(&self.target).unwrap_or(args.pending);
                    self.report_primitive(slot, SlotType::Internal, -1)?;
                }
            }
            args.pending = self.target.slot(args.pending, -1);
        }
        Ok(())
    }

    fn is_wide(&self) -> bool {
        self.target.word_size() == 8
    }

    fn walk_long_argument(&mut self, args: &mut SendArguments) -> Result<(), LocalizedSlotError> {
        args.pending = self.target.slot(args.pending, -1);
        if let Some(slot) = args.spill.take(&self.target) {
            self.report_primitive(slot, SlotType::Internal, -1)?;
            if !self.is_wide() {
                let high = args
                    .spill
                    .take(&self.target)
                    .unwrap_or(self.target.slot(args.pending, 1));
                self.report_primitive(high, SlotType::Internal, -1)?;
            }
        } else {
            if !self.is_wide() {
                self.report_primitive(self.target.slot(args.pending, 1), SlotType::Internal, -1)?;
            }
            self.report_primitive(args.pending, SlotType::Internal, -1)?;
        }
        Ok(())
    }

    fn walk_double_argument(&mut self, args: &mut SendArguments) -> Result<(), LocalizedSlotError> {
        args.pending = self.target.slot(args.pending, -1);
        match args.floats.take() {
            Some(number) => self.walk_float_register(number, true),
            None => {
                if !self.is_wide() {
                    self.report_primitive(self.target.slot(args.pending, 1), SlotType::Internal, -1)?;
                }
                self.report_primitive(args.pending, SlotType::Internal, -1)
            }
        }
    }

    fn walk_float_argument(&mut self, args: &mut SendArguments) -> Result<(), LocalizedSlotError> {
        match args.floats.take() {
            Some(number) => self.walk_float_register(number, self.layout.floats_passed_as_doubles()),
            None => self.report_primitive(args.pending, SlotType::Internal, -1),
        }
    }

    /// A float argument register saved by the helper. On 32-bit targets a
    /// double takes two slots of the save area.
    fn walk_float_register(&mut self, number: usize, double: bool) -> Result<(), LocalizedSlotError> {
        let base = self
            .target
            .read_addr(self.target.slot(self.els, entry_local_storage::JIT_FP_REGISTER_STORAGE_BASE))?;
        let slot = float_argument_slot(self.layout, self.config.vector_registers, base, number);
        if double && !self.is_wide() {
            self.report_primitive(self.target.slot(slot, 1), SlotType::Internal, -1)?;
        }
        self.report_primitive(slot, SlotType::Internal, -1)
    }
}
