//! Compiled frames.
//!
//! Compiled frames have no frame pointer chain. Each one is found from the
//! previous one's unwind pointer and the frame size its metadata declares:
//! `bp = unwind_sp + total_frame_size`, and the return address into the
//! caller sits at `bp`. The walk continues until a return address is not
//! compiled code, which must then be a return into the interpreter.

use alloc::vec::Vec;

use super::{interp::BytecodeSlots, slots::check_slot_count, WalkState};
use crate::{
    arch::ScanDirection,
    error::{FatalWalkError, LocalizedSlotError},
    layout::{
        self, decompilation_info, entry_local_storage, frame_flags, i2j_state, j2i_frame, jit_frame, method_frame,
        osr_buffer, osr_frame, special_frame, ResolveKind,
    },
    metadata::{CompiledMethod, GcBitmapCursor, MapEntry, MapsAtPc, INTERNAL_PTR_REG_MASK},
    report::{FrameAction, FrameKind, SlotClass, SlotType},
    spill::RegisterFile,
    Addr, WalkFlags,
};

/// Decompilation records below the top one that are looked at before the
/// chain is declared broken.
const DECOMPILATION_CHAIN_LIMIT: usize = 4096;

/// Frames a single OSR buffer may hold.
const MAX_OSR_FRAMES: u64 = 1024;

impl<'a> WalkState<'a, '_> {
    /// Walks the run of compiled frames below a transition frame, then
    /// restores the interpreter state saved when the interpreter called into
    /// compiled code.
    #[instrument(level = "trace", skip(self), fields(pc = ?self.pc, frame_flags = self.frame_flags))]
    pub(super) fn jit_walk_stack_frames(&mut self) -> Result<FrameAction, FatalWalkError> {
        if self.flags.contains(WalkFlags::MAINTAIN_REGISTER_MAP) {
            // saves recorded in a younger run belong to frames already left
            self.registers = RegisterFile::new(self.layout);
        }
        if self.walk_transition_frame()? == FrameAction::Stop {
            return Ok(FrameAction::Stop);
        }
        self.frame_flags = 0;

        while let Some(method) = self.jit_get_exception_table()? {
            self.jit_info = Some(method);
            self.bp = self.target.slot(self.unwind_sp, method.total_frame_size());
            self.sp = if self.layout.callee_pops_arguments() {
                self.target.slot(self.unwind_sp, -(self.arg_count as i64))
            } else {
                self.unwind_sp
            };
            self.outgoing_arg_count = self.arg_count;

            let mut maps = MapsAtPc::default();
            if !self.flags.contains(WalkFlags::SKIP_INLINES) && !method.metadata.inlined_calls.is_null() {
                maps = method.maps_at_pc(self.pc)?;
                if let Some(inline_map) = maps.inline_map {
                    if self.walk_inlined_frames(&method, &inline_map)? == FrameAction::Stop {
                        return Ok(FrameAction::Stop);
                    }
                }
            } else if self.flags.contains(WalkFlags::RECORD_BYTECODE_PC_OFFSET) {
                maps = method.maps_at_pc(self.pc)?;
            }

            self.set_a0_cp_method(&method);
            self.kind = FrameKind::Jit;
            self.bytecode_pc_offset = None;
            if self.flags.contains(WalkFlags::RECORD_BYTECODE_PC_OFFSET) {
                if let Some(inline_map) = maps.inline_map {
                    let info = method.current_byte_code_info(&inline_map, None)?;
                    self.bytecode_pc_offset = Some(u64::from(info.byte_code_index));
                }
            }

            if self.flags.contains(WalkFlags::ITERATE_METHOD_CLASS_SLOTS) && !self.governor.is_disabled() {
                let result = self.mark_classes_in_inline_ranges(&method);
                self.govern("inlined method classes", result);
            }
            if self.walking_slots() {
                let result = self.jit_walk_frame(&method, true, maps.stack_map);
                self.govern("compiled frame", result);
            }

            if self.walk_frame()? == FrameAction::Stop {
                return Ok(FrameAction::Stop);
            }

            if self.flags.contains(WalkFlags::MAINTAIN_REGISTER_MAP) {
                self.registers.clear_destroyed(self.layout);
                self.registers
                    .add_spilled(self.layout, &self.target, &method.metadata, self.bp);
            }
            self.unwind_to_caller()?;
        }
        self.jit_info = None;
        self.inline_depth = 0;

        let return_pc = self.pc;
        if !self.config.i2j_return_table.is_empty() && !self.config.i2j_return_table.contains(&return_pc) {
            return Err(FatalWalkError::InvalidReturnAddress(return_pc));
        }

        let i2j = self.i2j_state;
        self.update_pc_from(self.target.slot(i2j, i2j_state::PC))?;
        self.literals = self.target.read_addr(self.target.slot(i2j, i2j_state::LITERALS))?;
        self.arg0_ea = self.target.read_addr(self.target.slot(i2j, i2j_state::A0))?;
        let return_sp = self.target.read_word(self.target.slot(i2j, i2j_state::RETURN_SP))?;
        self.previous_frame_flags = if return_sp & frame_flags::ARGS_ALIGNED_TAG != 0 {
            frame_flags::JIT_ARGS_ALIGNED
        } else {
            0
        };
        self.walk_sp = Addr(return_sp).untag(3);
        trace!(pc = ?self.pc, sp = ?self.walk_sp, ?return_pc, "back in the interpreter");
        Ok(FrameAction::Continue)
    }

    /// One frame per inlined method, innermost first.
    fn walk_inlined_frames(
        &mut self,
        method: &CompiledMethod<'a>,
        inline_map: &MapEntry,
    ) -> Result<FrameAction, FatalWalkError> {
        let chain = method.call_site_chain(inline_map)?;
        if chain.is_empty() {
            return Ok(FrameAction::Continue);
        }
        self.arg0_ea = Addr::NULL;
        self.kind = FrameKind::JitInline;
        self.inline_depth = chain.len();
        for site in &chain {
            self.method = site.method;
            self.constant_pool = self.runtime.method(site.method)?.constant_pool;
            let info = method.current_byte_code_info(inline_map, Some(site))?;
            self.bytecode_pc_offset = Some(u64::from(info.byte_code_index));
            if self.walk_frame()? == FrameAction::Stop {
                return Ok(FrameAction::Stop);
            }
            self.inline_depth -= 1;
        }
        Ok(FrameAction::Continue)
    }

    /// The method, constant pool and arguments of the outermost method.
    pub(super) fn set_a0_cp_method(&mut self, method: &CompiledMethod<'a>) {
        self.arg0_ea = self
            .target
            .slot(self.bp, method.arg_slots() as i64 + jit_frame::SIZE - 1);
        self.method = method.ram_method();
        self.constant_pool = method.constant_pool();
        self.arg_count = method.arg_slots();
    }

    pub(super) fn update_pc_from(&mut self, address: Addr) -> Result<(), FatalWalkError> {
        self.pc_address = address;
        self.pc = self.layout.mask_pc(self.target.read_addr(address)?);
        Ok(())
    }

    pub(super) fn unwind_to_caller(&mut self) -> Result<(), FatalWalkError> {
        let mut unwind_sp = self.target.slot(self.bp, jit_frame::SIZE);
        if self.layout.callee_pops_arguments() {
            unwind_sp = self.target.slot(unwind_sp, self.arg_count as i64);
        }
        self.unwind_sp = unwind_sp;
        self.resolve_frame_flags = 0;
        self.update_pc_from(self.target.slot(self.bp, jit_frame::RETURN_PC))
    }

    pub(super) fn lookup_compiled(&self, pc: Addr) -> Result<Option<CompiledMethod<'a>>, FatalWalkError> {
        match self.runtime.metadata_for_pc(self.layout.mask_pc(pc)) {
            Some(metadata) => Ok(Some(CompiledMethod::read(self.target, self.config, metadata)?)),
            None => Ok(None),
        }
    }

    /// The compiled method the current pc is in.
    ///
    /// A frame marked for decompilation had its return address replaced. The
    /// real one is in the top record of the decompilation stack, which then
    /// becomes the current record.
    pub(super) fn jit_get_exception_table(&mut self) -> Result<Option<CompiledMethod<'a>>, FatalWalkError> {
        self.decompilation_record = Addr::NULL;
        if let Some(method) = self.lookup_compiled(self.pc)? {
            return Ok(Some(method));
        }
        let top = self.decompilation_stack;
        if top.is_null() {
            return Ok(None);
        }

        let top_pc_address = self
            .target
            .read_addr(self.target.slot(top, decompilation_info::PC_ADDRESS))?;
        if top_pc_address == self.pc_address {
            let mut pc = self.target.read_addr(self.target.slot(top, decompilation_info::PC))?;
            if ResolveKind::from_flags(self.resolve_frame_flags) == ResolveKind::ExceptionCatch {
                pc = pc.byte_add(1);
            }
            trace!(record = ?top, ?pc, "frame is marked for decompilation");
            self.pc = pc;
            self.decompilation_record = top;
            self.decompilation_stack = self.target.read_addr(self.target.slot(top, decompilation_info::NEXT))?;
            return self.lookup_compiled(self.pc);
        }

        let mut record = self.target.read_addr(self.target.slot(top, decompilation_info::NEXT))?;
        let mut depth = 0;
        while !record.is_null() {
            let pc_address = self
                .target
                .read_addr(self.target.slot(record, decompilation_info::PC_ADDRESS))?;
            if pc_address == self.pc_address {
                warn!(?record, "decompilation record found below the top of the decompilation stack");
            }
            depth += 1;
            if depth > DECOMPILATION_CHAIN_LIMIT {
                return Err(FatalWalkError::BrokenDecompilationChain(record));
            }
            record = self.target.read_addr(self.target.slot(record, decompilation_info::NEXT))?;
        }
        Ok(None)
    }

    /// Finds the compiled frame under the transition frame just reported,
    /// and the registers the transition saved.
    fn walk_transition_frame(&mut self) -> Result<FrameAction, FatalWalkError> {
        if self.flags.contains(WalkFlags::START_AT_JIT_FRAME) {
            self.flags.remove(WalkFlags::START_AT_JIT_FRAME);
            self.unwind_sp = self.walk_sp;
            self.pc_address = Addr::NULL;
            return Ok(FrameAction::Continue);
        }

        if self.frame_flags & frame_flags::JIT_RESOLVE_FRAME != 0 {
            return self.walk_resolve_transition();
        }

        if self.frame_flags & frame_flags::JIT_JNI_CALL_OUT_FRAME != 0 {
            let frame = layout::frame_start(&self.target, self.bp, method_frame::SIZE);
            self.update_pc_from(self.target.slot(frame, method_frame::SAVED_CP))?;
            if self.frame_flags & frame_flags::JNI_REFS_REDIRECTED != 0 && self.walking_slots() {
                let result = self.walk_redirected_jni_caller(frame);
                self.govern("JNI callout caller", result);
            }
            self.unwind_sp = self.target.slot(self.bp, 1);
        } else if self.frame_flags & frame_flags::JIT_CALL_IN_FRAME != 0 {
            let sub_type = self.frame_flags & frame_flags::SUB_TYPE_MASK;
            if sub_type & frame_flags::CALL_IN_TYPE_J2I != frame_flags::CALL_IN_TYPE_J2I {
                return Err(FatalWalkError::Malformed {
                    what: "compiled call-in frame sub-type",
                    value: sub_type >> frame_flags::SUB_TYPE_SHIFT,
                });
            }
            let saved = self.layout.callee_saved().len() as i64;
            let frame = layout::frame_start(&self.target, self.bp, j2i_frame::size(saved));
            self.i2j_state = self.target.slot(frame, j2i_frame::I2J_STATE);
            self.j2i_frame = self
                .target
                .read_addr(self.target.slot(frame, j2i_frame::PREVIOUS_J2I_FRAME))?;
            if self.flags.contains(WalkFlags::MAINTAIN_REGISTER_MAP) {
                let saved_registers = self.target.slot(frame, j2i_frame::SAVED_REGISTERS);
                self.registers.fill_j2i(self.layout, &self.target, saved_registers);
            }
            self.unwind_sp = self
                .target
                .read_addr(self.target.slot(frame, j2i_frame::tagged_return_sp(saved)))?
                .untag(3);
            self.update_pc_from(self.target.slot(frame, j2i_frame::return_address(saved)))?;
        } else {
            // a runtime helper called straight from compiled code
            let frame = layout::frame_start(&self.target, self.bp, special_frame::SIZE);
            if self.flags.contains(WalkFlags::MAINTAIN_REGISTER_MAP) {
                match self.global_storage_base() {
                    Ok(base) => self.registers.fill_native_helper(self.layout, &self.target, base),
                    Err(err) => self.govern("helper register saves", Err(err.into())),
                }
            }
            self.unwind_sp = if self.layout.callee_pops_arguments() {
                self.target.slot(self.arg0_ea, 1)
            } else {
                self.target
                    .read_addr(self.target.slot(frame, special_frame::SAVED_A0))?
                    .untag(3)
            };
            self.update_pc_from(self.target.slot(frame, special_frame::SAVED_CP))?;
        }
        Ok(FrameAction::Continue)
    }

    pub(super) fn global_storage_base(&self) -> Result<Addr, FatalWalkError> {
        Ok(self
            .target
            .read_addr(self.target.slot(self.els, entry_local_storage::JIT_GLOBAL_STORAGE_BASE))?)
    }

    /// A native called with redirected references gets its object arguments
    /// from the caller's frame, which must be walked now.
    fn walk_redirected_jni_caller(&mut self, frame: Addr) -> Result<(), LocalizedSlotError> {
        let method = self
            .lookup_compiled(self.pc)?
            .ok_or(FatalWalkError::MissingMetadata { pc: self.pc })?;
        let saved_bp = self.bp;
        let caller_sp = self.target.read_addr(self.target.slot(frame, method_frame::SAVED_PC))?;
        self.unwind_sp = self.target.slot(caller_sp, 1);
        self.bp = self.target.slot(self.unwind_sp, method.total_frame_size());
        self.set_a0_cp_method(&method);
        let result = self.jit_walk_frame(&method, true, None);
        self.bp = saved_bp;
        result
    }

    /// Reports the slots of a compiled frame.
    pub(super) fn jit_walk_frame(
        &mut self,
        method: &CompiledMethod<'a>,
        walk_locals: bool,
        stack_map: Option<MapEntry>,
    ) -> Result<(), LocalizedSlotError> {
        self.walk_method_class()?;
        let stack_map = match stack_map {
            Some(map) => map,
            None => self.stack_map_at_pc(method)?,
        };
        let Some(atlas) = method.atlas else {
            return Err(FatalWalkError::MissingStackMap { pc: self.pc }.into());
        };
        trace!(map = ?stack_map.address, pc = ?self.pc, "compiled frame slots");

        let mut bits = method.gc_bitmap(&stack_map)?;
        let parms = usize::from(atlas.number_of_parm_slots);
        if parms != 0 {
            self.walk_jit_frame_slots(&mut bits, method.parm_scan_start(self.bp), parms)?;
        }

        if walk_locals {
            let temps = method.local_scan_start(self.bp);
            let count = self.target.words_between(self.bp, temps);
            if count > 0 {
                if method.has_internal_pointer_map() {
                    self.walk_internal_pointers(method, &stack_map)?;
                }
                self.walk_jit_frame_slots(&mut bits, temps, count as usize)?;
            }
        }

        self.walk_register_map(method, &stack_map)?;

        if !self.decompilation_record.is_null() {
            let buffer = self.target.slot(self.decompilation_record, decompilation_info::OSR_BUFFER);
            let frames = self.target.read_word(self.target.slot(buffer, osr_buffer::NUMBER_OF_FRAMES))?;
            if frames != 0 {
                self.walk_osr_buffer(buffer, frames)?;
            }
        }
        Ok(())
    }

    /// The stack map for the current pc. A return address may point one
    /// past the end of the call's map range.
    fn stack_map_at_pc(&self, method: &CompiledMethod<'a>) -> Result<MapEntry, LocalizedSlotError> {
        if let Some(map) = method.maps_at_pc(self.pc)?.stack_map {
            return Ok(map);
        }
        if let Some(map) = method.maps_at_pc(self.pc.byte_add(1))?.stack_map {
            return Ok(map);
        }
        Err(FatalWalkError::MissingStackMap { pc: self.pc }.into())
    }

    /// `count` slots upward from `cursor`, indexed from `count - 1` down.
    fn walk_jit_frame_slots(
        &mut self,
        bits: &mut GcBitmapCursor,
        mut cursor: Addr,
        count: usize,
    ) -> Result<(), LocalizedSlotError> {
        check_slot_count("compiled frame slot count", count)?;
        for index in (0..count).rev() {
            let slot_bits = bits.next_bits(&self.target)?;
            if slot_bits.object {
                self.report_object(cursor, SlotType::MethodLocal, index as i64)?;
            } else if slot_bits.stack_allocated {
                self.walk_stack_allocated_object(cursor)?;
            } else {
                self.report_primitive(cursor, SlotType::MethodLocal, index as i64)?;
            }
            cursor = self.target.slot(cursor, 1);
        }
        Ok(())
    }

    fn walk_stack_allocated_object(&mut self, object: Addr) -> Result<(), LocalizedSlotError> {
        trace!(?object, "stack allocated object");
        for field in self.runtime.object_fields(object)? {
            self.report_field(field, object);
        }
        Ok(())
    }

    /// Reports each pinning array and, if the callback moved it, moves the
    /// internal pointers into it by the same distance.
    fn walk_internal_pointers(
        &mut self,
        method: &CompiledMethod<'a>,
        stack_map: &MapEntry,
    ) -> Result<(), LocalizedSlotError> {
        let Some(map) = method.internal_pointer_map(stack_map)? else {
            return Ok(());
        };
        let pinning_registers = method.pinning_registers(stack_map)?;
        let word = self.target.word_size();

        for array in &map.arrays {
            let pin = map.slot(self.bp, word, array.index);
            let before = self.target.read_addr(pin)?;
            self.report_object(pin, SlotType::MethodLocal, i64::from(array.index))?;
            let after = self.target.read_addr(pin)?;
            let displacement = after.distance(before);
            if displacement == 0 {
                continue;
            }
            trace!(?pin, displacement, "pinning array moved");

            for &index in &array.internal_pointers {
                let slot = map.slot(self.bp, word, index);
                self.adjust_internal_pointer(slot, displacement)?;
            }
            let registers: Vec<u8> = pinning_registers
                .iter()
                .filter(|entry| entry.index == array.index)
                .flat_map(|entry| entry.registers.iter().copied())
                .collect();
            for number in registers {
                let Some(id) = self.internal_pointer_register(number) else {
                    continue;
                };
                if let Some(slot) = self.registers.get(id) {
                    self.adjust_internal_pointer(slot, displacement)?;
                }
            }
        }
        Ok(())
    }

    fn adjust_internal_pointer(&mut self, slot: Addr, displacement: i64) -> Result<(), LocalizedSlotError> {
        let value = self.target.read_word(slot)?;
        if value == 0 {
            return Ok(());
        }
        let moved = value.wrapping_add_signed(displacement);
        self.report_slot(SlotClass::InternalPointer, slot, slot, SlotType::MethodLocal, -1)?;
        trace!(?slot, from = format_args!("{value:#x}"), to = format_args!("{moved:#x}"), "adjusting internal pointer");
        self.target.write_word(slot, moved)?;
        Ok(())
    }

    /// Register id of a 1-based register number from an internal pointer
    /// record. Numbers count in the register scan direction.
    fn internal_pointer_register(&self, number: u8) -> Option<usize> {
        let offset = usize::from(number).checked_sub(1)?;
        match self.layout.register_scan() {
            ScanDirection::LowToHigh => Some(offset),
            ScanDirection::HighToLow => self.layout.register_scan_start().checked_sub(offset),
        }
    }

    /// Registers holding references at this map, found where the frames
    /// walked so far saved them.
    fn walk_register_map(&mut self, method: &CompiledMethod<'a>, stack_map: &MapEntry) -> Result<(), LocalizedSlotError> {
        let mut map = method.register_map(stack_map)? & self.layout.register_map_mask();
        if method.has_internal_pointer_map() {
            map &= !INTERNAL_PTR_REG_MASK;
        }
        if map == 0 {
            return Ok(());
        }
        trace!(register_map = format_args!("{map:#x}"), "register map");

        let mut id = self.layout.register_scan_start();
        for index in 0..self.layout.potential_saved_registers() {
            if map & 1 != 0 {
                match self.registers.get(id) {
                    Some(slot) => self.report_object(slot, SlotType::JitRegisterMap, index as i64)?,
                    None => trace!(register = self.layout.register_name(id), "live register was not saved"),
                }
            }
            map >>= 1;
            if map == 0 {
                break;
            }
            id = match self.layout.register_scan() {
                ScanDirection::LowToHigh => id + 1,
                ScanDirection::HighToLow => match id.checked_sub(1) {
                    Some(id) => id,
                    None => break,
                },
            };
        }
        Ok(())
    }

    /// The interpreter frames saved for on-stack replacement of a frame
    /// that is being decompiled.
    fn walk_osr_buffer(&mut self, buffer: Addr, frames: u64) -> Result<(), LocalizedSlotError> {
        if frames > MAX_OSR_FRAMES {
            return Err(LocalizedSlotError::Malformed {
                what: "OSR frame count",
                value: frames,
            });
        }
        let mut frame = self.target.slot(buffer, osr_buffer::SIZE);
        for _ in 0..frames {
            frame = self.walk_osr_frame(frame)?;
        }
        Ok(())
    }

    fn walk_osr_frame(&mut self, frame: Addr) -> Result<Addr, LocalizedSlotError> {
        let field = |index| self.target.read_word(self.target.slot(frame, index));
        let method = Addr(field(osr_frame::METHOD)?);
        let pc_offset = field(osr_frame::BYTECODE_PC_OFFSET)?;
        let locals = field(osr_frame::NUMBER_OF_LOCALS)? as usize;
        let max_stack = field(osr_frame::MAX_STACK)? as usize;
        let pending = field(osr_frame::PENDING_STACK_HEIGHT)? as usize;
        check_slot_count("OSR local count", locals)?;
        check_slot_count("OSR operand stack size", max_stack)?;

        let local_slots = self.target.slot(frame, osr_frame::SIZE + max_stack as i64);
        let next = self.target.slot(local_slots, locals as i64);
        trace!(?frame, ?method, pc_offset, locals, pending, "OSR frame");

        let info = self.runtime.method(method)?;
        let slots = BytecodeSlots {
            method,
            pc_offset,
            pending_base: self.target.slot(local_slots, -1),
            pending,
            local_base: self.target.slot(next, -1),
            locals,
            at_entry_check: false,
        };
        self.walk_bytecode_frame_slots(&info, &slots)?;
        Ok(next)
    }

    /// Classes of inlined methods are kept alive by the compiled method.
    fn mark_classes_in_inline_ranges(&mut self, method: &CompiledMethod<'a>) -> Result<(), LocalizedSlotError> {
        for site in method.loaded_call_sites()? {
            let class_slot = self.runtime.method(site.method)?.class_object_slot;
            self.report_object(class_slot, SlotType::Internal, -1)?;
        }
        Ok(())
    }
}
