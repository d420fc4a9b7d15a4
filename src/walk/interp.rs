//! Frames the interpreter builds.
//!
//! Special frames sit right above the pushes of the frame that created them:
//! `literals` holds the size of those pushes in bytes, so the frame starts at
//! `walk_sp + literals`.

use super::{slots::check_slot_count, WalkState};
use crate::{
    error::{FatalWalkError, LocalizedSlotError},
    layout::{
        self, entry_local_storage, frame_flags, j2i_frame, jit_resolve_frame, jni_call_in_frame, method_frame,
        method_type_frame, special_frame, stack_frame, FrameTag, A0_INVISIBLE_TAG,
    },
    report::{FrameKind, SlotType},
    runtime::MethodInfo,
    signature::argument_bits,
    Addr,
};

impl WalkState<'_, '_> {
    fn special_frame_start(&self) -> Addr {
        self.walk_sp.byte_add(self.literals.0 as i64)
    }

    /// Words the frame pushed, as recorded in `literals`.
    fn pushed_words(&self) -> usize {
        (self.literals.0 / self.target.word_size() as u64) as usize
    }

    fn j2i_saved_registers(&self) -> i64 {
        self.layout.callee_saved().len() as i64
    }

    pub(super) fn walk_generic_special_frame(&mut self) -> Result<(), FatalWalkError> {
        let frame = self.special_frame_start();
        self.kind = FrameKind::GenericSpecial;
        self.bp = self.target.slot(frame, special_frame::SAVED_A0);
        self.frame_flags = self.target.read_word(self.target.slot(frame, special_frame::FLAGS))?;
        if self.walking_slots() && !self.literals.is_null() {
            let result = self.walk_object_pushes(self.walk_sp, self.pushed_words());
            self.govern("generic special frame", result);
        }
        self.arg_count = 0;
        Ok(())
    }

    /// Method frames: natives, JNI natives and runtime helpers.
    pub(super) fn walk_method_frame(&mut self) -> Result<(), FatalWalkError> {
        let frame = self.special_frame_start();
        self.kind = match FrameTag::classify(self.pc) {
            FrameTag::NativeMethod => FrameKind::NativeMethod,
            FrameTag::JniNativeMethod => FrameKind::JniNativeMethod,
            _ => FrameKind::Method,
        };
        self.bp = self.target.slot(frame, method_frame::SAVED_A0);
        self.frame_flags = self.target.read_word(self.target.slot(frame, method_frame::FLAGS))?;
        self.method = self.target.read_addr(self.target.slot(frame, method_frame::METHOD))?;
        self.unwind_sp = frame;

        if self.walking_slots() && !self.literals.is_null() {
            let result = if self.frame_flags & frame_flags::JNI_REFS_REDIRECTED != 0 {
                self.walk_pushed_jni_refs()
            } else {
                self.walk_object_pushes(self.walk_sp, self.pushed_words())
            };
            self.govern("method frame pushes", result);
        }

        if self.method.is_null() {
            if self.walking_slots() && self.arg0_ea != self.bp {
                let count = self.target.words_between(self.arg0_ea, self.bp).max(0) as usize;
                let result = self.walk_jni_refs(self.target.slot(self.bp, 1), count);
                self.govern("method frame JNI references", result);
            }
            self.constant_pool = Addr::NULL;
            self.arg_count = 0;
        } else {
            let method = self.runtime.method(self.method)?;
            self.constant_pool = method.constant_pool;
            self.arg_count = method.arg_count;
            if self.walking_slots() {
                let result = self.walk_method_frame_arguments(&method);
                self.govern("method frame arguments", result);
            }
        }
        Ok(())
    }

    fn walk_method_frame_arguments(&mut self, method: &MethodInfo) -> Result<(), LocalizedSlotError> {
        self.walk_method_class()?;
        if self.arg_count == 0 {
            return Ok(());
        }
        let bits = argument_bits(method, self.arg_count)?;
        if self.frame_flags & frame_flags::JNI_REFS_REDIRECTED != 0 {
            self.walk_indirect_described_pushes(self.arg0_ea, self.arg_count, &bits)
        } else {
            self.walk_described_pushes(self.arg0_ea, self.arg_count, &bits, SlotType::MethodLocal)
        }
    }

    /// Object pushes followed by the JNI references the native created.
    fn walk_pushed_jni_refs(&mut self) -> Result<(), LocalizedSlotError> {
        let references = (self.frame_flags & frame_flags::JNI_PUSHED_REF_COUNT_MASK) as usize;
        let pushes = self
            .pushed_words()
            .checked_sub(references)
            .ok_or(LocalizedSlotError::Malformed {
                what: "JNI reference count",
                value: references as u64,
            })?;
        if pushes != 0 {
            self.walk_object_pushes(self.walk_sp, pushes)?;
        }
        if references != 0 {
            self.walk_jni_refs(self.target.slot(self.walk_sp, pushes as i64), references)?;
        }
        Ok(())
    }

    pub(super) fn walk_method_type_frame(&mut self) -> Result<(), FatalWalkError> {
        let frame = self.special_frame_start();
        self.kind = FrameKind::MethodType;
        self.bp = self.target.slot(frame, method_type_frame::SAVED_A0);
        self.frame_flags = self.target.read_word(self.target.slot(frame, method_type_frame::FLAGS))?;
        self.method = Addr::NULL;
        self.unwind_sp = frame;
        let arg_stack_slots = self
            .target
            .read_word(self.target.slot(frame, method_type_frame::ARG_STACK_SLOTS))?;
        self.arg_count = arg_stack_slots as usize + 1;

        if self.walking_slots() {
            let result = self.walk_method_type_slots(frame);
            self.govern("method type frame", result);
        }
        Ok(())
    }

    fn walk_method_type_slots(&mut self, frame: Addr) -> Result<(), LocalizedSlotError> {
        let descriptions = self.target.slot(self.bp, 1);
        let mut bits = [0u32; method_type_frame::DESCRIPTION_WORDS];
        for (n, word) in bits.iter_mut().enumerate() {
            *word = self.target.read_u32(descriptions.byte_add(4 * n as i64))?;
        }
        if !self.literals.is_null() {
            self.walk_object_pushes(self.walk_sp, self.pushed_words())?;
        }
        self.report_object(
            self.target.slot(frame, method_type_frame::METHOD_TYPE),
            SlotType::Internal,
            -1,
        )?;
        self.walk_described_pushes(self.arg0_ea, self.arg_count, &bits, SlotType::MethodLocal)
    }

    /// The interpreter's half of a call into a resolve helper. The compiled
    /// frames under it are walked once the frame is reported.
    pub(super) fn walk_jit_resolve_frame(&mut self) -> Result<(), FatalWalkError> {
        let frame = self.special_frame_start();
        self.kind = FrameKind::JitResolve;
        self.arg_count = 0;
        self.bp = self.target.slot(frame, jit_resolve_frame::TAGGED_REGULAR_RETURN_SP);
        self.frame_flags = self.target.read_word(self.target.slot(frame, jit_resolve_frame::FLAGS))?;
        if self.walking_slots() {
            let exception = self.target.slot(frame, jit_resolve_frame::SAVED_JIT_EXCEPTION);
            let mut result = self.report_object(exception, SlotType::Internal, -1);
            if result.is_ok() && !self.literals.is_null() {
                result = self.walk_object_pushes(self.walk_sp, self.pushed_words());
            }
            self.govern("resolve frame", result);
        }
        Ok(())
    }

    /// Compiled code calling a native through JNI.
    pub(super) fn walk_jit_jni_callout_frame(&mut self) -> Result<(), FatalWalkError> {
        let frame = self.special_frame_start();
        self.kind = FrameKind::JitJniCallout;
        self.arg_count = 0;
        self.bp = self.target.slot(frame, method_frame::SAVED_A0);
        self.frame_flags = self.target.read_word(self.target.slot(frame, method_frame::FLAGS))?;
        self.method = self.target.read_addr(self.target.slot(frame, method_frame::METHOD))?;
        self.constant_pool = self.runtime.method(self.method)?.constant_pool;
        if self.walking_slots() {
            let mut result = self.walk_method_class();
            if result.is_ok() && !self.literals.is_null() {
                result = self.walk_pushed_jni_refs();
            }
            self.govern("JNI callout frame", result);
        }
        Ok(())
    }

    /// Native code calling back into the runtime.
    pub(super) fn walk_jni_call_in_frame(&mut self) -> Result<(), FatalWalkError> {
        self.kind = FrameKind::JniCallIn;
        self.bp = self.arg0_ea;
        let frame = layout::frame_start(&self.target, self.bp, jni_call_in_frame::SIZE);
        self.unwind_sp = frame.byte_add(-(self.literals.0 as i64));
        self.frame_flags = self.target.read_word(self.target.slot(frame, jni_call_in_frame::FLAGS))?;

        if self.walking_slots() {
            let result = self.walk_call_in_slots();
            self.govern("JNI call-in frame", result);
        }

        if !self.els.is_null() {
            self.els = self
                .target
                .read_addr(self.target.slot(self.els, entry_local_storage::OLD_ELS))?;
        }
        self.i2j_state = if self.els.is_null() {
            Addr::NULL
        } else {
            self.target.slot(self.els, entry_local_storage::I2J_STATE)
        };
        self.arg_count = 0;
        Ok(())
    }

    fn walk_call_in_slots(&mut self) -> Result<(), LocalizedSlotError> {
        let mut pushes = self.walk_sp;
        if self.walk_sp != self.unwind_sp {
            // the call returned and left its result on the stack
            if self.pc != self.config.call_in_return_pc.byte_add(3) {
                warn!(pc = ?self.pc, "call-in frame with a return value but not at the return point");
            }
            if self.frame_flags & frame_flags::RETURNS_OBJECT != 0 {
                self.report_object(self.walk_sp, SlotType::Internal, -1)?;
            } else {
                self.report_primitive(self.walk_sp, SlotType::Internal, -1)?;
            }
            pushes = self.unwind_sp;
        }
        if !self.literals.is_null() {
            self.walk_object_pushes(pushes, self.pushed_words())?;
        }
        Ok(())
    }

    /// A method running in the interpreter, or the J2I frame of compiled
    /// code that called into it.
    pub(super) fn walk_bytecode_frame(&mut self) -> Result<(), FatalWalkError> {
        self.method = self.literals;
        if self.method.is_null() {
            self.constant_pool = Addr::NULL;
            self.arg_count = 0;
            if self.arg0_ea != self.j2i_frame {
                return Err(FatalWalkError::MissingMethod { pc: self.pc });
            }
            self.bp = self.arg0_ea;
            self.enter_j2i_frame()?;
            return Ok(());
        }

        let method = self.runtime.method(self.method)?;
        self.constant_pool = method.constant_pool;
        let pc_offset = if self.config.is_impdep1_pc(self.pc) {
            0
        } else {
            self.pc.0.wrapping_sub(method.bytecodes.0)
        };
        self.bytecode_pc_offset = Some(pc_offset);
        self.arg_count = method.arg_count;

        let mut locals = method.arg_count + method.temp_count;
        self.bp = self.target.slot(self.arg0_ea, -(locals as i64));
        if method.has_hidden_slot() {
            locals += 1;
            self.bp = self.target.slot(self.bp, -1);
        }

        if self.bp == self.j2i_frame {
            self.enter_j2i_frame()?;
        } else {
            self.kind = FrameKind::Bytecode;
            self.unwind_sp = layout::frame_start(&self.target, self.bp, stack_frame::SIZE);
            self.frame_flags = 0;
        }

        if self.walking_slots() {
            let pending = self.target.words_between(self.unwind_sp, self.walk_sp).max(0) as usize;
            let frame = BytecodeSlots {
                method: self.method,
                pc_offset,
                pending_base: self.target.slot(self.unwind_sp, -1),
                pending,
                local_base: self.arg0_ea,
                locals,
                at_entry_check: true,
            };
            let mut result = self.walk_method_class();
            if result.is_ok() {
                result = self.walk_bytecode_frame_slots(&method, &frame);
            }
            self.govern("bytecode frame", result);
        }
        Ok(())
    }

    fn enter_j2i_frame(&mut self) -> Result<(), FatalWalkError> {
        let saved = self.j2i_saved_registers();
        self.kind = FrameKind::J2iTransition;
        self.unwind_sp = layout::frame_start(&self.target, self.bp, j2i_frame::size(saved));
        self.frame_flags = self
            .target
            .read_word(self.target.slot(self.unwind_sp, j2i_frame::flags(saved)))?;
        Ok(())
    }

    /// The locals and operand stack of one interpreted activation. Shared by
    /// live frames and the frames saved in OSR buffers.
    pub(super) fn walk_bytecode_frame_slots(
        &mut self,
        method: &MethodInfo,
        frame: &BytecodeSlots,
    ) -> Result<(), LocalizedSlotError> {
        check_slot_count("local count", frame.locals)?;
        check_slot_count("pending stack height", frame.pending)?;

        let mut mapped = frame.locals;
        if method.has_hidden_slot() && mapped > 0 {
            let hidden = self.target.slot(frame.local_base, 1 - frame.locals as i64);
            self.report_object(hidden, SlotType::Internal, -1)?;
            mapped -= 1;
        }

        if mapped != 0 {
            let at_entry = frame.at_entry_check
                && (self.target.read_word(self.bp)? & A0_INVISIBLE_TAG != 0
                    || self.previous_frame_flags & frame_flags::METHOD_ENTRY != 0);
            let bits = if at_entry {
                argument_bits(method, mapped)?
            } else {
                self.runtime
                    .local_map(frame.method, frame.pc_offset, mapped, self.config.local_mapper)?
            };
            self.walk_described_pushes(frame.local_base, mapped, &bits, SlotType::MethodLocal)?;
        }

        if frame.pending != 0 {
            let bits = self
                .runtime
                .pending_stack_map(frame.method, frame.pc_offset, frame.pending)?;
            self.walk_described_pushes(frame.pending_base, frame.pending, &bits, SlotType::Pending)?;
        }
        Ok(())
    }
}

/// Where the slots of one interpreted activation live.
#[derive(Debug, Clone, Copy)]
pub(super) struct BytecodeSlots {
    pub(super) method: Addr,
    pub(super) pc_offset: u64,
    /// Highest operand stack slot.
    pub(super) pending_base: Addr,
    pub(super) pending: usize,
    /// Highest local, the first argument.
    pub(super) local_base: Addr,
    /// Locals including the hidden slot.
    pub(super) locals: usize,
    /// Frames at method entry have only their arguments set.
    pub(super) at_entry_check: bool,
}
