//! The stack walk.
//!
//! A walk starts at the thread's saved state and moves from the newest frame
//! towards the oldest. The dispatcher in this file classifies the saved PC
//! of every frame: small values tag the special frames the interpreter
//! pushes, the call-in return point marks a JNI call-in, and everything else
//! is the PC of a bytecoded method. Whenever a frame says the code below it
//! is compiled, the compiled-frame walker in [`jit`] takes over until it
//! arrives back at an interpreter frame.


mod interp;
mod jit;
mod resolve;
mod slots;

use alloc::vec::Vec;

use crate::{
    arch::ArchLayout,
    config::WalkerConfig,
    error::{FatalWalkError, WalkError},
    governor::CorruptionGovernor,
    layout::{self, entry_local_storage, frame_flags, stack_frame, FrameTag, A0_INVISIBLE_TAG},
    memory::{MemoryView, Target},
    metadata::CompiledMethod,
    report::{Frame, FrameAction, FrameKind, WalkCallbacks},
    runtime::{Runtime, WalkStart, WalkThread},
    spill::RegisterFile,
    Addr, Result, WalkFlags,
};

/// What a walk should do, beyond the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalkOptions {
    pub flags: WalkFlags,
    /// Visible frames to pass over before reporting. Only honored with
    /// `VISIBLE_ONLY`.
    pub skip_count: usize,
    /// Frames to report with `COUNT_SPECIFIED`.
    pub max_frames: usize,
    /// Start somewhere other than the thread's saved state.
    pub start: Option<WalkStart>,
}

impl WalkOptions {
    pub fn new(flags: WalkFlags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    /// Stop once `frames` frames were reported.
    pub fn with_max_frames(mut self, frames: usize) -> Self {
        self.flags |= WalkFlags::COUNT_SPECIFIED;
        self.max_frames = frames;
        self
    }

    pub fn with_skip_count(mut self, skip: usize) -> Self {
        self.skip_count = skip;
        self
    }

    pub fn starting_at(mut self, start: WalkStart) -> Self {
        self.start = Some(start);
        self
    }
}

/// How the walk went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkReturnCode {
    None,
    StackCorrupt,
}

/// Per-frame values collected with the `CACHE_*` flags, in walk order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameCache {
    pub pcs: Vec<Addr>,
    pub constant_pools: Vec<Addr>,
    pub methods: Vec<Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkResult {
    pub rc: WalkReturnCode,
    pub frames_walked: usize,
    pub cache: FrameCache,
    /// Why the walk was cut short, when it was.
    pub error: Option<FatalWalkError>,
}

impl WalkResult {
    /// The result, or the error that aborted the walk.
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(err) => Err(WalkError::Fatal(err)),
            None => Ok(self),
        }
    }
}

/// Walks the stacks of one runtime.
///
/// The corruption budget lives here and is restored at the start of every
/// walk, so one walker can be reused across threads.
pub struct StackWalker<'w> {
    config: &'w WalkerConfig,
    runtime: &'w dyn Runtime,
    memory: &'w dyn MemoryView,
    governor: CorruptionGovernor,
}

impl<'w> StackWalker<'w> {
    pub fn new(config: &'w WalkerConfig, runtime: &'w dyn Runtime, memory: &'w dyn MemoryView) -> Self {
        Self {
            config,
            runtime,
            memory,
            governor: CorruptionGovernor::new(config.corruption_budget),
        }
    }

    /// Walks `thread`, reporting to `callbacks`.
    ///
    /// Fails only when the options cannot work. A stack that turns out to be
    /// broken still gives `Ok`, with `STACK_CORRUPT` and the error attached.
    #[instrument(level = "debug", skip_all, fields(thread = ?thread.thread))]
    pub fn walk(
        &mut self,
        thread: &WalkThread,
        options: &WalkOptions,
        callbacks: Option<&mut dyn WalkCallbacks>,
    ) -> Result<WalkResult> {
        let iterating = WalkFlags::ITERATE_FRAMES | WalkFlags::ITERATE_O_SLOTS | WalkFlags::ITERATE_METHOD_CLASS_SLOTS;
        if options.flags.intersects(iterating) && callbacks.is_none() {
            return Err(WalkError::UnsupportedConfiguration(
                "frame or slot iteration without callbacks",
            ));
        }

        self.governor.reset();
        let mut rc = if thread.stack_corrupt {
            WalkReturnCode::StackCorrupt
        } else {
            WalkReturnCode::None
        };

        let mut state = WalkState::new(self.config, self.runtime, self.memory, &mut self.governor, callbacks, thread, options);
        state.redirect_to_live_jit_frame(thread);
        state.adjust_flags();
        debug!(flags = ?state.flags, pc = ?state.pc, sp = ?state.walk_sp, "starting walk");

        let outcome = if state.flags.contains(WalkFlags::COUNT_SPECIFIED) && state.max_frames == 0 {
            Ok(())
        } else {
            state.run()
        };
        let WalkState { frames_walked, cache, .. } = state;

        let error = match outcome {
            Ok(()) => None,
            Err(err) => {
                warn!(%err, frames_walked, "walk aborted");
                rc = WalkReturnCode::StackCorrupt;
                Some(err)
            }
        };
        if self.governor.is_disabled() {
            rc = WalkReturnCode::StackCorrupt;
        }
        debug!(?rc, frames_walked, "walk done");

        Ok(WalkResult {
            rc,
            frames_walked,
            cache,
            error,
        })
    }
}

/// Walks one thread with a fresh walker.
pub fn walk_stack(
    config: &WalkerConfig,
    runtime: &dyn Runtime,
    memory: &dyn MemoryView,
    thread: &WalkThread,
    options: &WalkOptions,
    callbacks: Option<&mut dyn WalkCallbacks>,
) -> Result<WalkResult> {
    StackWalker::new(config, runtime, memory).walk(thread, options, callbacks)
}

/// Everything the walk knows about the frame it is looking at.
pub(super) struct WalkState<'a, 'c> {
    config: &'a WalkerConfig,
    layout: &'static dyn ArchLayout,
    target: Target<'a>,
    runtime: &'a dyn Runtime,
    governor: &'a mut CorruptionGovernor,
    callbacks: Option<&'c mut dyn WalkCallbacks>,

    thread: Addr,
    flags: WalkFlags,
    skip_count: usize,
    max_frames: usize,

    kind: FrameKind,
    pc: Addr,
    pc_address: Addr,
    walk_sp: Addr,
    sp: Addr,
    unwind_sp: Addr,
    bp: Addr,
    arg0_ea: Addr,
    literals: Addr,
    method: Addr,
    constant_pool: Addr,
    frame_flags: u64,
    previous_frame_flags: u64,
    resolve_frame_flags: u64,
    arg_count: usize,
    outgoing_arg_count: usize,
    bytecode_pc_offset: Option<u64>,
    jit_info: Option<CompiledMethod<'a>>,
    inline_depth: usize,

    els: Addr,
    i2j_state: Addr,
    j2i_frame: Addr,
    decompilation_stack: Addr,
    decompilation_record: Addr,
    registers: RegisterFile,

    frames_walked: usize,
    cache: FrameCache,
}

impl<'a, 'c> WalkState<'a, 'c> {
    fn new(
        config: &'a WalkerConfig,
        runtime: &'a dyn Runtime,
        memory: &'a dyn MemoryView,
        governor: &'a mut CorruptionGovernor,
        callbacks: Option<&'c mut dyn WalkCallbacks>,
        thread: &WalkThread,
        options: &WalkOptions,
    ) -> Self {
        let layout = config.layout();
        let target = Target::new(memory, config.word_size(), config.endian);
        let start = options.start.unwrap_or(WalkStart {
            sp: thread.sp,
            arg0_ea: thread.arg0_ea,
            pc: thread.pc,
            literals: thread.literals,
            entry_local_storage: thread.entry_local_storage,
        });
        let els = start.entry_local_storage;
        let i2j_state = if els.is_null() {
            Addr::NULL
        } else {
            target.slot(els, entry_local_storage::I2J_STATE)
        };

        Self {
            config,
            layout,
            target,
            runtime,
            governor,
            callbacks,
            thread: thread.thread,
            flags: options.flags,
            skip_count: options.skip_count,
            max_frames: options.max_frames,
            kind: FrameKind::Bytecode,
            pc: start.pc,
            pc_address: thread.pc_address,
            walk_sp: start.sp,
            sp: start.sp,
            unwind_sp: Addr::NULL,
            bp: Addr::NULL,
            arg0_ea: start.arg0_ea,
            literals: start.literals,
            method: Addr::NULL,
            constant_pool: Addr::NULL,
            frame_flags: 0,
            previous_frame_flags: 0,
            resolve_frame_flags: 0,
            arg_count: 0,
            outgoing_arg_count: 0,
            bytecode_pc_offset: None,
            jit_info: None,
            inline_depth: 0,
            els,
            i2j_state,
            j2i_frame: thread.j2i_frame,
            decompilation_stack: thread.decompilation_stack,
            decompilation_record: Addr::NULL,
            registers: RegisterFile::new(layout),
            frames_walked: 0,
            cache: FrameCache::default(),
        }
    }

    /// A thread stopped in compiled code has no saved state for its newest
    /// frames. Its registers do.
    fn redirect_to_live_jit_frame(&mut self, thread: &WalkThread) {
        if !thread.has_os_thread {
            return;
        }
        let memory = self.target.view();
        let Some(ip) = memory.register(self.layout.instruction_pointer_register()).map(Addr) else {
            return;
        };
        if self.runtime.metadata_for_pc(self.layout.mask_pc(ip)).is_none() {
            return;
        }
        let Some(sp) = memory
            .register(self.layout.java_sp_register())
            .map(Addr)
            .filter(|sp| !sp.is_null())
        else {
            return;
        };
        debug!(?ip, ?sp, "thread is running compiled code, starting at its registers");
        self.walk_sp = sp;
        self.sp = sp;
        self.pc = ip;
        self.flags |= WalkFlags::START_AT_JIT_FRAME | WalkFlags::RECORD_BYTECODE_PC_OFFSET;
    }

    fn adjust_flags(&mut self) {
        if self.flags == WalkFlags::ITERATE_O_SLOTS {
            self.flags |= WalkFlags::SKIP_INLINES;
        }
        if self.flags.contains(WalkFlags::ITERATE_O_SLOTS) {
            self.flags |= WalkFlags::MAINTAIN_REGISTER_MAP;
        }
    }

    /// The frame loop. Returns normally at the end of the stack, at an
    /// unknown special frame and when a callback stops the walk.
    fn run(&mut self) -> Result<(), FatalWalkError> {
        let mut start_at_jit = self.flags.contains(WalkFlags::START_AT_JIT_FRAME);
        loop {
            if !start_at_jit {
                self.constant_pool = Addr::NULL;
                self.unwind_sp = Addr::NULL;
                self.method = Addr::NULL;
                self.sp = self.target.slot(self.walk_sp, -(self.arg_count as i64));
                self.outgoing_arg_count = self.arg_count;
                self.bytecode_pc_offset = None;

                match FrameTag::classify(self.pc) {
                    FrameTag::EndOfStack => {
                        trace!("end of stack");
                        return Ok(());
                    }
                    FrameTag::GenericSpecial => self.walk_generic_special_frame()?,
                    FrameTag::Method | FrameTag::NativeMethod | FrameTag::JniNativeMethod => self.walk_method_frame()?,
                    FrameTag::MethodType => self.walk_method_type_frame()?,
                    FrameTag::JitResolve => self.walk_jit_resolve_frame()?,
                    FrameTag::JitJniCallout => self.walk_jit_jni_callout_frame()?,
                    FrameTag::UnknownSpecial(tag) => {
                        warn!(tag, sp = ?self.walk_sp, "unknown special frame, ending walk");
                        return Ok(());
                    }
                    FrameTag::ReturnAddress if self.config.is_call_in_pc(self.pc) => self.walk_jni_call_in_frame()?,
                    FrameTag::ReturnAddress => self.walk_bytecode_frame()?,
                }

                let fixed = layout::frame_start(&self.target, self.bp, stack_frame::SIZE);
                let next_pc = self.target.read_addr(self.target.slot(fixed, stack_frame::SAVED_PC))?;
                if self.walk_frame()? == FrameAction::Stop {
                    return Ok(());
                }
                self.previous_frame_flags = self.frame_flags;
                self.resolve_frame_flags = 0;

                if self.frame_flags & frame_flags::TRANSITION_TO_INTERPRETER_MASK == 0 {
                    self.literals = self.target.read_addr(self.target.slot(fixed, stack_frame::SAVED_CP))?;
                    self.pc_address = self.target.slot(fixed, stack_frame::SAVED_PC);
                    self.walk_sp = self.target.slot(self.arg0_ea, 1);
                    self.arg0_ea = self
                        .target
                        .read_addr(self.target.slot(fixed, stack_frame::SAVED_A0))?
                        .untag(frame_flags::ARGS_ALIGNED_TAG | A0_INVISIBLE_TAG);
                    self.pc = next_pc;
                    continue;
                }
            }

            start_at_jit = false;
            if self.jit_walk_stack_frames()? == FrameAction::Stop {
                return Ok(());
            }
            self.decompilation_record = Addr::NULL;
        }
    }

    /// Decides whether the current frame is shown to the caller and counts
    /// it if so.
    fn walk_frame(&mut self) -> Result<FrameAction, FatalWalkError> {
        if self.flags.contains(WalkFlags::VISIBLE_ONLY) {
            if FrameTag::is_native(self.pc) && !self.flags.contains(WalkFlags::INCLUDE_NATIVES) {
                return Ok(FrameAction::Continue);
            }
            if self.jit_info.is_none() && self.target.read_word(self.bp)? & A0_INVISIBLE_TAG != 0 {
                let shown_call_in =
                    self.flags.contains(WalkFlags::INCLUDE_CALL_IN_FRAMES) && self.pc == self.config.call_in_return_pc;
                if !shown_call_in {
                    return Ok(FrameAction::Continue);
                }
            }
            if self.skip_count > 0 {
                self.skip_count -= 1;
                return Ok(FrameAction::Continue);
            }
            if self.flags.contains(WalkFlags::HIDE_EXCEPTION_FRAMES) && !self.method.is_null() {
                let method = self.runtime.method(self.method)?;
                if !method.is_static() {
                    if method.name.starts_with('<')
                        && self.target.read_addr(self.arg0_ea)? == self.config.restart_exception
                    {
                        return Ok(FrameAction::Continue);
                    }
                    self.flags.remove(WalkFlags::HIDE_EXCEPTION_FRAMES);
                }
            }
        }

        self.frames_walked += 1;
        self.cache_frame();
        debug!(
            kind = ?self.kind,
            pc = ?self.pc,
            bp = ?self.bp,
            method = ?self.method,
            frames_walked = self.frames_walked,
            "frame"
        );

        let counted_out = self.flags.contains(WalkFlags::COUNT_SPECIFIED) && self.frames_walked == self.max_frames;
        let mut action = FrameAction::Continue;
        if self.flags.contains(WalkFlags::ITERATE_FRAMES) {
            let frame = self.frame();
            if let Some(callbacks) = self.callbacks.as_deref_mut() {
                action = callbacks.on_frame(&frame);
            }
        }
        if counted_out {
            action = FrameAction::Stop;
        }
        Ok(action)
    }

    fn cache_frame(&mut self) {
        if self.flags.contains(WalkFlags::CACHE_PCS) {
            self.cache.pcs.push(self.pc);
        }
        if self.flags.contains(WalkFlags::CACHE_CPS) {
            self.cache.constant_pools.push(self.constant_pool);
        }
        if self.flags.contains(WalkFlags::CACHE_METHODS) {
            self.cache.methods.push(self.method);
        }
    }

    /// The current frame as callbacks see it.
    fn frame(&self) -> Frame {
        Frame {
            thread: self.thread,
            kind: self.kind,
            pc: self.pc,
            bp: self.bp,
            sp: self.sp,
            unwind_sp: self.unwind_sp,
            arg0_ea: self.arg0_ea,
            literals: self.literals,
            method: self.method,
            constant_pool: self.constant_pool,
            frame_flags: self.frame_flags,
            jit_info: self.jit_info.map_or(Addr::NULL, |method| method.address),
            inline_depth: self.inline_depth,
            bytecode_pc_offset: self.bytecode_pc_offset,
            arg_count: self.arg_count,
            outgoing_arg_count: self.outgoing_arg_count,
            frames_walked: self.frames_walked,
            walk_flags: self.flags,
        }
    }
}
