bitflags::bitflags! {
    /// What a walk reports and which frames it shows.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WalkFlags: u32 {
        /// Call `on_frame` for every visible frame.
        const ITERATE_FRAMES = 1 << 0;
        /// Report every object reference slot.
        const ITERATE_O_SLOTS = 1 << 1;
        /// Report the class object slot of every method on the stack,
        /// including methods inlined into compiled frames.
        const ITERATE_METHOD_CLASS_SLOTS = 1 << 2;
        /// Track where compiled code spilled each register.
        const MAINTAIN_REGISTER_MAP = 1 << 3;
        /// Report only physical compiled frames.
        const SKIP_INLINES = 1 << 4;
        /// Hide frames the language hides from stack traces.
        const VISIBLE_ONLY = 1 << 5;
        /// With `VISIBLE_ONLY`, still show native method frames.
        const INCLUDE_NATIVES = 1 << 6;
        /// With `VISIBLE_ONLY`, still show JNI call-in frames.
        const INCLUDE_CALL_IN_FRAMES = 1 << 7;
        /// Report the half-built compiled frame under stack-overflow and
        /// failed-monitor-enter resolve frames.
        const INCLUDE_HIDDEN_JIT_FRAMES = 1 << 8;
        /// Skip exception constructor frames above the restart exception.
        const HIDE_EXCEPTION_FRAMES = 1 << 9;
        /// Stop after `max_frames` frames.
        const COUNT_SPECIFIED = 1 << 10;
        /// The start state is a compiled frame's register state.
        const START_AT_JIT_FRAME = 1 << 11;
        /// Compute the bytecode offset of compiled frames.
        const RECORD_BYTECODE_PC_OFFSET = 1 << 12;
        /// Collect the pc of every counted frame.
        const CACHE_PCS = 1 << 13;
        /// Collect the constant pool of every counted frame.
        const CACHE_CPS = 1 << 14;
        /// Collect the method of every counted frame.
        const CACHE_METHODS = 1 << 15;

        const CACHE_MASK = Self::CACHE_PCS.bits() | Self::CACHE_CPS.bits() | Self::CACHE_METHODS.bits();
    }
}
