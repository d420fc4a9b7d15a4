//! Walker configuration, resolved once per runtime image.

use alloc::vec::Vec;

use crate::{
    arch::{Arch, ArchLayout},
    error::WalkError,
    memory::Endian,
    Addr,
};

/// Localized slot failures tolerated per walk before slot iteration stops.
pub const DEFAULT_CORRUPTION_BUDGET: u32 = 5;

/// Oldest runtime format the walker understands.
pub const MIN_FORMAT_VERSION: u32 = 1;

/// Which bytecode local mapper answers "is this local a reference".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalMapper {
    /// Liveness analysis: dead locals are not reported.
    #[default]
    Liveness,
    /// A debugger may read any local, so every reference-typed local in scope
    /// is reported.
    Debug,
}

/// Everything about the walked runtime that does not change between walks.
///
/// Build one with [`WalkerConfig::for_version`] from the format version the
/// runtime image declares, then refine it with the `with_*` setters.
#[derive(Debug, Clone)]
pub struct WalkerConfig {
    pub arch: Arch,
    pub endian: Endian,
    pub format_version: u32,
    /// Localized slot failures tolerated per walk before slot iteration is
    /// switched off. Zero and one both give up on the first failure.
    pub corruption_budget: u32,
    /// Return address of the interpreter's call-in stub. A saved PC equal to
    /// it, or to it plus 3, marks a JNI call-in frame.
    pub call_in_return_pc: Addr,
    /// The bytecode address natives run at. Frames there report offset 0.
    pub impdep1_pc: Addr,
    /// Return addresses compiled code uses to get back into the interpreter.
    /// An empty table skips the check.
    pub i2j_return_table: Vec<Addr>,
    /// The exception whose constructor frames `HIDE_EXCEPTION_FRAMES` hides.
    pub restart_exception: Addr,
    /// Map records start word aligned, which forces 4 byte offsets.
    pub aligned_stack_maps: bool,
    /// Method metadata carries explicit offset-size flags.
    pub metadata_size_flags: bool,
    /// The stack grower redirected non-reference slots of JNI frames.
    pub indirect_primitive_slots: bool,
    pub local_mapper: LocalMapper,
    /// s390 saves vector registers in the float save area.
    pub vector_registers: bool,
}

impl WalkerConfig {
    /// Resolves the per-version walker behavior for a runtime image.
    pub fn for_version(format_version: u32, arch: Arch) -> Result<Self, WalkError> {
        if format_version < MIN_FORMAT_VERSION {
            return Err(WalkError::UnsupportedConfiguration("runtime format version too old"));
        }
        Ok(Self {
            arch,
            endian: arch.layout().default_endian(),
            format_version,
            corruption_budget: DEFAULT_CORRUPTION_BUDGET,
            call_in_return_pc: Addr::NULL,
            impdep1_pc: Addr::NULL,
            i2j_return_table: Vec::new(),
            restart_exception: Addr::NULL,
            aligned_stack_maps: false,
            metadata_size_flags: format_version >= 2,
            indirect_primitive_slots: format_version < 2,
            local_mapper: LocalMapper::Liveness,
            vector_registers: false,
        })
    }

    /// Resolves the configuration from the names a core file declares.
    pub fn for_image(format_version: u32, arch_name: &str) -> Result<Self, WalkError> {
        Self::for_version(format_version, Arch::from_name(arch_name)?)
    }

    pub fn layout(&self) -> &'static dyn ArchLayout {
        self.arch.layout()
    }

    pub fn word_size(&self) -> usize {
        self.layout().word_size()
    }

    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    pub fn with_corruption_budget(mut self, budget: u32) -> Self {
        self.corruption_budget = budget;
        self
    }

    pub fn with_call_in_return_pc(mut self, pc: Addr) -> Self {
        self.call_in_return_pc = pc;
        self
    }

    pub fn with_impdep1_pc(mut self, pc: Addr) -> Self {
        self.impdep1_pc = pc;
        self
    }

    pub fn with_i2j_return_table(mut self, table: Vec<Addr>) -> Self {
        self.i2j_return_table = table;
        self
    }

    pub fn with_restart_exception(mut self, exception: Addr) -> Self {
        self.restart_exception = exception;
        self
    }

    pub fn with_aligned_stack_maps(mut self, aligned: bool) -> Self {
        self.aligned_stack_maps = aligned;
        self
    }

    pub fn with_local_mapper(mut self, mapper: LocalMapper) -> Self {
        self.local_mapper = mapper;
        self
    }

    pub fn with_vector_registers(mut self, enabled: bool) -> Self {
        self.vector_registers = enabled;
        self
    }

    pub(crate) fn is_call_in_pc(&self, pc: Addr) -> bool {
        !self.call_in_return_pc.is_null()
            && (pc == self.call_in_return_pc || pc == self.call_in_return_pc.byte_add(3))
    }

    pub(crate) fn is_impdep1_pc(&self, pc: Addr) -> bool {
        !self.impdep1_pc.is_null() && (pc == self.impdep1_pc || pc == self.impdep1_pc.byte_add(3))
    }
}
